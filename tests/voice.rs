//! Voice pipeline integration tests
//!
//! Tests voice components without requiring audio hardware

use std::io::Cursor;
use std::time::Duration;

use ohm_voice::voice::{
    AudioFrame, CAPTURE_FRAME_SIZE, CAPTURE_SAMPLE_RATE, EncodedChunk, SpeechSegmenter,
    VoiceActivityDetector, VoiceSignal, WakeWordListener, codec,
};
use ohm_voice::voice::{RecognitionEvent, RecognitionHandle, Recognizer};
use ohm_voice::{Error, Result};
use tokio::sync::mpsc;
use tokio::time::Instant;

mod common;

/// Generate sine wave audio samples at the capture rate
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn generate_sine_samples(frequency: f32, duration_secs: f32, amplitude: f32) -> Vec<f32> {
    let num_samples = (CAPTURE_SAMPLE_RATE as f32 * duration_secs) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / CAPTURE_SAMPLE_RATE as f32;
            amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}

/// Generate silence
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn generate_silence(duration_secs: f32) -> Vec<f32> {
    vec![0.0; (CAPTURE_SAMPLE_RATE as f32 * duration_secs) as usize]
}

#[test]
fn test_capture_frame_survives_transport() {
    let samples = generate_sine_samples(440.0, 0.1, 0.5);
    let frame = AudioFrame::mono(samples.clone(), CAPTURE_SAMPLE_RATE);

    let chunk = codec::encode(&frame);
    assert!(chunk.mime_type.starts_with("audio/pcm"));

    let buffer = codec::decode(&chunk, CAPTURE_SAMPLE_RATE, 1).unwrap();
    assert_eq!(buffer.samples.len(), samples.len());
    let max_err = samples
        .iter()
        .zip(&buffer.samples)
        .map(|(a, b)| (a - b).abs())
        .fold(0.0f32, f32::max);
    assert!(max_err < 1.0 / 16000.0, "quantization error {max_err}");
}

#[test]
fn test_out_of_range_samples_are_clamped() {
    let frame = AudioFrame::mono(vec![2.0, -2.0, f32::NAN], 16000);
    let buffer = codec::decode(&codec::encode(&frame), 16000, 1).unwrap();

    assert!((buffer.samples[0] - 32767.0 / 32768.0).abs() < 1e-6);
    assert!((buffer.samples[1] + 1.0).abs() < 1e-6);
    assert!(buffer.samples[2].abs() < 1e-6);
}

#[test]
fn test_model_audio_is_resampled_to_sink_rate() {
    let samples = vec![0.25; 2400];
    let chunk = codec::encode(&AudioFrame::mono(samples, 24000));

    let buffer = codec::decode(&chunk, 48000, 1).unwrap();

    assert_eq!(buffer.sample_rate, 48000);
    assert_eq!(buffer.frames(), 4800);
    assert!((buffer.duration() - 0.1).abs() < 1e-9);
}

#[test]
fn test_untagged_audio_is_read_as_24k() {
    let tagged = codec::encode(&AudioFrame::mono(vec![0.1; 240], 24000));
    let untagged = EncodedChunk {
        data: tagged.data,
        mime_type: "audio/pcm".to_string(),
    };

    let buffer = codec::decode(&untagged, 24000, 1).unwrap();
    assert_eq!(buffer.frames(), 240);
}

#[test]
fn test_malformed_audio_is_a_decode_error() {
    let cases = [
        EncodedChunk::pcm(String::new(), 24000),
        EncodedChunk::pcm("%%%".to_string(), 24000),
        // Three bytes: not a whole 16-bit sample
        EncodedChunk::pcm("AAAA".to_string(), 24000),
    ];

    for chunk in &cases {
        assert!(
            matches!(codec::decode(chunk, 24000, 1), Err(Error::Decode(_))),
            "{chunk:?}"
        );
    }
}

#[test]
fn test_samples_to_wav_is_valid_wav() {
    let samples = generate_sine_samples(440.0, 0.5, 0.5);
    let wav = codec::samples_to_wav(&samples, CAPTURE_SAMPLE_RATE).unwrap();

    assert_eq!(&wav[0..4], b"RIFF");
    assert_eq!(&wav[8..12], b"WAVE");

    let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
    let spec = reader.spec();
    assert_eq!(spec.channels, 1);
    assert_eq!(spec.sample_rate, CAPTURE_SAMPLE_RATE);
    assert_eq!(spec.bits_per_sample, 16);
    assert_eq!(reader.len() as usize, samples.len());
}

#[test]
fn test_vad_tracks_spoken_phrase() {
    let mut vad = VoiceActivityDetector::default();
    let t0 = Instant::now();
    let speech = generate_sine_samples(220.0, 0.5, 0.3);
    let silence = generate_silence(0.5);

    let mut at = t0;
    let step = Duration::from_millis(100);
    for block in speech.chunks(1600) {
        assert_eq!(vad.observe(block, at), VoiceSignal::Speaking);
        at += step;
    }

    // The first silent block still falls inside the hold window
    let mut silent_at = None;
    for block in silence.chunks(1600) {
        if vad.observe(block, at) == VoiceSignal::Silent && silent_at.is_none() {
            silent_at = Some(at);
        }
        at += step;
    }

    let silent_at = silent_at.expect("silence detected");
    assert!(silent_at - t0 >= Duration::from_millis(550));
}

#[test]
fn test_segmenter_cuts_utterance_after_silence() {
    let mut segmenter = SpeechSegmenter::default();
    let mut audio = generate_sine_samples(300.0, 1.0, 0.3);
    audio.extend(generate_silence(0.6));

    let utterances: Vec<Vec<f32>> = audio
        .chunks(CAPTURE_FRAME_SIZE)
        .filter_map(|block| segmenter.push(block))
        .collect();

    assert_eq!(utterances.len(), 1);
    assert!(utterances[0].len() >= CAPTURE_SAMPLE_RATE as usize);
    assert!(!segmenter.is_collecting());
}

#[test]
fn test_segmenter_drops_clicks() {
    let mut segmenter = SpeechSegmenter::default();
    let mut audio = generate_sine_samples(300.0, 0.1, 0.5);
    audio.extend(generate_silence(1.0));

    let utterances = audio
        .chunks(CAPTURE_FRAME_SIZE)
        .filter_map(|block| segmenter.push(block))
        .count();

    assert_eq!(utterances, 0);
    assert!(!segmenter.is_collecting());
}

/// Recognizer that never needs the microphone
struct NullRecognizer;

struct NullRun;

impl RecognitionHandle for NullRun {
    fn stop(&mut self) {}
}

impl Recognizer for NullRecognizer {
    fn start(
        &self,
        _events: mpsc::UnboundedSender<RecognitionEvent>,
    ) -> Result<Box<dyn RecognitionHandle>> {
        Ok(Box::new(NullRun))
    }
}

#[test]
fn test_wake_phrases_match_case_insensitively() {
    let listener = WakeWordListener::new(
        Box::new(NullRecognizer),
        vec!["Ohm".to_string(), " START ".to_string(), String::new()],
    );

    assert_eq!(listener.phrases(), &["ohm", "start"]);
    assert_eq!(listener.match_phrase("Hey OHM are you there"), Some("ohm"));
    assert_eq!(listener.match_phrase("let's start"), Some("start"));
    assert_eq!(listener.match_phrase("good morning"), None);
}
