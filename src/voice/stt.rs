//! Cloud speech-to-text for the wake-word recognizer

use serde::Deserialize;

use super::codec::samples_to_wav;
use crate::config::SttProviderKind;
use crate::{Error, Result};

const WHISPER_URL: &str = "https://api.openai.com/v1/audio/transcriptions";
const DEEPGRAM_URL: &str = "https://api.deepgram.com/v1/listen";

/// Response from OpenAI Whisper transcription API
#[derive(Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Response from Deepgram transcription API
#[derive(Deserialize)]
struct DeepgramResponse {
    results: DeepgramResults,
}

#[derive(Deserialize)]
struct DeepgramResults {
    channels: Vec<DeepgramChannel>,
}

#[derive(Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(Deserialize)]
struct DeepgramAlternative {
    transcript: String,
}

impl DeepgramResponse {
    fn into_transcript(self) -> String {
        self.results
            .channels
            .into_iter()
            .next()
            .and_then(|c| c.alternatives.into_iter().next())
            .map(|a| a.transcript)
            .unwrap_or_default()
    }
}

/// Transcribes short utterances
#[derive(Debug, Clone)]
pub struct SpeechToText {
    client: reqwest::Client,
    api_key: String,
    model: String,
    provider: SttProviderKind,
}

impl SpeechToText {
    /// Create a client for `provider`
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing
    pub fn new(provider: SttProviderKind, api_key: Option<String>, model: String) -> Result<Self> {
        let api_key = api_key.filter(|k| !k.is_empty()).ok_or_else(|| {
            Error::Config(match provider {
                SttProviderKind::Whisper => "OPENAI_API_KEY required for Whisper".to_string(),
                SttProviderKind::Deepgram => "DEEPGRAM_API_KEY required for Deepgram".to_string(),
            })
        })?;

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            provider,
        })
    }

    /// Transcribe mono samples
    ///
    /// # Errors
    ///
    /// Returns error if encoding or the transcription request fails
    pub async fn transcribe_samples(&self, samples: &[f32], sample_rate: u32) -> Result<String> {
        let wav = samples_to_wav(samples, sample_rate)?;
        self.transcribe(wav).await
    }

    /// Transcribe WAV bytes
    ///
    /// # Errors
    ///
    /// Returns error if transcription fails
    pub async fn transcribe(&self, wav: Vec<u8>) -> Result<String> {
        tracing::debug!(audio_bytes = wav.len(), provider = ?self.provider, "transcribing utterance");

        let text = match self.provider {
            SttProviderKind::Whisper => self.transcribe_whisper(wav).await?,
            SttProviderKind::Deepgram => self.transcribe_deepgram(wav).await?,
        };

        tracing::debug!(transcript = %text, "transcription complete");
        Ok(text)
    }

    async fn transcribe_whisper(&self, wav: Vec<u8>) -> Result<String> {
        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(wav)
                    .file_name("utterance.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Stt(e.to_string()))?,
            )
            .text("model", self.model.clone());

        let response = self
            .client
            .post(WHISPER_URL)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;

        let response = check_status(response, "Whisper").await?;
        let result: WhisperResponse = response.json().await?;
        Ok(result.text)
    }

    async fn transcribe_deepgram(&self, wav: Vec<u8>) -> Result<String> {
        let response = self
            .client
            .post(DEEPGRAM_URL)
            .query(&[("model", self.model.as_str()), ("punctuate", "true")])
            .header("Authorization", format!("Token {}", self.api_key))
            .header("Content-Type", "audio/wav")
            .body(wav)
            .send()
            .await?;

        let response = check_status(response, "Deepgram").await?;
        let result: DeepgramResponse = response.json().await?;
        Ok(result.into_transcript())
    }
}

async fn check_status(response: reqwest::Response, provider: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    tracing::error!(status = %status, body = %body, provider, "transcription API error");
    Err(Error::Stt(format!("{provider} API error {status}: {body}")))
}
