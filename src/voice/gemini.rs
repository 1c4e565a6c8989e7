//! Gemini Live session over WebSocket
//!
//! Speaks the `BidiGenerateContent` protocol: one `setup` message, then
//! `realtimeInput` media chunks out and `serverContent` messages in.

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use super::audio::EncodedChunk;
use super::live::{LiveConnector, LiveLink, RemoteEvent, ServerMessage};
use crate::config::LiveConfig;
use crate::{Error, Result};

/// Opens Gemini Live sessions
#[derive(Debug, Clone)]
pub struct GeminiLiveConnector {
    config: LiveConfig,
    api_key: String,
}

impl GeminiLiveConnector {
    /// Create a connector from live-session configuration
    ///
    /// # Errors
    ///
    /// Returns error if no API key is configured
    pub fn new(config: LiveConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::Config("GEMINI_API_KEY required for live sessions".to_string()))?;

        Ok(Self { config, api_key })
    }

    fn url(&self) -> String {
        format!("{}?key={}", self.config.endpoint, self.api_key)
    }
}

impl LiveConnector for GeminiLiveConnector {
    fn connect(&self, events: mpsc::UnboundedSender<RemoteEvent>) -> Result<Box<dyn LiveLink>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Connect(format!("no async runtime: {e}")))?;

        let setup = serde_json::to_string(&SetupFrame::from_config(&self.config))?;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        tracing::debug!(model = %self.config.model, "connecting live session");
        runtime.spawn(run_session(self.url(), setup, outbound_rx, events));

        Ok(Box::new(GeminiLink {
            outbound: outbound_tx,
        }))
    }
}

/// Commands for the socket task
#[derive(Debug)]
enum Outbound {
    Media(EncodedChunk),
    Close,
}

struct GeminiLink {
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl LiveLink for GeminiLink {
    fn send(&self, chunk: EncodedChunk) -> Result<()> {
        self.outbound
            .send(Outbound::Media(chunk))
            .map_err(|_| Error::Transport("live session task has exited".to_string()))
    }

    fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

async fn run_session(
    url: String,
    setup: String,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<RemoteEvent>,
) {
    match drive_session(&url, setup, &mut outbound, &events).await {
        Ok(()) => {
            tracing::debug!("live session closed");
            let _ = events.send(RemoteEvent::Closed);
        }
        Err(e) => {
            tracing::warn!(error = %e, "live session failed");
            let _ = events.send(RemoteEvent::Error(e.to_string()));
        }
    }
}

async fn drive_session(
    url: &str,
    setup: String,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
    events: &mpsc::UnboundedSender<RemoteEvent>,
) -> Result<()> {
    let (socket, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| Error::Connect(e.to_string()))?;
    let (mut write, mut read) = socket.split();

    write
        .send(Message::Text(setup))
        .await
        .map_err(|e| Error::Connect(e.to_string()))?;

    let mut open = false;

    loop {
        tokio::select! {
            incoming = read.next() => {
                let payload = match incoming {
                    None => return Ok(()),
                    Some(Err(e)) => return Err(Error::Transport(e.to_string())),
                    Some(Ok(Message::Close(frame))) => {
                        tracing::debug!(?frame, "remote closed live session");
                        return Ok(());
                    }
                    Some(Ok(Message::Text(text))) => text.into_bytes(),
                    Some(Ok(Message::Binary(bytes))) => bytes,
                    Some(Ok(_)) => continue,
                };

                match parse_server_frame(&payload) {
                    Ok(Inbound::SetupComplete) if !open => {
                        open = true;
                        let _ = events.send(RemoteEvent::Open);
                    }
                    Ok(Inbound::Content(message)) => {
                        let _ = events.send(RemoteEvent::Message(message));
                    }
                    Ok(Inbound::GoAway) => {
                        tracing::info!("remote asked to end the live session");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "unparseable live message"),
                }
            }
            command = outbound.recv() => match command {
                Some(Outbound::Media(chunk)) => {
                    if open {
                        let frame = serde_json::to_string(&RealtimeInputFrame::media(chunk))?;
                        write
                            .send(Message::Text(frame))
                            .await
                            .map_err(|e| Error::Transport(e.to_string()))?;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }
}

/// Outbound `setup` frame
#[derive(Debug, Serialize)]
struct SetupFrame {
    setup: Setup,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup {
    model: String,
    generation_config: GenerationConfig,
    system_instruction: Content,
    output_audio_transcription: Empty,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<&'static str>,
    speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig {
    voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig {
    prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig {
    voice_name: String,
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
struct TextPart {
    text: String,
}

#[derive(Debug, Serialize)]
struct Empty {}

impl SetupFrame {
    fn from_config(config: &LiveConfig) -> Self {
        let model = if config.model.starts_with("models/") {
            config.model.clone()
        } else {
            format!("models/{}", config.model)
        };

        Self {
            setup: Setup {
                model,
                generation_config: GenerationConfig {
                    response_modalities: vec!["AUDIO"],
                    speech_config: SpeechConfig {
                        voice_config: VoiceConfig {
                            prebuilt_voice_config: PrebuiltVoiceConfig {
                                voice_name: config.voice_name.clone(),
                            },
                        },
                    },
                },
                system_instruction: Content {
                    parts: vec![TextPart {
                        text: config.system_instruction.clone(),
                    }],
                },
                output_audio_transcription: Empty {},
            },
        }
    }
}

/// Outbound `realtimeInput` frame
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInputFrame {
    realtime_input: RealtimeInput,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput {
    media_chunks: Vec<Blob>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Blob {
    #[serde(default)]
    mime_type: String,
    data: String,
}

impl RealtimeInputFrame {
    fn media(chunk: EncodedChunk) -> Self {
        Self {
            realtime_input: RealtimeInput {
                media_chunks: vec![Blob {
                    mime_type: chunk.mime_type,
                    data: chunk.data,
                }],
            },
        }
    }
}

/// Inbound frame, only the fields the voice core consumes
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerFrame {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    go_away: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    interrupted: bool,
    output_transcription: Option<Transcription>,
}

#[derive(Debug, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<Blob>,
}

#[derive(Debug, Deserialize)]
struct Transcription {
    text: Option<String>,
}

/// What a parsed inbound frame means to the session
#[derive(Debug, PartialEq, Eq)]
enum Inbound {
    SetupComplete,
    Content(ServerMessage),
    GoAway,
    Ignored,
}

fn parse_server_frame(payload: &[u8]) -> Result<Inbound> {
    let frame: ServerFrame = serde_json::from_slice(payload)?;

    if frame.setup_complete.is_some() {
        return Ok(Inbound::SetupComplete);
    }

    if let Some(content) = frame.server_content {
        let audio = content
            .model_turn
            .into_iter()
            .flat_map(|turn| turn.parts)
            .filter_map(|part| part.inline_data)
            .find(|blob| blob.mime_type.is_empty() || blob.mime_type.starts_with("audio/"))
            .map(|blob| EncodedChunk {
                data: blob.data,
                mime_type: blob.mime_type,
            });

        let transcript = content
            .output_transcription
            .and_then(|t| t.text)
            .filter(|t| !t.trim().is_empty());

        if audio.is_none() && !content.interrupted && transcript.is_none() {
            return Ok(Inbound::Ignored);
        }

        return Ok(Inbound::Content(ServerMessage {
            audio,
            interrupted: content.interrupted,
            transcript,
        }));
    }

    if frame.go_away.is_some() {
        return Ok(Inbound::GoAway);
    }

    Ok(Inbound::Ignored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LiveConfig;

    #[test]
    fn test_setup_frame_shape() {
        let config = LiveConfig::default();
        let json = serde_json::to_value(SetupFrame::from_config(&config)).unwrap();

        let setup = &json["setup"];
        assert!(setup["model"].as_str().unwrap().starts_with("models/"));
        assert_eq!(setup["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            setup["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
                ["voiceName"],
            "Kore"
        );
        assert!(setup["systemInstruction"]["parts"][0]["text"]
            .as_str()
            .unwrap()
            .contains("OhM"));
        assert!(setup["outputAudioTranscription"].is_object());
    }

    #[test]
    fn test_media_frame_shape() {
        let chunk = EncodedChunk::pcm("AAAA".to_string(), 16000);
        let json = serde_json::to_value(RealtimeInputFrame::media(chunk)).unwrap();

        let blob = &json["realtimeInput"]["mediaChunks"][0];
        assert_eq!(blob["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(blob["data"], "AAAA");
    }

    #[test]
    fn test_parse_setup_complete() {
        assert_eq!(
            parse_server_frame(br#"{"setupComplete":{}}"#).unwrap(),
            Inbound::SetupComplete
        );
    }

    #[test]
    fn test_parse_audio_and_transcript() {
        let payload = br#"{"serverContent":{
            "modelTurn":{"parts":[{"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AQI="}}]},
            "outputTranscription":{"text":"hello there"}
        }}"#;

        let Inbound::Content(message) = parse_server_frame(payload).unwrap() else {
            panic!("expected content");
        };
        let audio = message.audio.unwrap();
        assert_eq!(audio.data, "AQI=");
        assert_eq!(audio.sample_rate(), Some(24000));
        assert_eq!(message.transcript.as_deref(), Some("hello there"));
        assert!(!message.interrupted);
    }

    #[test]
    fn test_parse_interruption() {
        let Inbound::Content(message) =
            parse_server_frame(br#"{"serverContent":{"interrupted":true}}"#).unwrap()
        else {
            panic!("expected content");
        };
        assert!(message.interrupted);
        assert!(message.audio.is_none());
    }

    #[test]
    fn test_parse_turn_complete_is_ignored() {
        assert_eq!(
            parse_server_frame(br#"{"serverContent":{"turnComplete":true}}"#).unwrap(),
            Inbound::Ignored
        );
    }

    #[test]
    fn test_parse_garbage_fails() {
        assert!(parse_server_frame(b"not json").is_err());
    }

    #[test]
    fn test_connector_requires_key() {
        let config = LiveConfig {
            api_key: None,
            ..LiveConfig::default()
        };
        assert!(matches!(
            GeminiLiveConnector::new(config),
            Err(Error::Config(_))
        ));
    }
}
