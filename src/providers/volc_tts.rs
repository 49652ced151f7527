//! Volcano streaming TTS adapter
//!
//! Drives the v3 unidirectional synthesis endpoint. The request asks for raw
//! PCM at the pipeline's sample rate so no transcoding is needed downstream.
//! Server frames are either JSON control events (sentence boundaries,
//! session lifecycle) or audio-only frames. If the service sends audio
//! before any sentence event, a synthetic `SentenceStart` covering the whole
//! text is emitted first so the event contract holds for unframed blobs.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info};
use uuid::Uuid;

use super::volc_proto::{build_frame, flags, msg_type, parse_frame};
use super::{InterruptSignal, ProviderError, ProviderResult, TtsEvent, TtsProvider};
use crate::config::{Config, VolcConfig};

const RESOURCE_ID: &str = "seed-tts-2.0";

/// Session-level event codes in full server responses
mod event {
    pub const SENTENCE_START: i32 = 3;
    pub const SESSION_FINISHED: i32 = 6;
}

pub struct VolcTts {
    app_id: String,
    access_token: String,
    ws_url: String,
    voice_type: String,
    sample_rate: u32,
    event_timeout: Duration,
}

impl VolcTts {
    pub fn from_config(config: &Config) -> Self {
        let VolcConfig { app_id, access_token, tts_ws_url, tts_voice_type, tts_sample_rate, .. } = &config.volc;
        Self {
            app_id: app_id.clone().unwrap_or_default(),
            access_token: access_token.clone().unwrap_or_default(),
            ws_url: tts_ws_url.clone(),
            voice_type: tts_voice_type.clone(),
            sample_rate: *tts_sample_rate,
            event_timeout: Duration::from_secs(config.pipeline.tts_event_timeout_secs),
        }
    }

    fn session_request(&self, text: &str) -> Vec<u8> {
        json!({
            "user": {"uid": Uuid::new_v4().to_string()},
            "req_params": {
                "speaker": self.voice_type,
                "audio_params": {
                    "format": "pcm",
                    "sample_rate": self.sample_rate,
                    "enable_timestamp": false,
                },
                "text": text,
                "additions": json!({"disable_markdown_filter": false}).to_string(),
            },
        })
        .to_string()
        .into_bytes()
    }
}

#[async_trait]
impl TtsProvider for VolcTts {
    async fn synthesize_stream(
        &self,
        text: &str,
        interrupt: InterruptSignal,
    ) -> ProviderResult<mpsc::Receiver<ProviderResult<TtsEvent>>> {
        if self.app_id.is_empty() || self.access_token.is_empty() {
            return Err(ProviderError::Handshake("TTS service not configured".into()));
        }

        let mut request = self
            .ws_url
            .as_str()
            .into_client_request()
            .map_err(|e| ProviderError::Connect(e.to_string()))?;
        let headers = request.headers_mut();
        let header = |v: &str| {
            v.parse().map_err(|_| ProviderError::Connect("invalid header value".into()))
        };
        headers.insert("X-Api-App-Key", header(&self.app_id)?);
        headers.insert("X-Api-Access-Key", header(&self.access_token)?);
        headers.insert("X-Api-Resource-Id", header(RESOURCE_ID)?);
        headers.insert("X-Api-Connect-Id", header(&Uuid::new_v4().to_string())?);

        let (ws, _) = connect_async(request)
            .await
            .map_err(|e| ProviderError::Connect(e.to_string()))?;
        info!("TTS WebSocket connected ({} chars)", text.chars().count());
        let (mut sink, mut stream) = ws.split();

        let open = build_frame(msg_type::FULL_CLIENT_REQUEST, flags::POS_SEQUENCE, 1, &self.session_request(text), true);
        sink.send(Message::Binary(open.into()))
            .await
            .map_err(|e| ProviderError::Connect(e.to_string()))?;

        let (tx, rx) = mpsc::channel(32);
        let event_timeout = self.event_timeout;
        let full_text = text.to_string();

        tokio::spawn(async move {
            let mut sentence_seen = false;
            let mut finished_sent = false;

            loop {
                if interrupt.is_raised() {
                    debug!("TTS stream interrupted");
                    break;
                }
                let message = match timeout(event_timeout, stream.next()).await {
                    Err(_) => {
                        let _ = tx.send(Err(ProviderError::Timeout)).await;
                        return;
                    }
                    Ok(None) => break,
                    Ok(Some(Ok(m))) => m,
                    Ok(Some(Err(e))) => {
                        let _ = tx.send(Err(ProviderError::Stream(e.to_string()))).await;
                        return;
                    }
                };

                let bin = match message {
                    Message::Binary(bin) => bin,
                    Message::Close(_) => break,
                    _ => continue,
                };

                let frame = match parse_frame(&bin) {
                    Ok(f) => f,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };

                match frame.message_type {
                    msg_type::SERVER_ERROR => {
                        let _ = tx
                            .send(Err(ProviderError::Stream(format!(
                                "TTS error (code {}): {}",
                                frame.error_code, frame.error_message
                            ))))
                            .await;
                        return;
                    }
                    msg_type::AUDIO_ONLY_SERVER => {
                        if frame.payload.is_empty() {
                            continue;
                        }
                        if !sentence_seen {
                            // Unframed blob: wrap it in one synthetic sentence
                            sentence_seen = true;
                            if tx.send(Ok(TtsEvent::SentenceStart(full_text.clone()))).await.is_err() {
                                return;
                            }
                        }
                        if tx.send(Ok(TtsEvent::Audio(frame.payload))).await.is_err() {
                            return;
                        }
                    }
                    msg_type::FULL_SERVER_RESPONSE => match frame.event {
                        event::SENTENCE_START => {
                            sentence_seen = true;
                            let sentence = frame
                                .payload_json()
                                .and_then(|p| p.get("text").and_then(|t| t.as_str()).map(String::from))
                                .unwrap_or_else(|| full_text.clone());
                            if tx.send(Ok(TtsEvent::SentenceStart(sentence))).await.is_err() {
                                return;
                            }
                        }
                        event::SESSION_FINISHED => {
                            finished_sent = true;
                            let _ = tx.send(Ok(TtsEvent::Finished)).await;
                            return;
                        }
                        _ => {}
                    },
                    _ => {}
                }
            }

            // Socket closed or interrupt without an explicit session-finished
            if !finished_sent {
                let _ = tx.send(Ok(TtsEvent::Finished)).await;
            }
        });

        Ok(rx)
    }
}
