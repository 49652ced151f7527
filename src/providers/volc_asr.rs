//! Volcano streaming ASR adapter
//!
//! Drives the v3 "sauc bigmodel" realtime recognition endpoint: a binary
//! WebSocket protocol with one full-client request describing the audio,
//! then audio-only frames, terminated by a negative-sequence empty frame.
//! Results stream back as JSON payloads carrying refining hypotheses.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::volc_proto::{build_frame, flags, msg_type, parse_frame};
use super::{AsrProvider, AudioFrame, InterruptSignal, ProviderError, ProviderResult, Transcription};
use crate::config::{Config, VolcConfig};

const RESOURCE_ID: &str = "volc.bigasr.sauc.duration";

pub struct VolcAsr {
    app_id: String,
    access_token: String,
    ws_url: String,
    event_timeout: Duration,
}

impl VolcAsr {
    pub fn from_config(config: &Config) -> Self {
        let VolcConfig { app_id, access_token, asr_ws_url, .. } = &config.volc;
        Self {
            app_id: app_id.clone().unwrap_or_default(),
            access_token: access_token.clone().unwrap_or_default(),
            ws_url: asr_ws_url.clone(),
            event_timeout: Duration::from_secs(config.pipeline.asr_event_timeout_secs),
        }
    }

    fn session_config(&self) -> Vec<u8> {
        json!({
            "user": {"uid": "tutorlamp"},
            "audio": {
                "format": "pcm",
                "codec": "raw",
                "rate": 16000,
                "bits": 16,
                "channel": 1,
            },
            "request": {
                "model_name": "bigmodel",
                "enable_itn": true,
                "enable_punc": true,
                "enable_ddc": true,
                "show_utterances": true,
                "enable_nonstream": false,
            },
        })
        .to_string()
        .into_bytes()
    }
}

#[async_trait]
impl AsrProvider for VolcAsr {
    async fn transcribe_stream(
        &self,
        mut frames: mpsc::Receiver<AudioFrame>,
        interrupt: InterruptSignal,
    ) -> ProviderResult<mpsc::Receiver<ProviderResult<Transcription>>> {
        if self.app_id.is_empty() || self.access_token.is_empty() {
            return Err(ProviderError::Handshake("ASR service not configured".into()));
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
        headers.insert("X-Api-Resource-Id", header(RESOURCE_ID)?);
        headers.insert("X-Api-Request-Id", header(&Uuid::new_v4().to_string())?);
        headers.insert("X-Api-Access-Key", header(&self.access_token)?);
        headers.insert("X-Api-App-Key", header(&self.app_id)?);

        let (ws, _) = connect_async(request)
            .await
            .map_err(|e| ProviderError::Connect(e.to_string()))?;
        info!("ASR WebSocket connected");
        let (mut sink, mut stream) = ws.split();

        // Session handshake: full client request, then the first response
        let open = build_frame(msg_type::FULL_CLIENT_REQUEST, flags::POS_SEQUENCE, 1, &self.session_config(), true);
        sink.send(Message::Binary(open.into()))
            .await
            .map_err(|e| ProviderError::Connect(e.to_string()))?;

        match timeout(self.event_timeout, stream.next()).await {
            Err(_) => return Err(ProviderError::Timeout),
            Ok(None) => return Err(ProviderError::Handshake("ASR closed during handshake".into())),
            Ok(Some(Ok(Message::Binary(bin)))) => {
                let frame = parse_frame(&bin)?;
                if frame.message_type == msg_type::SERVER_ERROR || frame.error_code != 0 {
                    return Err(ProviderError::Handshake(format!(
                        "ASR initialization failed (code {}): {}",
                        frame.error_code, frame.error_message
                    )));
                }
            }
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(e))) => return Err(ProviderError::Connect(e.to_string())),
        }

        let (tx, rx) = mpsc::channel(32);
        let event_timeout = self.event_timeout;

        // Audio uplink
        let send_interrupt = interrupt.clone();
        tokio::spawn(async move {
            let mut seq: i32 = 2;
            while let Some(frame) = frames.recv().await {
                if send_interrupt.is_raised() {
                    break;
                }
                match frame {
                    AudioFrame::Pcm(data) => {
                        let packet = build_frame(msg_type::AUDIO_ONLY_CLIENT, flags::POS_SEQUENCE, seq, &data, false);
                        if sink.send(Message::Binary(packet.into())).await.is_err() {
                            return;
                        }
                        seq += 1;
                    }
                    AudioFrame::End => break,
                }
            }
            // Terminator: negative sequence on an empty audio frame
            let last = build_frame(msg_type::AUDIO_ONLY_CLIENT, flags::NEG_WITH_SEQUENCE, -seq, &[], false);
            let _ = sink.send(Message::Binary(last.into())).await;
        });

        // Result downlink
        tokio::spawn(async move {
            loop {
                if interrupt.is_raised() {
                    debug!("ASR stream interrupted");
                    break;
                }
                let message = match timeout(event_timeout, stream.next()).await {
                    Err(_) => {
                        let _ = tx.send(Err(ProviderError::Timeout)).await;
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Ok(m))) => m,
                    Ok(Some(Err(e))) => {
                        let _ = tx.send(Err(ProviderError::Stream(e.to_string()))).await;
                        break;
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
                        break;
                    }
                };

                if frame.message_type == msg_type::SERVER_ERROR || frame.error_code != 0 {
                    warn!("ASR server error (code {}): {}", frame.error_code, frame.error_message);
                    let _ = tx
                        .send(Err(ProviderError::Stream(format!(
                            "ASR error (code {}): {}",
                            frame.error_code, frame.error_message
                        ))))
                        .await;
                    break;
                }

                let mut finished = frame.is_last_package;
                if let Some(payload) = frame.payload_json() {
                    if let Some(result) = payload.get("result") {
                        let text = result.get("text").and_then(|t| t.as_str()).unwrap_or_default();
                        let is_final = result.get("is_final").and_then(|f| f.as_bool()).unwrap_or(false)
                            || frame.is_last_package;
                        if !text.is_empty() || is_final {
                            if tx
                                .send(Ok(Transcription { text: text.to_string(), is_final }))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        finished = finished || is_final;
                    }
                }

                if finished {
                    break;
                }
            }
        });

        Ok(rx)
    }
}
