//! Doubao/Ark LLM adapter
//!
//! Streams the Ark `responses` API over SSE. The request disables provider
//! reasoning so only user-visible text reaches the pipeline, and passes the
//! previous response id so the provider resumes context server-side instead
//! of replaying the whole history.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{ChatTurn, InterruptSignal, LlmEvent, LlmProvider, LlmRequest, ProviderError, ProviderResult};
use crate::config::{Config, DoubaoConfig};

pub struct DoubaoLlm {
    api_key: String,
    model_id: String,
    base_url: String,
    max_output_tokens: u32,
    http: reqwest::Client,
}

impl DoubaoLlm {
    pub fn from_config(config: &Config) -> Self {
        let DoubaoConfig { api_key, model_id, base_url, max_output_tokens } = &config.doubao;
        Self {
            api_key: api_key.clone().unwrap_or_default(),
            model_id: model_id.clone(),
            base_url: base_url.clone(),
            max_output_tokens: *max_output_tokens,
            http: reqwest::Client::new(),
        }
    }

    fn build_payload(&self, request: &LlmRequest) -> Value {
        let mut input = Vec::with_capacity(request.history.len() + 2);
        input.push(json!({"role": "system", "content": request.system_prompt}));
        for ChatTurn { role, content } in &request.history {
            input.push(json!({"role": role, "content": content}));
        }
        input.push(json!({"role": "user", "content": request.user_turn}));

        let mut payload = json!({
            "model": self.model_id,
            "input": input,
            "stream": true,
            "max_output_tokens": self.max_output_tokens,
            "thinking": {"type": "disabled"},
        });
        if let Some(cursor) = &request.resume_cursor {
            payload["previous_response_id"] = json!(cursor);
        }
        payload
    }
}

#[async_trait]
impl LlmProvider for DoubaoLlm {
    async fn stream(
        &self,
        request: LlmRequest,
        interrupt: InterruptSignal,
    ) -> ProviderResult<mpsc::Receiver<ProviderResult<LlmEvent>>> {
        if self.api_key.is_empty() {
            return Err(ProviderError::Handshake("LLM service not configured".into()));
        }

        let response = self
            .http
            .post(format!("{}/responses", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&self.build_payload(&request))
            .send()
            .await
            .map_err(|e| ProviderError::Connect(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Handshake(format!("LLM API error ({}): {}", status, body)));
        }

        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut cursor: Option<String> = None;
            let mut any_delta = false;

            'read: while let Some(chunk) = stream.next().await {
                if interrupt.is_raised() {
                    debug!("LLM stream interrupted");
                    return;
                }
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(Err(ProviderError::Stream(e.to_string()))).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // Parse complete SSE events off the front of the buffer
                while let Some(pos) = buffer.find("\n\n") {
                    let event_str = buffer[..pos].to_string();
                    buffer = buffer[pos + 2..].to_string();

                    for line in event_str.lines() {
                        let Some(data) = line.strip_prefix("data: ") else { continue };
                        if data == "[DONE]" {
                            let _ = tx.send(Ok(LlmEvent::Completed { cursor: cursor.take() })).await;
                            return;
                        }
                        let Ok(event) = serde_json::from_str::<Value>(data) else { continue };
                        let event_type = event.get("type").and_then(|t| t.as_str()).unwrap_or_default();

                        match event_type {
                            "response.created" | "response.in_progress" | "response.completed" => {
                                if cursor.is_none() {
                                    cursor = event
                                        .get("response")
                                        .and_then(|r| r.get("id"))
                                        .and_then(|id| id.as_str())
                                        .map(String::from);
                                }
                                if event_type == "response.completed" {
                                    info!("LLM response completed (cursor: {:?})", cursor);
                                    let _ = tx.send(Ok(LlmEvent::Completed { cursor: cursor.take() })).await;
                                    return;
                                }
                            }
                            "response.output_text.delta" => {
                                if let Some(delta) = event.get("delta").and_then(|d| d.as_str()) {
                                    if !delta.is_empty() {
                                        any_delta = true;
                                        if tx.send(Ok(LlmEvent::Delta(delta.to_string()))).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                            }
                            "response.output_text.done" => {
                                // Some models deliver the whole text only here
                                if !any_delta {
                                    if let Some(text) = event.get("text").and_then(|t| t.as_str()) {
                                        if !text.is_empty()
                                            && tx.send(Ok(LlmEvent::Delta(text.to_string()))).await.is_err()
                                        {
                                            return;
                                        }
                                    }
                                }
                            }
                            "response.incomplete" => {
                                let _ = tx.send(Ok(LlmEvent::Completed { cursor: cursor.take() })).await;
                                return;
                            }
                            "response.failed" => {
                                let _ = tx
                                    .send(Err(ProviderError::Stream("LLM response failed".into())))
                                    .await;
                                return;
                            }
                            _ => {}
                        }
                    }
                }

                if tx.is_closed() {
                    break 'read;
                }
            }

            // Stream ended without a terminal event
            let _ = tx.send(Ok(LlmEvent::Completed { cursor })).await;
        });

        Ok(rx)
    }
}
