//! WebSocket envelope protocol
//!
//! Every message in either direction is a JSON envelope
//! `{type, conv_id, msg_id, ts_ms, payload}`. Client envelopes are decoded
//! strictly (unknown tags rejected); server envelopes are only produced by
//! the constructors below so ordering and field invariants live in one place.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::ConversationState;

/// Audio format constants for server `audio_chunk` envelopes
pub const AUDIO_FORMAT: &str = "pcm_s16le";
pub const AUDIO_SAMPLE_RATE: u32 = 16000;
pub const AUDIO_CHANNELS: u8 = 1;
pub const AUDIO_BITS_PER_SAMPLE: u8 = 16;

/// Board markup format forwarded verbatim to the client
pub const BOARD_FORMAT: &str = "md";

/// Error codes carried by `error` envelopes
pub const ERR_MALFORMED: u32 = 1001;
pub const ERR_PROVIDER: u32 = 5001;
pub const ERR_INTERNAL: u32 = 5000;

/// Client → server envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEnvelope {
    pub conv_id: i64,
    pub msg_id: Uuid,
    pub ts_ms: i64,
    #[serde(flatten)]
    pub payload: ClientPayload,
}

/// Audio parameters announced by `client_hello`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioParams {
    pub format: String,
    pub sample_rate: u32,
    pub channels: u8,
    pub bits_per_sample: u8,
    pub frame_ms: u32,
}

/// Client → server payloads, tagged by `type`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientPayload {
    Ping {},
    ClientHello {
        audio: AudioParams,
    },
    MicStart {
        stream_id: String,
    },
    UserAudioChunk {
        stream_id: String,
        seq: u64,
        data_b64: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        vad_hint: Option<bool>,
    },
    MicEnd {
        stream_id: String,
        last_seq: u64,
    },
    Image {
        image_url: String,
    },
    Interrupt {},
}

/// Reason carried by the `done` envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneReason {
    Completed,
    Interrupted,
}

/// Server → client payloads, tagged by `type`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerPayload {
    Pong {},
    State {
        state: ConversationState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    AsrPartial {
        stream_id: String,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stability: Option<f32>,
    },
    AsrFinal {
        stream_id: String,
        text: String,
    },
    SegmentStart {
        segment_id: u32,
        index: u32,
    },
    AiTextDelta {
        segment_id: u32,
        seq: u64,
        delta: String,
    },
    AudioChunk {
        segment_id: u32,
        seq: u64,
        format: String,
        sample_rate: u32,
        channels: u8,
        bits_per_sample: u8,
        data_b64: String,
    },
    AudioEnd {
        segment_id: u32,
        last_seq: u64,
    },
    Board {
        segment_id: u32,
        format: String,
        content: String,
    },
    Done {
        total_segments: u32,
        reason: DoneReason,
    },
    Error {
        code: u32,
        message: String,
        retryable: bool,
    },
}

/// Server → client envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEnvelope {
    pub conv_id: i64,
    pub msg_id: Uuid,
    pub ts_ms: i64,
    #[serde(flatten)]
    pub payload: ServerPayload,
}

impl ServerEnvelope {
    fn new(conv_id: i64, payload: ServerPayload) -> Self {
        Self {
            conv_id,
            msg_id: Uuid::new_v4(),
            ts_ms: Utc::now().timestamp_millis(),
            payload,
        }
    }

    pub fn pong(conv_id: i64) -> Self {
        Self::new(conv_id, ServerPayload::Pong {})
    }

    pub fn state(conv_id: i64, state: ConversationState) -> Self {
        Self::new(conv_id, ServerPayload::State { state, detail: None })
    }

    pub fn asr_partial(conv_id: i64, stream_id: &str, text: &str) -> Self {
        Self::new(
            conv_id,
            ServerPayload::AsrPartial {
                stream_id: stream_id.to_string(),
                text: text.to_string(),
                stability: None,
            },
        )
    }

    pub fn asr_final(conv_id: i64, stream_id: &str, text: &str) -> Self {
        Self::new(
            conv_id,
            ServerPayload::AsrFinal { stream_id: stream_id.to_string(), text: text.to_string() },
        )
    }

    pub fn segment_start(conv_id: i64, segment_id: u32) -> Self {
        Self::new(conv_id, ServerPayload::SegmentStart { segment_id, index: segment_id })
    }

    pub fn ai_text_delta(conv_id: i64, segment_id: u32, seq: u64, delta: &str) -> Self {
        Self::new(
            conv_id,
            ServerPayload::AiTextDelta { segment_id, seq, delta: delta.to_string() },
        )
    }

    pub fn audio_chunk(conv_id: i64, segment_id: u32, seq: u64, pcm: &[u8]) -> Self {
        Self::new(
            conv_id,
            ServerPayload::AudioChunk {
                segment_id,
                seq,
                format: AUDIO_FORMAT.to_string(),
                sample_rate: AUDIO_SAMPLE_RATE,
                channels: AUDIO_CHANNELS,
                bits_per_sample: AUDIO_BITS_PER_SAMPLE,
                data_b64: BASE64.encode(pcm),
            },
        )
    }

    pub fn audio_end(conv_id: i64, segment_id: u32, last_seq: u64) -> Self {
        Self::new(conv_id, ServerPayload::AudioEnd { segment_id, last_seq })
    }

    pub fn board(conv_id: i64, segment_id: u32, content: &str) -> Self {
        Self::new(
            conv_id,
            ServerPayload::Board {
                segment_id,
                format: BOARD_FORMAT.to_string(),
                content: content.to_string(),
            },
        )
    }

    pub fn done(conv_id: i64, total_segments: u32, reason: DoneReason) -> Self {
        Self::new(conv_id, ServerPayload::Done { total_segments, reason })
    }

    pub fn error(conv_id: i64, code: u32, message: &str, retryable: bool) -> Self {
        Self::new(
            conv_id,
            ServerPayload::Error { code, message: message.to_string(), retryable },
        )
    }
}

/// Decode a client envelope and enforce the conversation-id binding.
pub fn decode_client_envelope(raw: &str, conv_id: i64) -> Result<ClientEnvelope, String> {
    let envelope: ClientEnvelope =
        serde_json::from_str(raw).map_err(|e| format!("Invalid message format: {}", e))?;
    if envelope.conv_id != conv_id {
        return Err(format!(
            "Envelope conv_id {} does not match connection {}",
            envelope.conv_id, conv_id
        ));
    }
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_ping() {
        let raw = format!(
            r#"{{"type":"ping","conv_id":7,"msg_id":"{}","ts_ms":1000,"payload":{{}}}}"#,
            Uuid::new_v4()
        );
        let env = decode_client_envelope(&raw, 7).unwrap();
        assert!(matches!(env.payload, ClientPayload::Ping {}));
    }

    #[test]
    fn test_decode_audio_chunk() {
        let raw = format!(
            r#"{{"type":"user_audio_chunk","conv_id":7,"msg_id":"{}","ts_ms":1000,"payload":{{"stream_id":"s1","seq":3,"data_b64":"AAAA"}}}}"#,
            Uuid::new_v4()
        );
        let env = decode_client_envelope(&raw, 7).unwrap();
        match env.payload {
            ClientPayload::UserAudioChunk { stream_id, seq, data_b64, vad_hint } => {
                assert_eq!(stream_id, "s1");
                assert_eq!(seq, 3);
                assert_eq!(data_b64, "AAAA");
                assert!(vad_hint.is_none());
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_reject_conv_id_mismatch() {
        let raw = format!(
            r#"{{"type":"interrupt","conv_id":8,"msg_id":"{}","ts_ms":1000,"payload":{{}}}}"#,
            Uuid::new_v4()
        );
        assert!(decode_client_envelope(&raw, 7).is_err());
    }

    #[test]
    fn test_reject_unknown_tag() {
        let raw = format!(
            r#"{{"type":"teleport","conv_id":7,"msg_id":"{}","ts_ms":1000,"payload":{{}}}}"#,
            Uuid::new_v4()
        );
        assert!(decode_client_envelope(&raw, 7).is_err());
    }

    #[test]
    fn test_server_envelope_shape() {
        let env = ServerEnvelope::audio_chunk(7, 2, 5, &[0u8, 1, 2, 3]);
        let json: serde_json::Value = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "audio_chunk");
        assert_eq!(json["conv_id"], 7);
        assert_eq!(json["payload"]["segment_id"], 2);
        assert_eq!(json["payload"]["seq"], 5);
        assert_eq!(json["payload"]["format"], "pcm_s16le");
        assert_eq!(json["payload"]["sample_rate"], 16000);
        assert_eq!(json["payload"]["data_b64"], BASE64.encode([0u8, 1, 2, 3]));
    }

    #[test]
    fn test_done_reason_serialization() {
        let env = ServerEnvelope::done(1, 2, DoneReason::Interrupted);
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["payload"]["reason"], "interrupted");
    }
}
