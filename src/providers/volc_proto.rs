//! Binary framing for the Volcano v3 speech WebSocket protocols
//!
//! Both the streaming ASR and streaming TTS endpoints speak the same frame
//! layout: a 4-byte header (version/size, message type/flags,
//! serialization/compression, reserved), an optional big-endian sequence or
//! event word, a big-endian payload size, and a gzip-compressed payload.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

use super::ProviderError;

pub const PROTOCOL_VERSION: u8 = 0b0001;

/// Message type nibbles
pub mod msg_type {
    pub const FULL_CLIENT_REQUEST: u8 = 0b0001;
    pub const AUDIO_ONLY_CLIENT: u8 = 0b0010;
    pub const FULL_SERVER_RESPONSE: u8 = 0b1001;
    pub const AUDIO_ONLY_SERVER: u8 = 0b1011;
    pub const SERVER_ERROR: u8 = 0b1111;
}

/// Message-type-specific flag nibbles
pub mod flags {
    pub const NONE: u8 = 0b0000;
    pub const POS_SEQUENCE: u8 = 0b0001;
    pub const LAST_PACKAGE: u8 = 0b0010;
    pub const NEG_WITH_SEQUENCE: u8 = 0b0011;
    pub const HAS_EVENT: u8 = 0b0100;
}

pub mod serialization {
    pub const NONE: u8 = 0b0000;
    pub const JSON: u8 = 0b0001;
}

pub mod compression {
    pub const NONE: u8 = 0b0000;
    pub const GZIP: u8 = 0b0001;
}

/// Build one client frame. JSON payloads are gzip-compressed; raw audio is
/// compressed too, matching what the service expects for `codec: raw`.
pub fn build_frame(message_type: u8, frame_flags: u8, seq: i32, payload: &[u8], json: bool) -> Vec<u8> {
    let compressed = gzip_compress(payload);
    let serialization = if json { serialization::JSON } else { serialization::NONE };

    let mut frame = Vec::with_capacity(12 + compressed.len());
    frame.push((PROTOCOL_VERSION << 4) | 1); // header size: one 4-byte word
    frame.push((message_type << 4) | frame_flags);
    frame.push((serialization << 4) | compression::GZIP);
    frame.push(0x00);
    if frame_flags & flags::POS_SEQUENCE != 0 {
        frame.extend_from_slice(&seq.to_be_bytes());
    }
    frame.extend_from_slice(&(compressed.len() as u32).to_be_bytes());
    frame.extend_from_slice(&compressed);
    frame
}

/// A parsed server frame
#[derive(Debug, Default)]
pub struct ServerFrame {
    pub message_type: u8,
    pub is_last_package: bool,
    pub sequence: i32,
    pub event: i32,
    pub error_code: i32,
    pub error_message: String,
    pub payload: Vec<u8>,
    pub is_json: bool,
}

impl ServerFrame {
    /// Parse the payload as JSON when the frame declares it.
    pub fn payload_json(&self) -> Option<serde_json::Value> {
        if !self.is_json || self.payload.is_empty() {
            return None;
        }
        serde_json::from_slice(&self.payload).ok()
    }
}

/// Parse one server frame. Tolerates payloads the service sends uncompressed.
pub fn parse_frame(data: &[u8]) -> Result<ServerFrame, ProviderError> {
    if data.len() < 4 {
        return Err(ProviderError::Stream("frame shorter than header".into()));
    }

    let header_size = (data[0] & 0x0F) as usize * 4;
    let message_type = data[1] >> 4;
    let frame_flags = data[1] & 0x0F;
    let ser = data[2] >> 4;
    let comp = data[2] & 0x0F;

    if data.len() < header_size {
        return Err(ProviderError::Stream("truncated frame header".into()));
    }

    let mut frame = ServerFrame { message_type, is_json: ser == serialization::JSON, ..Default::default() };
    let mut offset = header_size;

    let mut read_i32 = |offset: &mut usize| -> Result<i32, ProviderError> {
        let end = *offset + 4;
        if end > data.len() {
            return Err(ProviderError::Stream("truncated frame word".into()));
        }
        let word = i32::from_be_bytes([data[*offset], data[*offset + 1], data[*offset + 2], data[*offset + 3]]);
        *offset = end;
        Ok(word)
    };

    if frame_flags & flags::POS_SEQUENCE != 0 {
        frame.sequence = read_i32(&mut offset)?;
    }
    if frame_flags & flags::LAST_PACKAGE != 0 {
        frame.is_last_package = true;
    }
    if frame_flags & flags::HAS_EVENT != 0 {
        frame.event = read_i32(&mut offset)?;
    }

    match message_type {
        msg_type::SERVER_ERROR => {
            frame.error_code = read_i32(&mut offset)?;
            let size = read_i32(&mut offset)? as usize;
            let body = slice_payload(data, offset, size)?;
            let body = maybe_decompress(body, comp);
            frame.error_message = String::from_utf8_lossy(&body).into_owned();
        }
        msg_type::FULL_SERVER_RESPONSE | msg_type::AUDIO_ONLY_SERVER => {
            let size = read_i32(&mut offset)? as usize;
            let body = slice_payload(data, offset, size)?;
            frame.payload = if message_type == msg_type::FULL_SERVER_RESPONSE {
                maybe_decompress(body, comp)
            } else {
                // Audio frames arrive uncompressed
                body.to_vec()
            };
        }
        _ => {}
    }

    Ok(frame)
}

fn slice_payload(data: &[u8], offset: usize, size: usize) -> Result<&[u8], ProviderError> {
    let end = offset.checked_add(size).filter(|end| *end <= data.len());
    match end {
        Some(end) => Ok(&data[offset..end]),
        None => Err(ProviderError::Stream("truncated frame payload".into())),
    }
}

fn maybe_decompress(body: &[u8], comp: u8) -> Vec<u8> {
    if comp != compression::GZIP {
        return body.to_vec();
    }
    let mut decoder = GzDecoder::new(body);
    let mut out = Vec::new();
    match decoder.read_to_end(&mut out) {
        Ok(_) => out,
        Err(_) => body.to_vec(),
    }
}

fn gzip_compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    // Writing into a Vec cannot fail
    let _ = encoder.write_all(data);
    encoder.finish().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let payload = br#"{"result":{"text":"hi"}}"#;
        let mut raw = build_frame(msg_type::FULL_CLIENT_REQUEST, flags::POS_SEQUENCE, 3, payload, true);
        // Rewrite the type nibble so the parser accepts it as a server frame
        raw[1] = (msg_type::FULL_SERVER_RESPONSE << 4) | flags::POS_SEQUENCE;

        let frame = parse_frame(&raw).unwrap();
        assert_eq!(frame.message_type, msg_type::FULL_SERVER_RESPONSE);
        assert_eq!(frame.sequence, 3);
        assert_eq!(frame.payload, payload);
        assert_eq!(frame.payload_json().unwrap()["result"]["text"], "hi");
    }

    #[test]
    fn test_short_frame_rejected() {
        assert!(parse_frame(&[0x11, 0x91]).is_err());
    }

    #[test]
    fn test_negative_sequence_marks_last() {
        let raw = build_frame(msg_type::AUDIO_ONLY_CLIENT, flags::NEG_WITH_SEQUENCE, -5, b"", false);
        // NEG_WITH_SEQUENCE sets both the sequence and last-package bits
        assert_eq!(raw[1] & 0x0F, flags::NEG_WITH_SEQUENCE);
        let seq = i32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
        assert_eq!(seq, -5);
    }
}
