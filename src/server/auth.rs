//! Connection-token gate
//!
//! The bidirectional endpoint is authenticated by a short-lived HS256 token
//! minted when the conversation is created. The token is single-purpose: a
//! `type = "ws"` marker keeps request-scoped access tokens from opening a
//! live connection. Each precondition failure maps to its own close code so
//! the tablet can tell a stale token from a dead session.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::store::SessionStore;
use crate::types::SessionStatus;

/// Marker distinguishing connection tokens from request-scoped tokens
pub const WS_TOKEN_TYPE: &str = "ws";

/// Claims carried by a connection token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsClaims {
    pub conversation_id: i64,
    pub user_id: i64,
    pub exp: i64,
    #[serde(rename = "type")]
    pub token_type: String,
}

/// Mint a connection token for a freshly created conversation.
pub fn create_ws_token(secret: &str, conversation_id: i64, user_id: i64, ttl_secs: u64) -> Result<String> {
    let claims = WsClaims {
        conversation_id,
        user_id,
        exp: (Utc::now() + Duration::seconds(ttl_secs as i64)).timestamp(),
        token_type: WS_TOKEN_TYPE.to_string(),
    };
    encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(secret.as_bytes()))
        .context("Failed to encode connection token")
}

/// Decode and validate a connection token. Returns `None` on any failure,
/// including a wrong `type` marker.
pub fn decode_ws_token(secret: &str, token: &str) -> Option<WsClaims> {
    let validation = Validation::new(Algorithm::HS256);
    let data = decode::<WsClaims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation).ok()?;
    if data.claims.token_type != WS_TOKEN_TYPE {
        return None;
    }
    Some(data.claims)
}

/// Why the gate refused a connection; each maps to a distinct close code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateRejection {
    InvalidToken,
    ConversationMismatch,
    SessionMissing,
    UserMismatch,
    SessionNotActive,
}

impl GateRejection {
    pub fn close_code(self) -> u16 {
        match self {
            GateRejection::InvalidToken => 4001,
            GateRejection::ConversationMismatch => 4002,
            GateRejection::SessionMissing => 4003,
            GateRejection::UserMismatch => 4004,
            GateRejection::SessionNotActive => 4005,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            GateRejection::InvalidToken => "Invalid token",
            GateRejection::ConversationMismatch => "Token does not match conversation",
            GateRejection::SessionMissing => "Conversation not found or expired",
            GateRejection::UserMismatch => "User mismatch",
            GateRejection::SessionNotActive => "Conversation is not active",
        }
    }
}

/// Verify the connection preconditions. Returns the authenticated user id.
pub async fn verify_connection(
    store: &SessionStore,
    secret: &str,
    conversation_id: i64,
    token: &str,
) -> Result<i64, GateRejection> {
    let claims = match decode_ws_token(secret, token) {
        Some(claims) => claims,
        None => {
            warn!(conv_id = conversation_id, "connection token rejected");
            return Err(GateRejection::InvalidToken);
        }
    };

    if claims.conversation_id != conversation_id {
        warn!(
            url_conv_id = conversation_id,
            token_conv_id = claims.conversation_id,
            "token/url conversation mismatch"
        );
        return Err(GateRejection::ConversationMismatch);
    }

    let session = match store.load_session(conversation_id).await {
        Ok(Some(session)) => session,
        Ok(None) => return Err(GateRejection::SessionMissing),
        Err(e) => {
            warn!(conv_id = conversation_id, "session lookup failed: {}", e);
            return Err(GateRejection::SessionMissing);
        }
    };

    if session.user_id != claims.user_id {
        warn!(
            conv_id = conversation_id,
            session_user = session.user_id,
            token_user = claims.user_id,
            "user mismatch"
        );
        return Err(GateRejection::UserMismatch);
    }

    if session.status != SessionStatus::Active {
        return Err(GateRejection::SessionNotActive);
    }

    Ok(claims.user_id)
}
