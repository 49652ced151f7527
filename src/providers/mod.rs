//! Capability adapters
//!
//! Uniform streaming interfaces over the third-party ASR, LLM, and TTS
//! providers. The orchestrator only sees these traits; the concrete Volcano
//! and Ark adapters live in the submodules. Every adapter accepts an
//! [`InterruptSignal`] and polls it between provider events so a barge-in or
//! client interrupt can cut a stream short without waiting for the provider.

pub mod doubao;
pub mod volc_asr;
pub mod volc_proto;
pub mod volc_tts;

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Structured failure from a provider adapter
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider connection failed: {0}")]
    Connect(String),
    #[error("provider rejected the session: {0}")]
    Handshake(String),
    #[error("provider stream failed: {0}")]
    Stream(String),
    #[error("provider timed out waiting for an event")]
    Timeout,
}

impl ProviderError {
    /// Whether the caller may retry the turn. Handshake rejections point at
    /// bad credentials or parameters and are not retryable as-is.
    pub fn retryable(&self) -> bool {
        !matches!(self, ProviderError::Handshake(_))
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Cooperative cancellation flag shared between the orchestrator and the
/// provider tasks it spawns. Raising is idempotent.
#[derive(Debug, Clone, Default)]
pub struct InterruptSignal(Arc<AtomicBool>);

impl InterruptSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One item on the audio path into ASR
#[derive(Debug, Clone)]
pub enum AudioFrame {
    /// Raw PCM, s16le 16kHz mono
    Pcm(Vec<u8>),
    /// End-of-utterance sentinel; the adapter flushes and finishes
    End,
}

/// One ASR observation; non-final observations are refining hypotheses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcription {
    pub text: String,
    pub is_final: bool,
}

/// One turn of prior history fed back to the LLM
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: &str, content: &str) -> Self {
        Self { role: role.to_string(), content: content.to_string() }
    }
}

/// A fully prepared LLM call for one user turn
#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub system_prompt: String,
    pub history: Vec<ChatTurn>,
    pub user_turn: String,
    /// Provider-side id of the prior response; lets the provider resume
    /// context without resending it
    pub resume_cursor: Option<String>,
}

/// Events on the LLM output stream
#[derive(Debug, Clone)]
pub enum LlmEvent {
    /// User-visible text delta
    Delta(String),
    /// Terminal event carrying the new resume cursor
    Completed { cursor: Option<String> },
}

/// Events on the TTS output stream
#[derive(Debug, Clone)]
pub enum TtsEvent {
    /// The next run of audio corresponds to this substring
    SentenceStart(String),
    /// Raw PCM, s16le 16kHz mono, never empty
    Audio(Vec<u8>),
    /// Terminal; emitted exactly once unless the stream errors
    Finished,
}

/// Streaming speech recognition
#[async_trait]
pub trait AsrProvider: Send + Sync {
    /// Open a recognition stream over `frames`. The returned channel yields
    /// refining hypotheses and terminates after a final observation, the
    /// provider's end signal, or once `interrupt` is raised.
    async fn transcribe_stream(
        &self,
        frames: mpsc::Receiver<AudioFrame>,
        interrupt: InterruptSignal,
    ) -> ProviderResult<mpsc::Receiver<ProviderResult<Transcription>>>;
}

/// Streaming chat completion
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Stream text deltas for one user turn. The terminal event carries the
    /// resume cursor for the next turn.
    async fn stream(
        &self,
        request: LlmRequest,
        interrupt: InterruptSignal,
    ) -> ProviderResult<mpsc::Receiver<ProviderResult<LlmEvent>>>;
}

/// Streaming speech synthesis
#[async_trait]
pub trait TtsProvider: Send + Sync {
    /// Stream synthesis events for `text`.
    async fn synthesize_stream(
        &self,
        text: &str,
        interrupt: InterruptSignal,
    ) -> ProviderResult<mpsc::Receiver<ProviderResult<TtsEvent>>>;
}

/// The provider set a session pipeline runs against
pub struct Providers {
    pub asr: Arc<dyn AsrProvider>,
    pub llm: Arc<dyn LlmProvider>,
    pub tts: Arc<dyn TtsProvider>,
}
