//! Tutorlamp - Real-time voice tutoring backend
//!
//! Server side of the children's learning tablet: students speak or show
//! homework to the tablet, the tablet streams microphone audio over a
//! persistent WebSocket, and this crate runs the per-conversation pipeline
//! that turns audio into text (ASR), feeds text through the LLM tutor, and
//! streams synthesized speech back while interleaving spoken segments with
//! rendered chalkboard markup.
//!
//! # Example
//!
//! ```ignore
//! use tutorlamp::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     tutorlamp::server::start(config).await
//! }
//! ```

pub mod config;
pub mod pipeline;
pub mod prompts;
pub mod protocol;
pub mod providers;
pub mod segment;
pub mod server;
pub mod store;
pub mod types;
pub mod vad;

// Re-export commonly used types for convenience
pub use config::Config;
pub use pipeline::SessionActor;
pub use protocol::{ClientEnvelope, ServerEnvelope};
pub use segment::{Segment, SegmentParser};
pub use server::{build_state, start as start_server, ServerState};
pub use store::SessionStore;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
