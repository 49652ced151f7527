//! Configuration management
//!
//! Server, provider, and pipeline settings loaded from a TOML file with
//! environment-variable overrides for secrets.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::vad::VadConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP/WebSocket listener settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Connection-token settings
    #[serde(default)]
    pub auth: AuthConfig,
    /// Volcano Engine speech credentials (ASR + TTS)
    #[serde(default)]
    pub volc: VolcConfig,
    /// Doubao/Ark LLM settings
    #[serde(default)]
    pub doubao: DoubaoConfig,
    /// Conversation pipeline tuning
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Voice-activity detection tuning
    #[serde(default)]
    pub vad: VadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8093
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: default_host(), port: default_port() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret for connection tokens; generated at startup if unset
    #[serde(default)]
    pub jwt_secret: Option<String>,
    /// Connection-token lifetime in seconds
    #[serde(default = "default_ws_token_expire_secs")]
    pub ws_token_expire_secs: u64,
}

fn default_ws_token_expire_secs() -> u64 {
    7200
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self { jwt_secret: None, ws_token_expire_secs: default_ws_token_expire_secs() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolcConfig {
    /// Volcano app id (env `VOLC_APP_ID` overrides)
    #[serde(default)]
    pub app_id: Option<String>,
    /// Volcano access token (env `VOLC_ACCESS_TOKEN` overrides)
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_asr_ws_url")]
    pub asr_ws_url: String,
    #[serde(default = "default_tts_ws_url")]
    pub tts_ws_url: String,
    #[serde(default = "default_tts_voice_type")]
    pub tts_voice_type: String,
    /// Output sample rate requested from TTS; the pipeline emits pcm_s16le at this rate
    #[serde(default = "default_tts_sample_rate")]
    pub tts_sample_rate: u32,
}

fn default_asr_ws_url() -> String {
    "wss://openspeech.bytedance.com/api/v3/sauc/bigmodel".to_string()
}

fn default_tts_ws_url() -> String {
    "wss://openspeech.bytedance.com/api/v3/tts/unidirectional/stream".to_string()
}

fn default_tts_voice_type() -> String {
    "zh_female_tianmeixiaoyuan_moon_bigtts".to_string()
}

fn default_tts_sample_rate() -> u32 {
    16000
}

impl Default for VolcConfig {
    fn default() -> Self {
        Self {
            app_id: None,
            access_token: None,
            asr_ws_url: default_asr_ws_url(),
            tts_ws_url: default_tts_ws_url(),
            tts_voice_type: default_tts_voice_type(),
            tts_sample_rate: default_tts_sample_rate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoubaoConfig {
    /// Ark API key (env `DOUBAO_API_KEY` overrides)
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_doubao_model")]
    pub model_id: String,
    #[serde(default = "default_doubao_base_url")]
    pub base_url: String,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

fn default_doubao_model() -> String {
    "ep-20250120163453-j7slq".to_string()
}

fn default_doubao_base_url() -> String {
    "https://ark.cn-beijing.volces.com/api/v3".to_string()
}

fn default_max_output_tokens() -> u32 {
    16384
}

impl Default for DoubaoConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model_id: default_doubao_model(),
            base_url: default_doubao_base_url(),
            max_output_tokens: default_max_output_tokens(),
        }
    }
}

/// Tuning knobs for the conversation pipeline. All timeouts configurable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Close the connection after this long without any client envelope
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Close the connection after this long in LISTENING without audio
    #[serde(default = "default_listening_timeout_secs")]
    pub listening_timeout_secs: u64,
    /// Treat an unchanged ASR partial as final after this long
    #[serde(default = "default_partial_stable_ms")]
    pub partial_stable_ms: u64,
    /// Drop incoming audio for this long after a forced finalization
    #[serde(default = "default_forced_end_grace_ms")]
    pub forced_end_grace_ms: u64,
    /// Per-event receive timeout on the ASR stream
    #[serde(default = "default_provider_event_timeout_secs")]
    pub asr_event_timeout_secs: u64,
    /// Per-event receive timeout on the TTS stream
    #[serde(default = "default_provider_event_timeout_secs")]
    pub tts_event_timeout_secs: u64,
    /// TTL for every `conv:*` key in the shared store
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    /// TTL for the shared interrupt flag
    #[serde(default = "default_interrupt_ttl_secs")]
    pub interrupt_ttl_secs: u64,
    /// Number of trailing log entries fed back into the LLM prompt
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_listening_timeout_secs() -> u64 {
    60
}

fn default_partial_stable_ms() -> u64 {
    1500
}

fn default_forced_end_grace_ms() -> u64 {
    2000
}

fn default_provider_event_timeout_secs() -> u64 {
    30
}

fn default_session_ttl_secs() -> u64 {
    7200
}

fn default_interrupt_ttl_secs() -> u64 {
    10
}

fn default_history_limit() -> usize {
    10
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            listening_timeout_secs: default_listening_timeout_secs(),
            partial_stable_ms: default_partial_stable_ms(),
            forced_end_grace_ms: default_forced_end_grace_ms(),
            asr_event_timeout_secs: default_provider_event_timeout_secs(),
            tts_event_timeout_secs: default_provider_event_timeout_secs(),
            session_ttl_secs: default_session_ttl_secs(),
            interrupt_ttl_secs: default_interrupt_ttl_secs(),
            history_limit: default_history_limit(),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Resolution order: `TUTORLAMP_CONFIG` env var, then
    /// `~/.config/tutorlamp/config.toml`. A missing file yields defaults.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("TUTORLAMP_CONFIG") {
            return Self::load_from(Path::new(&path));
        }
        let path = config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default().with_env_overrides())
        }
    }

    /// Load configuration from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config.with_env_overrides())
    }

    /// Pull secrets from the environment when present.
    fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("VOLC_APP_ID") {
            self.volc.app_id = Some(v);
        }
        if let Ok(v) = std::env::var("VOLC_ACCESS_TOKEN") {
            self.volc.access_token = Some(v);
        }
        if let Ok(v) = std::env::var("DOUBAO_API_KEY") {
            self.doubao.api_key = Some(v);
        }
        if let Ok(v) = std::env::var("TUTORLAMP_JWT_SECRET") {
            self.auth.jwt_secret = Some(v);
        }
        self
    }
}

/// Default config file location
pub fn config_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("Could not determine config directory")?;
    Ok(base.join("tutorlamp").join("config.toml"))
}
