//! Two-tier session state
//!
//! The shared keyed store is the source of truth for cross-connection
//! continuity: session metadata, the rolled message log, context variables,
//! the cached system prompt, the interrupt flag, and the LLM resume cursor,
//! all under TTL'd `conv:*` keys. Per-connection state (FSM, audio channel,
//! VAD, timestamps) lives in the session actor and is rebuilt on every fresh
//! connection.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::types::{ConversationState, MessageKind, Role, SessionMeta, StoredMessage};

/// Minimal keyed-value contract the session store needs. The in-process
/// implementation lives in [`memory`]; an external store with the same
/// operations can replace it without touching the facade.
#[async_trait]
pub trait KeyedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;
    async fn hset_many(&self, key: &str, fields: &[(String, String)]) -> Result<()>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;
    async fn rpush(&self, key: &str, value: &str) -> Result<()>;
    async fn lrange_all(&self, key: &str) -> Result<Vec<String>>;
    async fn sadd(&self, key: &str, member: &str) -> Result<()>;
    async fn srem(&self, key: &str, member: &str) -> Result<()>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;
}

fn session_key(id: i64) -> String {
    format!("conv:session:{}", id)
}

fn messages_key(id: i64) -> String {
    format!("conv:messages:{}", id)
}

fn vars_key(id: i64) -> String {
    format!("conv:vars:{}", id)
}

fn prompt_key(id: i64) -> String {
    format!("conv:prompt:{}", id)
}

fn interrupt_key(id: i64) -> String {
    format!("conv:interrupt:{}", id)
}

fn cursor_key(id: i64) -> String {
    format!("conv:llm:cursor:{}", id)
}

fn active_conv_key(user_id: i64) -> String {
    format!("user:active_conv:{}", user_id)
}

const ACTIVE_SET_KEY: &str = "conv:active_set";

/// Typed facade over the keyed store for one deployment.
pub struct SessionStore {
    kv: Arc<dyn KeyedStore>,
    session_ttl: Duration,
    interrupt_ttl: Duration,
}

impl SessionStore {
    pub fn new(kv: Arc<dyn KeyedStore>, config: &Config) -> Self {
        Self {
            kv,
            session_ttl: Duration::from_secs(config.pipeline.session_ttl_secs),
            interrupt_ttl: Duration::from_secs(config.pipeline.interrupt_ttl_secs),
        }
    }

    // ── Session metadata ─────────────────────────────────────────

    /// Write a fresh session record plus its user mapping. Normally done by
    /// the conversation-create endpoint before the connection opens.
    pub async fn seed_session(
        &self,
        id: i64,
        meta: &SessionMeta,
        vars: &HashMap<String, String>,
    ) -> Result<()> {
        let key = session_key(id);
        self.kv.hset_many(&key, &meta.to_fields()).await?;
        self.kv.expire(&key, self.session_ttl).await?;

        if !vars.is_empty() {
            let fields: Vec<(String, String)> = vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            let key = vars_key(id);
            self.kv.hset_many(&key, &fields).await?;
            self.kv.expire(&key, self.session_ttl).await?;
        }

        self.kv
            .set(&active_conv_key(meta.user_id), &id.to_string(), Some(self.session_ttl))
            .await?;
        self.kv.sadd(ACTIVE_SET_KEY, &id.to_string()).await?;
        Ok(())
    }

    pub async fn load_session(&self, id: i64) -> Result<Option<SessionMeta>> {
        let fields = self.kv.hgetall(&session_key(id)).await?;
        Ok(SessionMeta::from_fields(&fields))
    }

    pub async fn touch_last_active(&self, id: i64) -> Result<()> {
        self.kv
            .hset_many(
                &session_key(id),
                &[("last_active_at".to_string(), Utc::now().to_rfc3339())],
            )
            .await
    }

    pub async fn set_state(&self, id: i64, state: ConversationState) -> Result<()> {
        self.kv
            .hset_many(&session_key(id), &[("state".to_string(), state.as_str().to_string())])
            .await
    }

    pub async fn set_ws_connected(&self, id: i64, connected: bool) -> Result<()> {
        self.kv
            .hset_many(&session_key(id), &[("ws_connected".to_string(), connected.to_string())])
            .await
    }

    pub async fn set_tts_playing(&self, id: i64, playing: bool) -> Result<()> {
        self.kv
            .hset_many(&session_key(id), &[("tts_playing".to_string(), playing.to_string())])
            .await
    }

    // ── Message log ──────────────────────────────────────────────

    pub async fn append_message(&self, id: i64, role: Role, kind: MessageKind, content: &str) -> Result<()> {
        let record = StoredMessage { role, kind, content: content.to_string(), timestamp: Utc::now() };
        let key = messages_key(id);
        self.kv.rpush(&key, &serde_json::to_string(&record)?).await?;
        self.kv.expire(&key, self.session_ttl).await
    }

    /// Full message log in append order. Unparseable records are skipped.
    pub async fn message_log(&self, id: i64) -> Result<Vec<StoredMessage>> {
        let raw = self.kv.lrange_all(&messages_key(id)).await?;
        Ok(raw.iter().filter_map(|line| serde_json::from_str(line).ok()).collect())
    }

    /// Trailing `limit` text messages, for prompt-length control.
    pub async fn recent_text_history(&self, id: i64, limit: usize) -> Result<Vec<StoredMessage>> {
        let mut log: Vec<StoredMessage> = self
            .message_log(id)
            .await?
            .into_iter()
            .filter(|m| m.kind == MessageKind::Text)
            .collect();
        if log.len() > limit {
            log.drain(..log.len() - limit);
        }
        Ok(log)
    }

    // ── Context variables and prompt cache ───────────────────────

    pub async fn context_vars(&self, id: i64) -> Result<HashMap<String, String>> {
        self.kv.hgetall(&vars_key(id)).await
    }

    pub async fn set_context_image(&self, id: i64, image_url: &str) -> Result<()> {
        let key = vars_key(id);
        self.kv
            .hset_many(&key, &[("context_image_url".to_string(), image_url.to_string())])
            .await?;
        self.kv.expire(&key, self.session_ttl).await
    }

    pub async fn cached_prompt(&self, id: i64) -> Result<Option<String>> {
        self.kv.get(&prompt_key(id)).await
    }

    pub async fn cache_prompt(&self, id: i64, prompt: &str) -> Result<()> {
        self.kv.set(&prompt_key(id), prompt, Some(self.session_ttl)).await
    }

    // ── Interrupt flag and resume cursor ─────────────────────────

    pub async fn set_interrupt(&self, id: i64) -> Result<()> {
        self.kv.set(&interrupt_key(id), "1", Some(self.interrupt_ttl)).await
    }

    pub async fn check_interrupt(&self, id: i64) -> Result<bool> {
        Ok(self.kv.get(&interrupt_key(id)).await?.as_deref() == Some("1"))
    }

    pub async fn clear_interrupt(&self, id: i64) -> Result<()> {
        self.kv.del(&interrupt_key(id)).await
    }

    pub async fn resume_cursor(&self, id: i64) -> Result<Option<String>> {
        self.kv.get(&cursor_key(id)).await
    }

    pub async fn save_resume_cursor(&self, id: i64, cursor: &str) -> Result<()> {
        self.kv.set(&cursor_key(id), cursor, Some(self.session_ttl)).await
    }

    // ── Teardown ─────────────────────────────────────────────────

    /// Collect the log for the durable rollup, then delete every key the
    /// session owns. The database write itself happens outside this crate.
    pub async fn end_session(&self, id: i64, user_id: i64) -> Result<Vec<StoredMessage>> {
        let log = self.message_log(id).await?;
        for key in [session_key(id), messages_key(id), vars_key(id), prompt_key(id), interrupt_key(id), cursor_key(id)] {
            self.kv.del(&key).await?;
        }
        self.kv.srem(ACTIVE_SET_KEY, &id.to_string()).await?;
        self.kv.del(&active_conv_key(user_id)).await?;
        Ok(log)
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryKeyedStore;
    use super::*;
    use crate::types::ConversationKind;

    fn store() -> SessionStore {
        SessionStore::new(Arc::new(MemoryKeyedStore::new()), &Config::default())
    }

    #[tokio::test]
    async fn test_seed_and_load_session() {
        let store = store();
        let meta = SessionMeta::new(42, ConversationKind::Tutoring);
        let vars = HashMap::from([("student_name".to_string(), "小明".to_string())]);
        store.seed_session(7, &meta, &vars).await.unwrap();

        let loaded = store.load_session(7).await.unwrap().unwrap();
        assert_eq!(loaded.user_id, 42);
        assert_eq!(loaded.kind, ConversationKind::Tutoring);
        assert_eq!(
            store.context_vars(7).await.unwrap().get("student_name").map(String::as_str),
            Some("小明")
        );
    }

    #[tokio::test]
    async fn test_message_log_roundtrip_and_trim() {
        let store = store();
        for i in 0..12 {
            store
                .append_message(7, Role::User, MessageKind::Text, &format!("m{}", i))
                .await
                .unwrap();
        }
        store.append_message(7, Role::User, MessageKind::Image, "http://img").await.unwrap();

        let all = store.message_log(7).await.unwrap();
        assert_eq!(all.len(), 13);

        let recent = store.recent_text_history(7, 10).await.unwrap();
        assert_eq!(recent.len(), 10);
        assert_eq!(recent[0].content, "m2");
        assert_eq!(recent[9].content, "m11");
    }

    #[tokio::test]
    async fn test_interrupt_flag_lifecycle() {
        let store = store();
        assert!(!store.check_interrupt(7).await.unwrap());
        store.set_interrupt(7).await.unwrap();
        assert!(store.check_interrupt(7).await.unwrap());
        store.clear_interrupt(7).await.unwrap();
        assert!(!store.check_interrupt(7).await.unwrap());
    }

    #[tokio::test]
    async fn test_end_session_clears_keys() {
        let store = store();
        let meta = SessionMeta::new(42, ConversationKind::Chat);
        store.seed_session(7, &meta, &HashMap::new()).await.unwrap();
        store.append_message(7, Role::User, MessageKind::Text, "hi").await.unwrap();
        store.save_resume_cursor(7, "resp_1").await.unwrap();

        let log = store.end_session(7, 42).await.unwrap();
        assert_eq!(log.len(), 1);
        assert!(store.load_session(7).await.unwrap().is_none());
        assert!(store.resume_cursor(7).await.unwrap().is_none());
        assert!(store.message_log(7).await.unwrap().is_empty());
    }
}
