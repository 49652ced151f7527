//! Connection registry
//!
//! At most one live connection per conversation. A new admit supersedes the
//! old one: the old connection receives a close frame and its receive loop
//! is cancelled through its notify handle. Sends are best-effort; a failed
//! send drops the registration so the session actor notices on its next
//! send.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};

use crate::protocol::ServerEnvelope;

/// One item on a connection's single-writer channel
#[derive(Debug)]
pub enum Outbound {
    Envelope(ServerEnvelope),
    Close { code: u16, reason: String },
}

struct Registered {
    tx: mpsc::Sender<Outbound>,
    cancelled: Arc<Notify>,
    generation: u64,
}

/// Ticket returned by `admit`; identifies this registration on removal so a
/// superseded connection cannot evict its successor.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionTicket {
    pub generation: u64,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    inner: Mutex<HashMap<i64, Registered>>,
    next_generation: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a connection, displacing any prior one for the conversation.
    pub fn admit(
        &self,
        conv_id: i64,
        tx: mpsc::Sender<Outbound>,
        cancelled: Arc<Notify>,
    ) -> ConnectionTicket {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let old = {
            let mut map = self.inner.lock().expect("registry lock poisoned");
            map.insert(conv_id, Registered { tx, cancelled, generation })
        };
        if let Some(old) = old {
            info!(conv_id, "superseding existing connection");
            let _ = old.tx.try_send(Outbound::Close {
                code: 1000,
                reason: "New connection established".to_string(),
            });
            old.cancelled.notify_waiters();
        }
        ConnectionTicket { generation }
    }

    /// Remove a registration if it still belongs to `ticket`.
    /// Returns true when this call actually removed the entry.
    pub fn remove(&self, conv_id: i64, ticket: ConnectionTicket) -> bool {
        let mut map = self.inner.lock().expect("registry lock poisoned");
        match map.get(&conv_id) {
            Some(registered) if registered.generation == ticket.generation => {
                map.remove(&conv_id);
                true
            }
            _ => false,
        }
    }

    /// Best-effort envelope send. A full or closed channel unregisters the
    /// connection and reports failure.
    pub async fn send(&self, conv_id: i64, envelope: ServerEnvelope) -> bool {
        let (tx, generation) = {
            let map = self.inner.lock().expect("registry lock poisoned");
            match map.get(&conv_id) {
                Some(registered) => (registered.tx.clone(), registered.generation),
                None => return false,
            }
        };
        if tx.send(Outbound::Envelope(envelope)).await.is_err() {
            debug!(conv_id, "send failed, dropping connection");
            self.remove(conv_id, ConnectionTicket { generation });
            return false;
        }
        true
    }

    pub fn is_connected(&self, conv_id: i64) -> bool {
        self.inner.lock().expect("registry lock poisoned").contains_key(&conv_id)
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().expect("registry lock poisoned").len()
    }
}
