//! In-process keyed store
//!
//! Single-node backing for the shared keyed store: a map of typed values
//! with lazy per-key TTL expiry. Swapping in an external store later only
//! means implementing [`KeyedStore`] against it.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use super::KeyedStore;

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Hash(HashMap<String, String>),
    List(Vec<String>),
    Set(HashSet<String>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Text(_) => "string",
            Value::Hash(_) => "hash",
            Value::List(_) => "list",
            Value::Set(_) => "set",
        }
    }
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.map(|at| Instant::now() >= at).unwrap_or(false)
    }
}

#[derive(Default)]
pub struct MemoryKeyedStore {
    inner: RwLock<HashMap<String, Entry>>,
}

impl MemoryKeyedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` over the live (non-expired) entry for `key`, creating it with
    /// `seed` when absent.
    fn with_entry<T>(&self, key: &str, seed: impl FnOnce() -> Value, f: impl FnOnce(&mut Entry) -> Result<T>) -> Result<T> {
        let mut map = self.inner.write().expect("store lock poisoned");
        if map.get(key).map(|e| e.expired()).unwrap_or(false) {
            map.remove(key);
        }
        let entry = map
            .entry(key.to_string())
            .or_insert_with(|| Entry { value: seed(), expires_at: None });
        f(entry)
    }

    fn read_entry<T>(&self, key: &str, f: impl FnOnce(&Entry) -> T) -> Option<T> {
        {
            let map = self.inner.read().expect("store lock poisoned");
            match map.get(key) {
                Some(entry) if !entry.expired() => return Some(f(entry)),
                Some(_) => {}
                None => return None,
            }
        }
        // Expired: drop it under the write lock
        let mut map = self.inner.write().expect("store lock poisoned");
        if map.get(key).map(|e| e.expired()).unwrap_or(false) {
            map.remove(key);
        }
        None
    }
}

fn wrong_type(key: &str, found: &Value) -> anyhow::Error {
    anyhow::anyhow!("key {} holds a {} value", key, found.type_name())
}

#[async_trait]
impl KeyedStore for MemoryKeyedStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .read_entry(key, |entry| match &entry.value {
                Value::Text(s) => Some(s.clone()),
                _ => None,
            })
            .flatten())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut map = self.inner.write().expect("store lock poisoned");
        map.insert(
            key.to_string(),
            Entry { value: Value::Text(value.to_string()), expires_at: ttl.map(|t| Instant::now() + t) },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.inner.write().expect("store lock poisoned").remove(key);
        Ok(())
    }

    async fn hset_many(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        self.with_entry(key, || Value::Hash(HashMap::new()), |entry| match &mut entry.value {
            Value::Hash(hash) => {
                for (field, value) in fields {
                    hash.insert(field.clone(), value.clone());
                }
                Ok(())
            }
            other => bail!(wrong_type(key, other)),
        })
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self
            .read_entry(key, |entry| match &entry.value {
                Value::Hash(hash) => hash.get(field).cloned(),
                _ => None,
            })
            .flatten())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self
            .read_entry(key, |entry| match &entry.value {
                Value::Hash(hash) => hash.clone(),
                _ => HashMap::new(),
            })
            .unwrap_or_default())
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<()> {
        self.with_entry(key, || Value::List(Vec::new()), |entry| match &mut entry.value {
            Value::List(list) => {
                list.push(value.to_string());
                Ok(())
            }
            other => bail!(wrong_type(key, other)),
        })
    }

    async fn lrange_all(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .read_entry(key, |entry| match &entry.value {
                Value::List(list) => list.clone(),
                _ => Vec::new(),
            })
            .unwrap_or_default())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        self.with_entry(key, || Value::Set(HashSet::new()), |entry| match &mut entry.value {
            Value::Set(set) => {
                set.insert(member.to_string());
                Ok(())
            }
            other => bail!(wrong_type(key, other)),
        })
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut map = self.inner.write().expect("store lock poisoned");
        if let Some(Entry { value: Value::Set(set), .. }) = map.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut map = self.inner.write().expect("store lock poisoned");
        if let Some(entry) = map.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }
}
