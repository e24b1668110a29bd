//! Local store: durable per-installation cache of collections and the checkpoint.
//!
//! Two layers:
//! - `KeyValueStore`: the platform collaborator, an async byte-slot store.
//!   Implementations:
//!   - `InMemoryKv` - For testing
//!   - `NativeKv` (in casefile-daemon) - One file per slot, via tokio::fs
//! - `LocalStore`: the typed contract the engine uses. It namespaces slots by
//!   organisation, serializes with serde_json, and refuses to persist plaintext
//!   of sensitive collections.
//!
//! Every write must be durable before it returns, or fail, so the sync engine
//! never advances the checkpoint past data that did not reach the disk.

use crate::collection::Collection;
use crate::entity::{Checkpoint, Entity, Record};
use crate::merge::{merge, MergeOptions, TombstoneLedger};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Refusing to persist plaintext of sensitive collection {0}")]
    SensitivePlaintext(Collection),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Platform-independent durable key-value slots.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a slot (None if never written)
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write a slot; durable once this returns Ok
    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove a slot (no-op if absent)
    async fn remove(&self, key: &str) -> Result<()>;

    /// List slot keys starting with `prefix`
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// In-memory key-value store for testing
#[derive(Default)]
pub struct InMemoryKv {
    slots: RwLock<HashMap<String, Vec<u8>>>,
    /// Keys whose writes fail, to simulate a full or broken disk
    failing: RwLock<HashSet<String>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every future write to `key` fail.
    pub fn fail_writes_to(&self, key: &str) {
        self.failing
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string());
    }

    /// Let writes to `key` succeed again.
    pub fn heal(&self, key: &str) {
        self.failing
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        Ok(slots.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        if self
            .failing
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
        {
            return Err(StoreError::Io(format!("write to {key} failed")));
        }
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        slots.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        slots.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<String> = slots
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

// Sharing one store between several owners (sync engine, guard, tests)
#[async_trait]
impl<T: KeyValueStore> KeyValueStore for std::sync::Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        (**self).set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        (**self).remove(key).await
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        (**self).keys(prefix).await
    }
}

const CHECKPOINT_SLOT: &str = "checkpoint";
const TOMBSTONES_SUFFIX: &str = "tombstones";

/// Typed, organisation-scoped view over a `KeyValueStore`.
pub struct LocalStore<S: KeyValueStore> {
    kv: S,
    namespace: String,
    /// Serializes read-merge-write cycles on collection slots
    write_lock: Mutex<()>,
}

impl<S: KeyValueStore> LocalStore<S> {
    pub fn new(kv: S, organisation_id: &str) -> Self {
        Self {
            kv,
            namespace: organisation_id.to_string(),
            write_lock: Mutex::new(()),
        }
    }

    /// The underlying key-value store.
    pub fn kv(&self) -> &S {
        &self.kv
    }

    /// Full key of a slot in this organisation's namespace.
    pub fn key(&self, slot: &str) -> String {
        format!("{}/{}", self.namespace, slot)
    }

    /// Decrypted items of a non-sensitive collection.
    pub async fn get(&self, collection: Collection) -> Result<Vec<Entity>> {
        if collection.is_sensitive() {
            return Err(StoreError::SensitivePlaintext(collection));
        }
        Ok(self.read_slot(collection.slot()).await?.unwrap_or_default())
    }

    /// Replace a non-sensitive collection's cached items.
    pub async fn set(&self, collection: Collection, items: &[Entity]) -> Result<()> {
        if collection.is_sensitive() {
            return Err(StoreError::SensitivePlaintext(collection));
        }
        self.write_slot(collection.slot(), &items).await
    }

    /// Ciphertext records of a collection.
    pub async fn get_raw(&self, collection: Collection) -> Result<Vec<Record>> {
        Ok(self.read_slot(collection.slot()).await?.unwrap_or_default())
    }

    /// Replace a collection's cached ciphertext records.
    pub async fn set_raw(&self, collection: Collection, items: &[Record]) -> Result<()> {
        self.write_slot(collection.slot(), &items).await
    }

    pub async fn get_checkpoint(&self) -> Result<Checkpoint> {
        Ok(self.read_slot(CHECKPOINT_SLOT).await?.unwrap_or_default())
    }

    pub async fn set_checkpoint(&self, checkpoint: Checkpoint) -> Result<()> {
        self.write_slot(CHECKPOINT_SLOT, &checkpoint).await
    }

    pub async fn get_ledger(&self, collection: Collection) -> Result<TombstoneLedger> {
        let slot = format!("{}.{}", collection.slot(), TOMBSTONES_SUFFIX);
        Ok(self.read_slot(&slot).await?.unwrap_or_default())
    }

    pub async fn set_ledger(&self, collection: Collection, ledger: &TombstoneLedger) -> Result<()> {
        let slot = format!("{}.{}", collection.slot(), TOMBSTONES_SUFFIX);
        self.write_slot(&slot, ledger).await
    }

    /// Note a deletion in a collection's tombstone ledger.
    pub async fn record_tombstone(
        &self,
        collection: Collection,
        id: &str,
        deleted_at: DateTime<Utc>,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut ledger = self.get_ledger(collection).await?;
        ledger.record(id, deleted_at);
        self.set_ledger(collection, &ledger).await
    }

    /// Merge decrypted items into a non-sensitive collection's cache, atomically
    /// with respect to other merges through this store. Returns the merged cache.
    pub async fn merge_entities(
        &self,
        collection: Collection,
        incoming: Vec<Entity>,
        options: &MergeOptions<'_, Entity>,
    ) -> Result<Vec<Entity>> {
        let _guard = self.write_lock.lock().await;
        let cached = self.get(collection).await?;
        let merged = merge(cached, incoming, options);
        self.set(collection, &merged).await?;
        Ok(merged)
    }

    /// Merge ciphertext records into a collection's cache. Returns the merged cache.
    pub async fn merge_records(
        &self,
        collection: Collection,
        incoming: Vec<Record>,
    ) -> Result<Vec<Record>> {
        let _guard = self.write_lock.lock().await;
        let cached = self.get_raw(collection).await?;
        let merged = merge(cached, incoming, &MergeOptions::none());
        self.set_raw(collection, &merged).await?;
        Ok(merged)
    }

    /// Remove every slot of this organisation (logout).
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let prefix = format!("{}/", self.namespace);
        for key in self.kv.keys(&prefix).await? {
            self.kv.remove(&key).await?;
        }
        Ok(())
    }

    async fn read_slot<T: DeserializeOwned>(&self, slot: &str) -> Result<Option<T>> {
        match self.kv.get(&self.key(slot)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn write_slot<T: Serialize + ?Sized>(&self, slot: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.kv.set(&self.key(slot), &bytes).await
    }
}
