//! EntityGuard: guarded mutations of entities edited from more than one place.
//!
//! `with_fresh_entity` re-reads the authoritative copy from the server right
//! before writing, applies a pure transform to it, records the change in the
//! entity's history and writes it back. Mutations of the same entity are
//! serialized behind a per-entity lock, so a second mutation's fresh read
//! always observes the first one's write.
//!
//! If the fresh read fails the mutation is abandoned and surfaced to the user,
//! never applied against the possibly stale local copy.

use crate::api::{ApiClient, ApiRequest, TransportError};
use crate::cipher::{open_record, seal_entity, CipherError, OrganisationKey};
use crate::collection::{Collection, MergeContext};
use crate::entity::{Entity, Record};
use crate::events::{EventBus, SyncEvent};
use crate::history;
use crate::merge::MergeOptions;
use crate::session::{SyncSession, TerminationReason};
use crate::store::{KeyValueStore, LocalStore, StoreError};
use crate::sync_engine::SyncError;
use crate::tree::{DocumentTree, TreeError};

use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("Could not reload {collection} {id} before writing: {source}")]
    FreshRead {
        collection: Collection,
        id: String,
        #[source]
        source: TransportError,
    },

    #[error("{collection} {id} has been deleted")]
    Deleted { collection: Collection, id: String },

    #[error("Server refused the write: {0}")]
    Write(#[source] TransportError),

    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Session terminated: {0}")]
    SessionTerminated(TerminationReason),

    #[error("Document tree error: {0}")]
    Tree(#[from] TreeError),
}

pub type Result<T> = std::result::Result<T, GuardError>;

impl GuardError {
    /// Message to show the person who triggered the mutation.
    pub fn user_message(&self) -> String {
        match self {
            GuardError::FreshRead { .. } | GuardError::Write(_) => {
                "The change could not be saved because the server is unreachable. Please retry."
                    .to_string()
            }
            GuardError::Deleted { .. } => {
                "This item was deleted in the meantime; the change was not saved.".to_string()
            }
            GuardError::SessionTerminated(_) => {
                "Your session has ended. Please log in again.".to_string()
            }
            GuardError::Tree(error) => format!("The documents could not be rearranged: {error}"),
            GuardError::Cipher(_) | GuardError::Store(_) => {
                "The change could not be saved. Please retry.".to_string()
            }
        }
    }
}

type EntityLock = Arc<tokio::sync::Mutex<()>>;

/// Guarded writes for one session: its key and author identity.
pub struct EntityGuard<A: ApiClient, S: KeyValueStore> {
    api: Arc<A>,
    store: Arc<LocalStore<S>>,
    events: Arc<EventBus>,
    key: OrganisationKey,
    user_id: String,
    organisation_id: String,
    locks: Mutex<HashMap<(Collection, String), EntityLock>>,
}

impl<A: ApiClient, S: KeyValueStore> EntityGuard<A, S> {
    /// A guard writing on behalf of an active session.
    pub fn for_session(
        api: Arc<A>,
        store: Arc<LocalStore<S>>,
        events: Arc<EventBus>,
        session: &SyncSession,
    ) -> Result<Self> {
        let key = session.key().map_err(|e| match e {
            SyncError::SessionTerminated(reason) => GuardError::SessionTerminated(reason),
            _ => GuardError::SessionTerminated(TerminationReason::LoggedOut),
        })?;
        Ok(Self {
            api,
            store,
            events,
            key: key.clone(),
            user_id: session.user.id.clone(),
            organisation_id: session.organisation_id().to_string(),
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Apply `mutate` to a freshly read copy of an entity and write it back.
    ///
    /// Returns the server's canonical form of the written entity, already cached
    /// in the local store. When `mutate` changes nothing, nothing is written.
    pub async fn with_fresh_entity<F>(
        &self,
        collection: Collection,
        id: &str,
        mutate: F,
    ) -> Result<Entity>
    where
        F: FnOnce(Entity) -> Entity + Send,
    {
        let lock = self.entity_lock(collection, id);
        let held = lock.lock().await;

        let result = self.mutate_locked(collection, id, mutate).await;

        drop(held);
        self.release_lock(collection, id, lock);
        result
    }

    /// Edit an entity's `documents` array as a tree, against a fresh copy.
    ///
    /// The array is rebuilt with dangling and cyclic nodes repaired before
    /// `edit` runs. If `edit` fails nothing is written.
    pub async fn with_fresh_documents<F>(
        &self,
        collection: Collection,
        id: &str,
        edit: F,
    ) -> Result<Entity>
    where
        F: FnOnce(&mut DocumentTree) -> crate::tree::Result<()> + Send,
    {
        let mut failure = None;
        let entity = self
            .with_fresh_entity(collection, id, |mut entity| {
                match edit_documents(entity.field(DOCUMENTS_FIELD), edit) {
                    Ok(documents) => entity.set_field(DOCUMENTS_FIELD, documents),
                    Err(error) => failure = Some(error),
                }
                entity
            })
            .await?;
        match failure {
            Some(error) => Err(error.into()),
            None => Ok(entity),
        }
    }

    async fn mutate_locked<F>(&self, collection: Collection, id: &str, mutate: F) -> Result<Entity>
    where
        F: FnOnce(Entity) -> Entity + Send,
    {
        let fresh = match self.fetch(collection, id).await {
            Ok(record) => record,
            Err(source) => {
                warn!("Abandoning mutation of {} {}: {}", collection, id, source);
                self.events.emit(SyncEvent::MutationAbandoned {
                    collection,
                    id: id.to_string(),
                    error: source.to_string(),
                });
                return Err(GuardError::FreshRead {
                    collection,
                    id: id.to_string(),
                    source,
                });
            }
        };
        if fresh.is_tombstoned() {
            return Err(GuardError::Deleted {
                collection,
                id: id.to_string(),
            });
        }

        let current = open_record(&fresh, &self.key)?;
        let mut next = mutate(current.clone());
        next.id = current.id.clone();
        next.organisation = current.organisation.clone();
        next.created_at = current.created_at;
        next.deleted_at = None;
        next.history = current.history.clone();

        if next.fields == current.fields {
            debug!("Mutation of {} {} changed nothing", collection, id);
            return Ok(current);
        }
        if let Some(entry) = history::diff(&current, &next, &self.user_id, Utc::now()) {
            next.history.push(entry);
        }

        let record = seal_entity(&next, &self.key)?;
        let request = ApiRequest::new(format!("{}/{}", collection.path(), id))
            .body(to_body(&record)?);
        let stored: Record = self
            .api
            .put(request)
            .await
            .and_then(|response| response.parse())
            .map_err(GuardError::Write)?;

        self.settle(collection, stored).await
    }

    /// Create an entity on the server; the server's answer is cached and returned.
    pub async fn create(&self, collection: Collection, fields: Map<String, Value>) -> Result<Entity> {
        let draft = Entity::new(&self.organisation_id, fields);
        let record = seal_entity(&draft, &self.key)?;
        let stored: Record = self
            .api
            .post(ApiRequest::new(collection.path()).body(to_body(&record)?))
            .await
            .and_then(|response| response.parse())
            .map_err(GuardError::Write)?;

        debug!("Created {} {}", collection, stored.id);
        self.settle(collection, stored).await
    }

    /// Tombstone an entity on the server. The tombstone is merged into the cache,
    /// which drops the entity from it.
    pub async fn tombstone(&self, collection: Collection, id: &str) -> Result<Entity> {
        let lock = self.entity_lock(collection, id);
        let held = lock.lock().await;

        let result = async {
            let stored: Record = self
                .api
                .delete(ApiRequest::new(format!("{}/{}", collection.path(), id)))
                .await
                .and_then(|response| response.parse())
                .map_err(GuardError::Write)?;
            self.settle(collection, stored).await
        }
        .await;

        drop(held);
        self.release_lock(collection, id, lock);
        result
    }

    /// Open the server's stored record and merge it into the local cache.
    ///
    /// Tombstones also go to the ledger, so a delta still carrying an older
    /// copy cannot bring the entity back.
    async fn settle(&self, collection: Collection, stored: Record) -> Result<Entity> {
        let canonical = open_record(&stored, &self.key)?;
        if let Some(deleted_at) = stored.deleted_at {
            self.store
                .record_tombstone(collection, &stored.id, deleted_at)
                .await?;
        }

        if collection.is_sensitive() {
            self.store.merge_records(collection, vec![stored]).await?;
        } else {
            let strategy = collection.strategy();
            let ctx = MergeContext {
                user_id: self.user_id.clone(),
            };
            let reshape = |entity: Entity| strategy.apply_reshape(entity);
            let keep = |entity: &Entity| strategy.keeps(entity, &ctx);
            let options = MergeOptions {
                reshape: Some(&reshape),
                keep: Some(&keep),
            };
            self.store
                .merge_entities(collection, vec![canonical.clone()], &options)
                .await?;
        }
        Ok(canonical)
    }

    async fn fetch(&self, collection: Collection, id: &str) -> std::result::Result<Record, TransportError> {
        self.api
            .get(ApiRequest::new(format!("{}/{}", collection.path(), id)))
            .await?
            .parse()
    }

    fn entity_lock(&self, collection: Collection, id: &str) -> EntityLock {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            locks
                .entry((collection, id.to_string()))
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Forget an entity's lock once nobody else holds or waits on it.
    fn release_lock(&self, collection: Collection, id: &str, lock: EntityLock) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // One reference in the map, one here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&(collection, id.to_string()));
        }
    }

    /// Entities with a lock entry (held or awaited).
    pub fn pending(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

const DOCUMENTS_FIELD: &str = "documents";

fn edit_documents<F>(documents: &Value, edit: F) -> crate::tree::Result<Value>
where
    F: FnOnce(&mut DocumentTree) -> crate::tree::Result<()>,
{
    let (mut tree, repairs) = DocumentTree::from_documents(documents)?;
    for repair in repairs {
        warn!("Repaired document tree: {:?}", repair);
    }
    edit(&mut tree)?;
    tree.to_documents()
}

fn to_body(record: &Record) -> Result<Value> {
    serde_json::to_value(record).map_err(|e| GuardError::Cipher(CipherError::Payload(e)))
}
