//! DeltaSync: pulls per-collection deltas from the server into the local store.
//!
//! A pass works as follows:
//!
//! 1. Refresh the caller's profile; a disabled tenant or a rotated organisation
//!    key terminates the session instead of continuing
//! 2. Fetch server time and the per-collection change counts since the checkpoint
//!    (counts only size the progress report)
//! 3. For each collection with pending changes, in `Collection::ALL` order:
//!    - page through every record changed after the checkpoint
//!    - drop updates that lost the race against a recorded tombstone
//!    - decrypt, merge with the cache, persist (ciphertext only for sensitive
//!      collections), then fold into the session's working set
//! 4. Only if every collection merged, persist the server's time as the new
//!    checkpoint
//!
//! A failed collection never rolls back the ones merged before it; the next pass
//! re-requests the same window, which is safe because merge is idempotent.

use crate::api::{ApiClient, ApiRequest, TransportError};
use crate::cipher::{open_record, CipherError};
use crate::collection::Collection;
use crate::entity::{Checkpoint, Entity, Record};
use crate::events::{EventBus, SyncEvent};
use crate::merge::MergeOptions;
use crate::session::{ProfileResponse, SyncSession, TerminationReason};
use crate::store::{KeyValueStore, LocalStore, StoreError};

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use web_time::Instant;

/// Records requested per delta page unless configured otherwise.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Session terminated: {0}")]
    SessionTerminated(TerminationReason),

    #[error("Invalid server response: {0}")]
    InvalidResponse(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Request every collection from the epoch, ignoring change counts
    pub full_resync: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Every collection merged and the checkpoint advanced
    Completed,
    /// Some collections failed; the checkpoint did not move
    Partial,
    /// Another pass was in flight; this request was a no-op
    Coalesced,
    /// The session ended (before or during the pass)
    Terminated(TerminationReason),
    /// The pass could not start (profile or server time unavailable)
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionFailure {
    /// None for failures outside any collection (profile, server time, checkpoint)
    pub collection: Option<Collection>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptRecord {
    pub collection: Collection,
    pub id: String,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct SyncReport {
    pub status: SyncStatus,
    /// Delta size per merged collection
    pub merged: BTreeMap<Collection, usize>,
    pub failures: Vec<CollectionFailure>,
    pub corrupt: Vec<CorruptRecord>,
    /// Updates dropped because a newer tombstone was on record
    pub stale: Vec<(Collection, String)>,
    /// Sum of the server's change counts, when available
    pub expected_changes: Option<usize>,
    /// Checkpoint after the pass
    pub checkpoint: Checkpoint,
    pub elapsed: Duration,
}

impl SyncReport {
    fn new(status: SyncStatus, checkpoint: Checkpoint) -> Self {
        Self {
            status,
            merged: BTreeMap::new(),
            failures: Vec::new(),
            corrupt: Vec::new(),
            stale: Vec::new(),
            expected_changes: None,
            checkpoint,
            elapsed: Duration::ZERO,
        }
    }

    fn fail(&mut self, collection: Option<Collection>, error: impl ToString) {
        self.failures.push(CollectionFailure {
            collection,
            error: error.to_string(),
        });
    }
}

/// A pass always hands the session back, whatever happened to it.
#[derive(Debug)]
pub struct SyncOutcome {
    pub session: SyncSession,
    pub report: SyncReport,
}

/// A decrypted delta.
struct OpenedDelta {
    records: Vec<Record>,
    entities: Vec<Entity>,
    corrupt: Vec<Record>,
}

/// Tombstone form of a record that failed to open: merging it evicts any
/// cached copy of the id, and it never survives a merge itself.
fn eviction_marker(record: Record) -> Record {
    Record {
        deleted_at: record.deleted_at.or(Some(record.updated_at)),
        encrypted: None,
        encrypted_entity_key: None,
        ..record
    }
}

/// Clears the in-flight flag when a pass ends, even on early return.
struct ActivePass<'a>(&'a AtomicBool);

impl Drop for ActivePass<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The delta sync client.
pub struct DeltaSync<A: ApiClient, S: KeyValueStore> {
    api: Arc<A>,
    store: Arc<LocalStore<S>>,
    events: Arc<EventBus>,
    page_size: usize,
    active: AtomicBool,
}

impl<A: ApiClient, S: KeyValueStore> DeltaSync<A, S> {
    pub fn new(api: Arc<A>, store: Arc<LocalStore<S>>, events: Arc<EventBus>) -> Self {
        Self {
            api,
            store,
            events,
            page_size: DEFAULT_PAGE_SIZE,
            active: AtomicBool::new(false),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn store(&self) -> &Arc<LocalStore<S>> {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Whether a pass is currently in flight.
    pub fn is_syncing(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Run one sync pass.
    ///
    /// A request arriving while another pass is in flight returns immediately
    /// with `SyncStatus::Coalesced`; the running pass covers it.
    pub async fn sync(&self, session: SyncSession, options: SyncOptions) -> SyncOutcome {
        if self.active.swap(true, Ordering::AcqRel) {
            debug!("Sync already in flight, coalescing");
            let report = SyncReport::new(SyncStatus::Coalesced, session.checkpoint);
            return SyncOutcome { session, report };
        }
        let _active = ActivePass(&self.active);
        let started = Instant::now();

        let mut outcome = self.run_pass(session, options).await;
        outcome.report.elapsed = started.elapsed();
        info!(
            "Sync pass finished: {:?}, {} collections merged, {} failures in {:?}",
            outcome.report.status,
            outcome.report.merged.len(),
            outcome.report.failures.len(),
            outcome.report.elapsed
        );
        outcome
    }

    async fn run_pass(&self, session: SyncSession, options: SyncOptions) -> SyncOutcome {
        let mut report = SyncReport::new(SyncStatus::Failed, session.checkpoint);

        if let Some(reason) = session.termination() {
            report.status = SyncStatus::Terminated(reason);
            return SyncOutcome { session, report };
        }

        // 1. Profile refresh
        let mut session = match self.refresh_profile(session).await {
            Ok(session) => session,
            Err((session, error)) => {
                warn!("Profile refresh failed: {}", error);
                report.fail(None, error);
                return SyncOutcome { session, report };
            }
        };
        if let Some(reason) = session.termination() {
            report.status = SyncStatus::Terminated(reason);
            return SyncOutcome { session, report };
        }

        // 2. Server time and change counts
        let server_now = match self.server_time().await {
            Ok(now) => now,
            Err(error) => {
                warn!("Could not fetch server time: {}", error);
                report.fail(None, error);
                return SyncOutcome { session, report };
            }
        };
        let after = if options.full_resync {
            Checkpoint::epoch()
        } else {
            session.checkpoint
        };
        self.events.emit(SyncEvent::SyncStarted {
            after: after.as_millis(),
            full_resync: options.full_resync,
        });

        let stats = if options.full_resync {
            None
        } else {
            match self.change_counts(after).await {
                Ok(stats) => Some(stats),
                Err(error) => {
                    warn!("Stats unavailable, fetching every collection: {}", error);
                    None
                }
            }
        };
        report.expected_changes = stats.as_ref().map(|s| s.values().sum());

        // 3. Collections, in fixed order
        let mut loaded = 0;
        for collection in Collection::ALL {
            let pending = stats
                .as_ref()
                .map(|s| s.get(collection.strategy().stats_key).copied().unwrap_or(0));
            if pending == Some(0) {
                continue;
            }

            match self
                .sync_collection(&mut session, collection, after, &mut report)
                .await
            {
                Ok(received) => {
                    loaded += received;
                    report.merged.insert(collection, received);
                }
                Err(error) => {
                    warn!("Sync of {} failed: {}", collection, error);
                    self.events.emit(SyncEvent::CollectionFailed {
                        collection,
                        error: error.to_string(),
                    });
                    report.fail(Some(collection), error);
                }
            }
            self.events.emit(SyncEvent::Progress {
                loaded,
                expected: report.expected_changes,
            });
        }

        // 4. Checkpoint, last
        if !report.failures.is_empty() {
            report.status = SyncStatus::Partial;
            return SyncOutcome { session, report };
        }
        let next = session.checkpoint.max(server_now);
        match self.store.set_checkpoint(next).await {
            Ok(()) => {
                session.checkpoint = next;
                report.checkpoint = next;
                report.status = SyncStatus::Completed;
                self.events.emit(SyncEvent::CheckpointAdvanced {
                    checkpoint: next.as_millis(),
                });
            }
            Err(error) => {
                warn!("Could not persist checkpoint: {}", error);
                report.fail(None, error);
                report.status = SyncStatus::Partial;
            }
        }
        SyncOutcome { session, report }
    }

    /// Rebuild the working set from the local store (cold start).
    ///
    /// Sensitive collections are decrypted in memory; corrupt records are
    /// reported and skipped.
    pub async fn hydrate(&self, mut session: SyncSession) -> SyncOutcome {
        let mut report = SyncReport::new(SyncStatus::Completed, session.checkpoint);
        if let Some(reason) = session.termination() {
            report.status = SyncStatus::Terminated(reason);
            return SyncOutcome { session, report };
        }

        match self.store.get_checkpoint().await {
            Ok(checkpoint) => {
                session.checkpoint = session.checkpoint.max(checkpoint);
                report.checkpoint = session.checkpoint;
            }
            Err(error) => report.fail(None, error),
        }

        let ctx = session.merge_context();
        for collection in Collection::ALL {
            let cached = match self.load_cached(&session, collection, &mut report).await {
                Ok(cached) => cached,
                Err(error) => {
                    warn!("Could not hydrate {}: {}", collection, error);
                    report.fail(Some(collection), error);
                    continue;
                }
            };
            report.merged.insert(collection, cached.len());
            session.working_set.replace(collection, Vec::new());
            session.working_set.absorb(collection, cached, &ctx);
        }

        if !report.failures.is_empty() {
            report.status = SyncStatus::Partial;
        }
        info!(
            "Hydrated {} entities from local store (checkpoint {})",
            session.working_set.len(),
            session.checkpoint
        );
        SyncOutcome { session, report }
    }

    /// End the session and wipe the organisation's local namespace.
    pub async fn logout(&self, session: SyncSession) -> Result<SyncSession> {
        self.store.clear().await?;
        info!("Logged out of organisation {}", session.organisation_id());
        Ok(session.terminate(TerminationReason::LoggedOut))
    }

    async fn refresh_profile(
        &self,
        session: SyncSession,
    ) -> std::result::Result<SyncSession, (SyncSession, SyncError)> {
        let profile: ProfileResponse = match self.fetch_profile().await {
            Ok(profile) => profile,
            Err(error) => return Err((session, error)),
        };

        if profile.organisation.disabled {
            return Ok(self
                .terminate(session, TerminationReason::OrganisationDisabled)
                .await);
        }
        if profile.organisation.encryption_last_update_at
            != session.organisation.encryption_last_update_at
        {
            return Ok(self.terminate(session, TerminationReason::KeyRotated).await);
        }

        let mut session = session;
        session.user = profile.user;
        session.organisation = profile.organisation;
        Ok(session)
    }

    async fn fetch_profile(&self) -> Result<ProfileResponse> {
        Ok(self.api.get(ApiRequest::new("user/me")).await?.parse()?)
    }

    async fn terminate(&self, session: SyncSession, reason: TerminationReason) -> SyncSession {
        warn!(
            "Terminating session for organisation {}: {}",
            session.organisation_id(),
            reason
        );
        if reason.wipes_local_data() {
            if let Err(error) = self.store.clear().await {
                warn!("Could not wipe local data: {}", error);
            }
        }
        self.events.emit(SyncEvent::SessionTerminated { reason });
        session.terminate(reason)
    }

    async fn server_time(&self) -> Result<Checkpoint> {
        let millis: i64 = self.api.get(ApiRequest::new("now")).await?.parse()?;
        Checkpoint::from_millis(millis)
            .ok_or_else(|| SyncError::InvalidResponse(format!("server time out of range: {millis}")))
    }

    async fn change_counts(&self, after: Checkpoint) -> Result<HashMap<String, usize>> {
        let request = ApiRequest::new("organisation/stats").query("after", after.as_millis());
        Ok(self.api.get(request).await?.parse()?)
    }

    /// Every record of a collection changed after `after`, across pages.
    async fn fetch_delta(&self, collection: Collection, after: Checkpoint) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        let mut page = 0usize;
        loop {
            let request = ApiRequest::new(collection.path())
                .query("after", after.as_millis())
                .query("withDeleted", true)
                .query("limit", self.page_size)
                .query("page", page);
            let response = self.api.get(request).await?;
            let has_more = response.has_more;
            let batch: Vec<Record> = response.parse()?;
            debug!("{}: page {} with {} records", collection, page, batch.len());

            let empty = batch.is_empty();
            records.extend(batch);
            if !has_more || empty {
                return Ok(records);
            }
            page += 1;
        }
    }

    /// Fetch, screen, decrypt, merge and persist one collection's delta.
    ///
    /// Returns the number of records received.
    async fn sync_collection(
        &self,
        session: &mut SyncSession,
        collection: Collection,
        after: Checkpoint,
        report: &mut SyncReport,
    ) -> Result<usize> {
        let records = self.fetch_delta(collection, after).await?;
        let received = records.len();

        let mut ledger = self.store.get_ledger(collection).await?;
        let (records, stale) = ledger.screen(records);
        ledger.absorb(&records);
        for id in stale {
            debug!("{}: dropping stale update of tombstoned {}", collection, id);
            self.events.emit(SyncEvent::StaleUpdateDropped {
                collection,
                id: id.clone(),
            });
            report.stale.push((collection, id));
        }

        let OpenedDelta {
            mut records,
            mut entities,
            corrupt,
        } = self.open_delta(session, collection, records, report)?;
        // A corrupt update must not leave the previous copy behind.
        for record in corrupt {
            entities.push(Entity::tombstone_of(&record));
            records.push(eviction_marker(record));
        }

        let ctx = session.merge_context();
        let total = if collection.is_sensitive() {
            let cached = self.store.merge_records(collection, records).await?;
            session.working_set.absorb(collection, entities, &ctx);
            cached.len()
        } else {
            let strategy = collection.strategy();
            let reshape = |entity: Entity| strategy.apply_reshape(entity);
            let keep = |entity: &Entity| strategy.keeps(entity, &ctx);
            let options = MergeOptions {
                reshape: Some(&reshape),
                keep: Some(&keep),
            };
            let merged = self
                .store
                .merge_entities(collection, entities, &options)
                .await?;
            let total = merged.len();
            session.working_set.replace(collection, merged);
            total
        };
        self.store.set_ledger(collection, &ledger).await?;

        self.events.emit(SyncEvent::CollectionMerged {
            collection,
            received,
            total,
        });
        Ok(received)
    }

    /// Decrypt a delta. Records that fail to open are reported as corrupt and
    /// handed back separately.
    fn open_delta(
        &self,
        session: &SyncSession,
        collection: Collection,
        records: Vec<Record>,
        report: &mut SyncReport,
    ) -> Result<OpenedDelta> {
        let key = session.key()?;
        let mut opened = OpenedDelta {
            records: Vec::with_capacity(records.len()),
            entities: Vec::with_capacity(records.len()),
            corrupt: Vec::new(),
        };
        for record in records {
            match open_record(&record, key) {
                Ok(entity) => {
                    opened.entities.push(entity);
                    opened.records.push(record);
                }
                Err(error) => {
                    self.report_corrupt(collection, &record.id, error, report);
                    opened.corrupt.push(record);
                }
            }
        }
        Ok(opened)
    }

    async fn load_cached(
        &self,
        session: &SyncSession,
        collection: Collection,
        report: &mut SyncReport,
    ) -> Result<Vec<Entity>> {
        if !collection.is_sensitive() {
            return Ok(self.store.get(collection).await?);
        }
        let records = self.store.get_raw(collection).await?;
        Ok(self.open_delta(session, collection, records, report)?.entities)
    }

    fn report_corrupt(
        &self,
        collection: Collection,
        id: &str,
        error: CipherError,
        report: &mut SyncReport,
    ) {
        warn!("{}: record {} is corrupt: {}", collection, id, error);
        self.events.emit(SyncEvent::CorruptRecord {
            collection,
            id: id.to_string(),
            error: error.to_string(),
        });
        report.corrupt.push(CorruptRecord {
            collection,
            id: id.to_string(),
            error: error.to_string(),
        });
    }
}
