//! casefile-core: incremental encrypted synchronization for case records.
//!
//! This crate provides the core functionality for:
//! - Envelope encryption of entity payloads under a per-organisation key
//! - Delta sync of every collection against the server, with a checkpoint that
//!   only advances once the whole pass is persisted
//! - Merging deltas into cached collections with tombstone semantics
//! - Guarded mutations that re-read the server copy right before writing
//! - Point-in-time snapshots and cohort transitions from history logs
//! - ApiClient and KeyValueStore trait abstractions

pub mod api;
pub mod cipher;
pub mod collection;
pub mod entity;
pub mod events;
pub mod guard;
pub mod history;
pub mod merge;
pub mod session;
pub mod store;
pub mod sync_engine;
pub mod temporal;
pub mod tree;

pub use api::{ApiClient, ApiRequest, ApiResponse, InMemoryServer, Method, TransportError};
pub use cipher::{CipherError, KdfParams, OrganisationKey};
pub use collection::{Collection, CollectionStrategy, MergeContext};
pub use entity::{Checkpoint, Entity, FieldChange, HistoryEntry, Record};
pub use events::{EventBus, Subscription, SyncEvent};
pub use guard::{EntityGuard, GuardError};
pub use history::{IntegrityIssue, IssueKind};
pub use merge::{merge, MergeOptions, Mergeable, TombstoneLedger};
pub use session::{
    OrganisationProfile, ProfileResponse, SyncSession, TerminationReason, UserProfile, WorkingSet,
};
pub use store::{InMemoryKv, KeyValueStore, LocalStore, StoreError};
pub use sync_engine::{DeltaSync, SyncError, SyncOptions, SyncOutcome, SyncReport, SyncStatus};
pub use temporal::{cohort_transition, snapshot_at, CohortQuery, CohortTransition};
pub use tree::{DocumentTree, TreeError, TreeNode};
