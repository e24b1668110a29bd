//! SyncSession: the explicit sync state passed into and returned from every pass.
//!
//! A session owns the organisation key (memory only), the caller's profile, the
//! checkpoint and the decrypted working set. There is no ambient loader state;
//! whoever drives syncs holds the session and hands it to `DeltaSync::sync`.

use crate::api::{ApiClient, ApiRequest};
use crate::cipher::{derive_organisation_key, verify_organisation_key, KdfParams, OrganisationKey};
use crate::collection::{Collection, MergeContext};
use crate::entity::{Checkpoint, Entity};
use crate::merge::{merge, MergeOptions};
use crate::sync_engine::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl UserProfile {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            role: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganisationProfile {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Set server-side when the tenant is shut off
    #[serde(default)]
    pub disabled: bool,
    /// Changes whenever the organisation key is rotated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_last_update_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_verification_key: Option<String>,
}

impl OrganisationProfile {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            disabled: false,
            encryption_last_update_at: None,
            encrypted_verification_key: None,
        }
    }
}

/// Answer of `GET /user/me`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileResponse {
    pub user: UserProfile,
    pub organisation: OrganisationProfile,
}

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TerminationReason {
    OrganisationDisabled,
    KeyRotated,
    LoggedOut,
}

impl TerminationReason {
    /// Whether the organisation's local namespace must be wiped.
    pub fn wipes_local_data(self) -> bool {
        matches!(
            self,
            TerminationReason::OrganisationDisabled | TerminationReason::LoggedOut
        )
    }
}

impl Display for TerminationReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TerminationReason::OrganisationDisabled => "organisation disabled",
            TerminationReason::KeyRotated => "organisation key rotated",
            TerminationReason::LoggedOut => "logged out",
        })
    }
}

/// The decrypted, UI-facing collections.
#[derive(Debug, Clone, Default)]
pub struct WorkingSet {
    collections: HashMap<Collection, Vec<Entity>>,
}

impl WorkingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, collection: Collection) -> &[Entity] {
        self.collections
            .get(&collection)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn find(&self, collection: Collection, id: &str) -> Option<&Entity> {
        self.get(collection).iter().find(|e| e.id == id)
    }

    pub fn replace(&mut self, collection: Collection, items: Vec<Entity>) {
        self.collections.insert(collection, items);
    }

    /// Merge a delta into one collection with that collection's strategy.
    pub fn absorb(&mut self, collection: Collection, delta: Vec<Entity>, ctx: &MergeContext) {
        let strategy = collection.strategy();
        let reshape = |entity: Entity| strategy.apply_reshape(entity);
        let keep = |entity: &Entity| strategy.keeps(entity, ctx);
        let options = MergeOptions {
            reshape: Some(&reshape),
            keep: Some(&keep),
        };
        let old = self.collections.remove(&collection).unwrap_or_default();
        self.collections
            .insert(collection, merge(old, delta, &options));
    }

    /// Total entity count across collections.
    pub fn len(&self) -> usize {
        self.collections.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.collections.clear();
    }
}

/// State of one logged-in client, threaded through sync passes.
#[derive(Debug, Clone)]
pub struct SyncSession {
    pub user: UserProfile,
    pub organisation: OrganisationProfile,
    /// None once the session is terminated
    key: Option<OrganisationKey>,
    pub checkpoint: Checkpoint,
    pub working_set: WorkingSet,
    terminated: Option<TerminationReason>,
}

impl SyncSession {
    /// Open a session for a profile with an already derived key.
    ///
    /// When the organisation publishes a verification key, the derived key must
    /// open it; otherwise nothing is checked.
    pub fn open(profile: ProfileResponse, key: OrganisationKey) -> Result<Self> {
        if let Some(verification) = &profile.organisation.encrypted_verification_key {
            verify_organisation_key(&key, verification)?;
        }
        Ok(Self {
            user: profile.user,
            organisation: profile.organisation,
            key: Some(key),
            checkpoint: Checkpoint::epoch(),
            working_set: WorkingSet::new(),
            terminated: None,
        })
    }

    /// Fetch the caller's profile, derive the organisation key from `secret` and
    /// open a session with it.
    pub async fn login<A: ApiClient + ?Sized>(
        api: &A,
        secret: &str,
        kdf: &KdfParams,
    ) -> Result<Self> {
        let profile: ProfileResponse = api.get(ApiRequest::new("user/me")).await?.parse()?;
        if profile.organisation.disabled {
            return Err(SyncError::SessionTerminated(
                TerminationReason::OrganisationDisabled,
            ));
        }
        let key = derive_organisation_key(secret, &profile.organisation.id, kdf)?;
        let session = Self::open(profile, key)?;
        info!(
            "Session opened for user {} in organisation {}",
            session.user.id, session.organisation.id
        );
        Ok(session)
    }

    pub fn organisation_id(&self) -> &str {
        &self.organisation.id
    }

    /// The organisation key, unless the session was terminated.
    pub fn key(&self) -> Result<&OrganisationKey> {
        match (&self.key, self.terminated) {
            (Some(key), None) => Ok(key),
            (_, Some(reason)) => Err(SyncError::SessionTerminated(reason)),
            (None, None) => Err(SyncError::SessionTerminated(TerminationReason::LoggedOut)),
        }
    }

    pub fn is_active(&self) -> bool {
        self.terminated.is_none()
    }

    pub fn termination(&self) -> Option<TerminationReason> {
        self.terminated
    }

    /// Drop the key and the working set. The first reason sticks.
    pub fn terminate(mut self, reason: TerminationReason) -> Self {
        self.key = None;
        self.working_set.clear();
        self.terminated.get_or_insert(reason);
        self
    }

    pub fn merge_context(&self) -> MergeContext {
        MergeContext {
            user_id: self.user.id.clone(),
        }
    }
}
