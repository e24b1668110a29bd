//! CaseClient: one logged-in installation, wiring the sync engine to disk.
//!
//! Owns the session between passes and hands it to the engine by value for
//! each pass, the way the engine expects.

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use casefile_core::history;
use casefile_core::temporal::{cohort_transition, snapshot_at, CohortQuery, CohortTransition};
use casefile_core::{
    ApiClient, Collection, DeltaSync, Entity, EntityGuard, EventBus, IntegrityIssue, LocalStore,
    Subscription, SyncEvent, SyncOptions, SyncReport, SyncSession, SyncStatus,
};
use chrono::NaiveDate;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::native_store::NativeKv;

pub struct CaseClient<A: ApiClient> {
    api: Arc<A>,
    sync: DeltaSync<A, NativeKv>,
    /// None only while a pass holds it
    session: Option<SyncSession>,
    _log: Subscription,
}

impl<A: ApiClient> CaseClient<A> {
    /// Log in, open the organisation's store under `data_dir` and hydrate the
    /// working set from it.
    pub async fn open(api: Arc<A>, config: &Config, data_dir: &Path, secret: &str) -> Result<Self> {
        let session = SyncSession::login(api.as_ref(), secret, &config.kdf)
            .await
            .context("Login failed")?;

        let kv = NativeKv::new(data_dir.join("store"));
        let store = Arc::new(LocalStore::new(kv, session.organisation_id()));
        let events = Arc::new(EventBus::new());
        let log = events.subscribe(log_event);
        let sync = DeltaSync::new(api.clone(), store, events).with_page_size(config.page_size);

        let outcome = sync.hydrate(session).await;
        log_report("Hydrate", &outcome.report);

        Ok(Self {
            api,
            sync,
            session: Some(outcome.session),
            _log: log,
        })
    }

    pub fn session(&self) -> Result<&SyncSession> {
        self.session
            .as_ref()
            .ok_or_else(|| anyhow!("Session unavailable"))
    }

    pub fn is_active(&self) -> bool {
        self.session.as_ref().is_some_and(SyncSession::is_active)
    }

    pub fn events(&self) -> &Arc<EventBus> {
        self.sync.events()
    }

    /// Run one sync pass.
    pub async fn sync(&mut self, full_resync: bool) -> Result<SyncReport> {
        let session = self
            .session
            .take()
            .ok_or_else(|| anyhow!("Session unavailable"))?;
        let outcome = self.sync.sync(session, SyncOptions { full_resync }).await;
        self.session = Some(outcome.session);
        log_report("Sync", &outcome.report);
        Ok(outcome.report)
    }

    pub fn entities(&self, collection: Collection) -> Result<&[Entity]> {
        Ok(self.session()?.working_set.get(collection))
    }

    pub fn find(&self, collection: Collection, id: &str) -> Result<&Entity> {
        self.session()?
            .working_set
            .find(collection, id)
            .ok_or_else(|| anyhow!("No {} with id {}", collection, id))
    }

    /// The entity as it stood at the end of `date`; None before tracking began.
    pub fn snapshot(&self, collection: Collection, id: &str, date: NaiveDate) -> Result<Option<Entity>> {
        Ok(snapshot_at(self.find(collection, id)?, date))
    }

    pub fn cohort(&self, collection: Collection, query: &CohortQuery) -> Result<Option<CohortTransition>> {
        let transition = cohort_transition(query, self.entities(collection)?);
        if let Some(transition) = &transition {
            self.report_issues(&transition.issues);
        }
        Ok(transition)
    }

    /// Check every history log in the working set against its entity.
    pub fn verify(&self) -> Result<Vec<IntegrityIssue>> {
        let session = self.session()?;
        let mut issues = Vec::new();
        for collection in Collection::ALL {
            for entity in session.working_set.get(collection) {
                issues.extend(history::verify(entity));
            }
        }
        self.report_issues(&issues);
        Ok(issues)
    }

    fn report_issues(&self, issues: &[IntegrityIssue]) {
        for issue in issues {
            self.events().emit(SyncEvent::IntegrityViolation {
                entity_id: issue.entity_id.clone(),
                field: issue.field.clone(),
                detail: issue.to_string(),
            });
        }
    }

    /// Set one field through a guarded write and fold the result into the
    /// working set.
    pub async fn set_field(
        &mut self,
        collection: Collection,
        id: &str,
        field: &str,
        value: Value,
    ) -> Result<Entity> {
        let field_name = field.to_string();
        let entity = self
            .guard()?
            .with_fresh_entity(collection, id, move |mut entity| {
                entity.set_field(&field_name, value);
                entity
            })
            .await
            .map_err(|e| anyhow!(e.user_message()))?;

        self.absorb(collection, &entity)?;
        debug!("Updated {} {} field {}", collection, id, field);
        Ok(entity)
    }

    /// Move a node of a person's document tree under another folder (or "root").
    pub async fn move_document(&mut self, person_id: &str, node: &str, parent: &str) -> Result<Entity> {
        let entity = self
            .guard()?
            .with_fresh_documents(Collection::Person, person_id, |tree| {
                tree.move_node(node, parent, None)
            })
            .await
            .map_err(|e| anyhow!(e.user_message()))?;

        self.absorb(Collection::Person, &entity)?;
        debug!("Moved document {} of {} under {}", node, person_id, parent);
        Ok(entity)
    }

    fn guard(&self) -> Result<EntityGuard<A, NativeKv>> {
        Ok(EntityGuard::for_session(
            self.api.clone(),
            self.sync.store().clone(),
            self.sync.events().clone(),
            self.session()?,
        )?)
    }

    /// Fold a guarded write's result into the working set.
    fn absorb(&mut self, collection: Collection, entity: &Entity) -> Result<()> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| anyhow!("Session unavailable"))?;
        let ctx = session.merge_context();
        session
            .working_set
            .absorb(collection, vec![entity.clone()], &ctx);
        Ok(())
    }

    /// End the session and wipe this organisation's local data.
    pub async fn logout(mut self) -> Result<()> {
        let session = self
            .session
            .take()
            .ok_or_else(|| anyhow!("Session unavailable"))?;
        if !session.is_active() {
            bail!("Session already terminated");
        }
        self.sync.logout(session).await?;
        Ok(())
    }
}

fn log_event(event: SyncEvent) {
    match event {
        SyncEvent::CollectionFailed { collection, error } => {
            warn!("Collection {} failed: {}", collection, error)
        }
        SyncEvent::CorruptRecord {
            collection,
            id,
            error,
        } => warn!("Corrupt record {}/{}: {}", collection, id, error),
        SyncEvent::SessionTerminated { reason } => warn!("Session terminated: {}", reason),
        SyncEvent::IntegrityViolation {
            entity_id,
            field,
            detail,
        } => warn!("History of {} ({}): {}", entity_id, field, detail),
        SyncEvent::MutationAbandoned {
            collection,
            id,
            error,
        } => warn!("Mutation of {}/{} abandoned: {}", collection, id, error),
        other => debug!("{:?}", other),
    }
}

fn log_report(label: &str, report: &SyncReport) {
    let received: usize = report.merged.values().sum();
    match report.status {
        SyncStatus::Completed => info!(
            "{} completed: {} entities in {:?}, checkpoint {}",
            label, received, report.elapsed, report.checkpoint
        ),
        SyncStatus::Coalesced => debug!("{} skipped: another pass in flight", label),
        SyncStatus::Terminated(reason) => warn!("{} ended: session terminated ({})", label, reason),
        SyncStatus::Partial | SyncStatus::Failed => {
            for failure in &report.failures {
                match failure.collection {
                    Some(collection) => warn!("{}: {} failed: {}", label, collection, failure.error),
                    None => warn!("{}: {}", label, failure.error),
                }
            }
            warn!(
                "{} incomplete ({:?}), checkpoint stays at {}",
                label, report.status, report.checkpoint
            );
        }
    }
}
