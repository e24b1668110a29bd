//! End-to-end tests for the casefile client.
//!
//! Drives `CaseClient` against the in-memory server with a real on-disk store:
//! what lands on disk, cold starts, interrupted passes and guarded writes.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use casefile_core::cipher::{derive_organisation_key, encrypt_verification_key, seal_entity};
use casefile_core::tree::DocumentTree;
use casefile_core::{
    Collection, Entity, FieldChange, HistoryEntry, InMemoryServer, KdfParams, OrganisationKey,
    OrganisationProfile, SyncEvent, SyncStatus, UserProfile,
};
use casefile_daemon::{CaseClient, Config};
use chrono::Duration;
use serde_json::{json, Map, Value};
use tempfile::TempDir;

const SECRET: &str = "correct horse battery staple";

struct TestServer {
    server: Arc<InMemoryServer>,
    key: OrganisationKey,
    config: Config,
}

impl TestServer {
    fn new() -> Self {
        let kdf = KdfParams {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        };
        let key = derive_organisation_key(SECRET, "org", &kdf).unwrap();
        let mut organisation = OrganisationProfile::new("org");
        organisation.encrypted_verification_key = Some(encrypt_verification_key(&key).unwrap());
        let server = Arc::new(InMemoryServer::new(UserProfile::new("u1"), organisation));
        let config = Config {
            page_size: 2,
            kdf,
            ..Config::default()
        };
        Self {
            server,
            key,
            config,
        }
    }

    fn put(&self, collection: Collection, id: &str, fields: Value) {
        self.put_with_history(collection, id, fields, Vec::new());
    }

    fn put_with_history(
        &self,
        collection: Collection,
        id: &str,
        fields: Value,
        history: Vec<HistoryEntry>,
    ) {
        self.server.advance(Duration::milliseconds(1));
        let now = self.server.now();
        let map = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let mut entity = Entity::new("org", map);
        entity.id = id.to_string();
        entity.created_at = now;
        entity.updated_at = now;
        entity.history = history;
        self.server
            .insert(collection, seal_entity(&entity, &self.key).unwrap());
    }

    async fn open(&self, data_dir: &Path) -> CaseClient<InMemoryServer> {
        CaseClient::open(self.server.clone(), &self.config, data_dir, SECRET)
            .await
            .unwrap()
    }
}

fn ids(client: &CaseClient<InMemoryServer>, collection: Collection) -> Vec<String> {
    let mut ids: Vec<String> = client
        .entities(collection)
        .unwrap()
        .iter()
        .map(|e| e.id.clone())
        .collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn test_sensitive_collections_reach_disk_as_ciphertext_only() {
    let dir = TempDir::new().unwrap();
    let t = TestServer::new();
    t.put(Collection::Person, "p1", json!({ "name": "Alice Martin" }));
    t.put(
        Collection::MedicalFile,
        "m1",
        json!({ "person": "p1", "diagnosis": "confidential-diagnosis" }),
    );

    let mut client = t.open(dir.path()).await;
    let report = client.sync(false).await.unwrap();

    assert_eq!(report.status, SyncStatus::Completed);
    let medical = client.find(Collection::MedicalFile, "m1").unwrap();
    assert_eq!(medical.field("diagnosis"), &json!("confidential-diagnosis"));

    let on_disk = std::fs::read_to_string(dir.path().join("store/org/medical-file")).unwrap();
    assert!(on_disk.contains("m1"));
    assert!(!on_disk.contains("confidential-diagnosis"));

    let people = std::fs::read_to_string(dir.path().join("store/org/person")).unwrap();
    assert!(people.contains("Alice Martin"));
}

#[tokio::test]
async fn test_restart_hydrates_and_resumes_from_checkpoint() {
    let dir = TempDir::new().unwrap();
    let t = TestServer::new();
    t.put(Collection::Person, "p1", json!({ "name": "Alice" }));
    t.put(Collection::Person, "p2", json!({ "name": "Bruno" }));
    t.put(Collection::Treatment, "t1", json!({ "person": "p1" }));

    let mut client = t.open(dir.path()).await;
    client.sync(false).await.unwrap();
    let checkpoint = client.session().unwrap().checkpoint;
    drop(client);

    // Cold start: the working set comes back from disk before any pass.
    let mut client = t.open(dir.path()).await;
    assert_eq!(client.session().unwrap().checkpoint, checkpoint);
    assert_eq!(ids(&client, Collection::Person), vec!["p1", "p2"]);
    assert_eq!(ids(&client, Collection::Treatment), vec!["t1"]);

    t.put(Collection::Person, "p3", json!({ "name": "Chloé" }));
    let report = client.sync(false).await.unwrap();

    assert_eq!(report.status, SyncStatus::Completed);
    assert_eq!(report.merged.get(&Collection::Person), Some(&1));
    assert_eq!(ids(&client, Collection::Person), vec!["p1", "p2", "p3"]);
    assert!(client.session().unwrap().checkpoint > checkpoint);
}

#[tokio::test]
async fn test_interrupted_pass_is_retried_without_duplicates() {
    let dir = TempDir::new().unwrap();
    let t = TestServer::new();
    t.put(Collection::Person, "p1", json!({ "name": "Alice" }));
    t.put(Collection::Person, "p2", json!({ "name": "Bruno" }));
    t.put(Collection::Person, "p3", json!({ "name": "Chloé" }));
    t.put(Collection::Treatment, "t1", json!({ "person": "p1" }));
    t.server.fail_path("treatment");

    let mut client = t.open(dir.path()).await;
    let before = client.session().unwrap().checkpoint;
    let report = client.sync(false).await.unwrap();

    assert_eq!(report.status, SyncStatus::Partial);
    assert_eq!(client.session().unwrap().checkpoint, before);
    assert_eq!(ids(&client, Collection::Person), vec!["p1", "p2", "p3"]);

    t.server.heal_path("treatment");
    t.server.clear_requests();
    let report = client.sync(false).await.unwrap();

    assert_eq!(report.status, SyncStatus::Completed);
    assert!(t.server.requests().iter().any(|r| r == "GET person"));
    assert_eq!(ids(&client, Collection::Person), vec!["p1", "p2", "p3"]);
    assert_eq!(ids(&client, Collection::Treatment), vec!["t1"]);
    assert!(client.session().unwrap().checkpoint > before);

    // The cache on disk holds each person once.
    drop(client);
    let client = t.open(dir.path()).await;
    assert_eq!(ids(&client, Collection::Person), vec!["p1", "p2", "p3"]);
}

#[tokio::test]
async fn test_guarded_set_writes_history_and_updates_working_set() {
    let dir = TempDir::new().unwrap();
    let t = TestServer::new();
    t.put(Collection::Person, "p1", json!({ "name": "Alice", "status": "A" }));

    let mut client = t.open(dir.path()).await;
    client.sync(false).await.unwrap();

    let updated = client
        .set_field(Collection::Person, "p1", "status", json!("B"))
        .await
        .unwrap();

    assert_eq!(updated.field("status"), &json!("B"));
    assert_eq!(updated.history.len(), 1);
    assert_eq!(updated.history[0].user, "u1");
    assert_eq!(
        client.find(Collection::Person, "p1").unwrap().field("status"),
        &json!("B")
    );
    assert!(client.verify().unwrap().is_empty());
}

#[tokio::test]
async fn test_guarded_set_on_unreachable_entity_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let t = TestServer::new();
    t.put(Collection::Person, "p1", json!({ "status": "A" }));

    let mut client = t.open(dir.path()).await;
    client.sync(false).await.unwrap();
    t.server.fail_path("person/");

    let result = client
        .set_field(Collection::Person, "p1", "status", json!("B"))
        .await;

    assert!(result.is_err());
    assert_eq!(
        client.find(Collection::Person, "p1").unwrap().field("status"),
        &json!("A")
    );
}

#[tokio::test]
async fn test_move_document_repairs_and_reparents() {
    let dir = TempDir::new().unwrap();
    let t = TestServer::new();
    t.put(
        Collection::Person,
        "p1",
        json!({ "documents": [
            { "_id": "admin", "type": "folder", "parentId": "root", "position": 0 },
            { "_id": "id-card", "type": "document", "parentId": "lost-folder", "position": 0 }
        ] }),
    );

    let mut client = t.open(dir.path()).await;
    client.sync(false).await.unwrap();

    let updated = client.move_document("p1", "id-card", "admin").await.unwrap();

    let (tree, repairs) = DocumentTree::from_documents(updated.field("documents")).unwrap();
    assert!(repairs.is_empty());
    assert_eq!(tree.get("id-card").unwrap().parent_id, "admin");
    let cached = client.find(Collection::Person, "p1").unwrap();
    assert_eq!(cached.field("documents"), updated.field("documents"));

    // Moving a folder under itself is refused before anything is written.
    t.server.clear_requests();
    assert!(client.move_document("p1", "admin", "admin").await.is_err());
    assert!(!t.server.requests().iter().any(|r| r.starts_with("PUT")));
}

#[tokio::test]
async fn test_verify_emits_integrity_violations() {
    let dir = TempDir::new().unwrap();
    let t = TestServer::new();
    let mut data = BTreeMap::new();
    data.insert(
        "status".to_string(),
        FieldChange {
            old_value: json!("A"),
            new_value: json!("B"),
        },
    );
    let entry = HistoryEntry {
        date: t.server.now(),
        user: "u1".to_string(),
        data,
    };
    // The log ends on "B" but the entity says "C".
    t.put_with_history(Collection::Person, "p1", json!({ "status": "C" }), vec![entry]);

    let mut client = t.open(dir.path()).await;
    client.sync(false).await.unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _subscription = client.events().subscribe(move |event| {
        if let SyncEvent::IntegrityViolation { entity_id, field, .. } = event {
            sink.lock().unwrap().push((entity_id, field));
        }
    });

    let issues = client.verify().unwrap();

    assert_eq!(issues.len(), 1);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![("p1".to_string(), "status".to_string())]
    );
}

#[tokio::test]
async fn test_disabled_organisation_ends_session_and_wipes_disk() {
    let dir = TempDir::new().unwrap();
    let t = TestServer::new();
    t.put(Collection::Person, "p1", json!({ "name": "Alice" }));

    let mut client = t.open(dir.path()).await;
    client.sync(false).await.unwrap();
    assert!(dir.path().join("store/org/person").exists());

    t.server.update_organisation(|org| org.disabled = true);
    let report = client.sync(false).await.unwrap();

    assert!(matches!(report.status, SyncStatus::Terminated(_)));
    assert!(!client.is_active());
    assert!(client.entities(Collection::Person).unwrap().is_empty());
    assert!(!dir.path().join("store/org/person").exists());
}

#[tokio::test]
async fn test_logout_wipes_local_store() {
    let dir = TempDir::new().unwrap();
    let t = TestServer::new();
    t.put(Collection::Person, "p1", json!({ "name": "Alice" }));

    let mut client = t.open(dir.path()).await;
    client.sync(false).await.unwrap();
    client.logout().await.unwrap();

    assert!(!dir.path().join("store/org/person").exists());
    let client = t.open(dir.path()).await;
    assert!(client.entities(Collection::Person).unwrap().is_empty());
}

#[tokio::test]
async fn test_wrong_secret_is_refused() {
    let dir = TempDir::new().unwrap();
    let t = TestServer::new();

    let result = CaseClient::open(t.server.clone(), &t.config, dir.path(), "wrong secret").await;

    assert!(result.is_err());
    assert!(!dir.path().join("store").exists());
}
