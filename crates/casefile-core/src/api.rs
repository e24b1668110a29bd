//! ApiClient trait: the abstract HTTP collaborator.
//!
//! The engine only needs `get/post/put/delete({ path, query?, body? })` answering
//! `{ ok, data | error }`. Retries, backoff and timeouts belong to the implementation.
//!
//! Implementations:
//! - `InMemoryServer` - Reference server for testing
//! - `HttpApi` (in casefile-daemon) - reqwest over HTTPS
//!
//! Routes the engine relies on:
//! - `GET /now`: authoritative server time (ms)
//! - `GET /user/me`: the caller's user and organisation profiles
//! - `GET /organisation/stats?after=`: pending change count per collection
//! - `GET /{collection}?after=&limit=&page=&withDeleted=true`: a page of the delta
//! - `GET|PUT|DELETE /{collection}/{id}`, `POST /{collection}`: entity reads and writes

use crate::collection::Collection;
use crate::entity::Record;
use crate::session::{OrganisationProfile, ProfileResponse, UserProfile};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{self, Display, Formatter};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Server rejected request: {0}")]
    Rejected(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Display for Method {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        })
    }
}

/// A request to the server, relative to its base URL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApiRequest {
    /// Route without leading slash (e.g. "person/abc")
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// The server's envelope: `{ ok, data | error, hasMore? }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse {
    pub ok: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub has_more: bool,
}

impl ApiResponse {
    pub fn success(data: Value) -> Self {
        Self {
            ok: true,
            data,
            error: None,
            has_more: false,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: Value::Null,
            error: Some(error.into()),
            has_more: false,
        }
    }

    /// The payload of a successful response; `ok: false` becomes `Rejected`.
    pub fn into_data(self) -> Result<Value> {
        if self.ok {
            Ok(self.data)
        } else {
            Err(TransportError::Rejected(
                self.error.unwrap_or_else(|| "unknown error".to_string()),
            ))
        }
    }

    /// Deserialize the payload of a successful response.
    pub fn parse<T: DeserializeOwned>(self) -> Result<T> {
        let data = self.into_data()?;
        serde_json::from_value(data).map_err(|e| TransportError::InvalidResponse(e.to_string()))
    }
}

/// Abstract request function the engine talks to the server through.
#[async_trait]
pub trait ApiClient: Send + Sync {
    /// Issue a request. Transport failures are errors; server-side refusals
    /// come back as `ApiResponse { ok: false, .. }`.
    async fn request(&self, method: Method, request: ApiRequest) -> Result<ApiResponse>;

    async fn get(&self, request: ApiRequest) -> Result<ApiResponse> {
        self.request(Method::Get, request).await
    }

    async fn post(&self, request: ApiRequest) -> Result<ApiResponse> {
        self.request(Method::Post, request).await
    }

    async fn put(&self, request: ApiRequest) -> Result<ApiResponse> {
        self.request(Method::Put, request).await
    }

    async fn delete(&self, request: ApiRequest) -> Result<ApiResponse> {
        self.request(Method::Delete, request).await
    }
}

#[async_trait]
impl<T: ApiClient> ApiClient for std::sync::Arc<T> {
    async fn request(&self, method: Method, request: ApiRequest) -> Result<ApiResponse> {
        (**self).request(method, request).await
    }
}

struct ServerState {
    now: DateTime<Utc>,
    user: UserProfile,
    organisation: OrganisationProfile,
    collections: HashMap<Collection, Vec<Record>>,
    /// Path prefixes that fail at the transport level
    failing: HashSet<String>,
    /// "METHOD path" of every request received
    log: Vec<String>,
}

impl ServerState {
    /// Advance the clock and stamp a write with it, so every write lands
    /// strictly after any time already handed out by `/now`.
    fn tick(&mut self) -> DateTime<Utc> {
        self.now += Duration::milliseconds(1);
        self.now
    }
}

/// In-memory reference server for testing.
///
/// Stores records as the clients send them (it never sees plaintext) and stamps
/// `updatedAt`/`deletedAt` with its own clock.
pub struct InMemoryServer {
    state: Mutex<ServerState>,
}

impl InMemoryServer {
    pub fn new(user: UserProfile, organisation: OrganisationProfile) -> Self {
        Self {
            state: Mutex::new(ServerState {
                now: DateTime::<Utc>::UNIX_EPOCH + Duration::days(19_723),
                user,
                organisation,
                collections: HashMap::new(),
                failing: HashSet::new(),
                log: Vec::new(),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.state().now
    }

    pub fn set_now(&self, now: DateTime<Utc>) {
        self.state().now = now;
    }

    pub fn advance(&self, by: Duration) {
        self.state().now += by;
    }

    /// Store a record verbatim, bypassing clock stamping.
    pub fn insert(&self, collection: Collection, record: Record) {
        let mut state = self.state();
        let records = state.collections.entry(collection).or_default();
        records.retain(|r| r.id != record.id);
        records.push(record);
    }

    pub fn records(&self, collection: Collection) -> Vec<Record> {
        self.state()
            .collections
            .get(&collection)
            .cloned()
            .unwrap_or_default()
    }

    pub fn update_organisation(&self, update: impl FnOnce(&mut OrganisationProfile)) {
        update(&mut self.state().organisation);
    }

    /// Make every request whose path starts with `prefix` fail.
    pub fn fail_path(&self, prefix: &str) {
        self.state().failing.insert(prefix.to_string());
    }

    pub fn heal_path(&self, prefix: &str) {
        self.state().failing.remove(prefix);
    }

    /// Requests received so far, as "METHOD path".
    pub fn requests(&self) -> Vec<String> {
        self.state().log.clone()
    }

    pub fn clear_requests(&self) {
        self.state().log.clear();
    }

    fn handle(&self, method: Method, request: &ApiRequest) -> Result<ApiResponse> {
        let mut state = self.state();
        state.log.push(format!("{} {}", method, request.path));

        if state.failing.iter().any(|p| request.path.starts_with(p.as_str())) {
            return Err(TransportError::ConnectionFailed(format!(
                "connection reset on {}",
                request.path
            )));
        }

        let segments: Vec<&str> = request.path.trim_matches('/').split('/').collect();
        match (method, segments.as_slice()) {
            (Method::Get, ["now"]) => Ok(ApiResponse::success(json!(state.now.timestamp_millis()))),
            (Method::Get, ["user", "me"]) => {
                let profile = ProfileResponse {
                    user: state.user.clone(),
                    organisation: state.organisation.clone(),
                };
                Ok(ApiResponse::success(to_value(&profile)?))
            }
            (Method::Get, ["organisation", "stats"]) => {
                let after = after_param(request)?;
                let mut stats = BTreeMap::new();
                for collection in Collection::ALL {
                    let count = state
                        .collections
                        .get(&collection)
                        .map(|records| records.iter().filter(|r| r.last_event_at() > after).count())
                        .unwrap_or(0);
                    stats.insert(collection.strategy().stats_key, count);
                }
                Ok(ApiResponse::success(to_value(&stats)?))
            }
            (_, [name, rest @ ..]) => {
                let Ok(collection) = name.parse::<Collection>() else {
                    return Ok(ApiResponse::failure(format!("Unknown route {}", request.path)));
                };
                match (method, rest) {
                    (Method::Get, []) => list(&state, collection, request),
                    (Method::Post, []) => create(&mut state, collection, request),
                    (Method::Get, [id]) => Ok(
                        match state
                            .collections
                            .get(&collection)
                            .and_then(|records| records.iter().find(|r| r.id == *id))
                        {
                            Some(record) => ApiResponse::success(to_value(record)?),
                            None => ApiResponse::failure("Not Found"),
                        },
                    ),
                    (Method::Put, [id]) => update(&mut state, collection, id, request),
                    (Method::Delete, [id]) => tombstone(&mut state, collection, id),
                    _ => Ok(ApiResponse::failure(format!("Unknown route {}", request.path))),
                }
            }
            _ => Ok(ApiResponse::failure(format!("Unknown route {}", request.path))),
        }
    }
}

#[async_trait]
impl ApiClient for InMemoryServer {
    async fn request(&self, method: Method, request: ApiRequest) -> Result<ApiResponse> {
        self.handle(method, &request)
    }
}

fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| TransportError::InvalidResponse(e.to_string()))
}

fn after_param(request: &ApiRequest) -> Result<DateTime<Utc>> {
    let millis = match request.query_value("after") {
        Some(raw) => raw
            .parse::<i64>()
            .map_err(|e| TransportError::Rejected(format!("bad after: {e}")))?,
        None => 0,
    };
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| TransportError::Rejected(format!("after out of range: {millis}")))
}

fn body_record(request: &ApiRequest) -> Result<Record> {
    let body = request
        .body
        .clone()
        .ok_or_else(|| TransportError::Rejected("missing body".into()))?;
    serde_json::from_value(body).map_err(|e| TransportError::Rejected(e.to_string()))
}

fn list(state: &ServerState, collection: Collection, request: &ApiRequest) -> Result<ApiResponse> {
    let after = after_param(request)?;
    let mut changed: Vec<&Record> = state
        .collections
        .get(&collection)
        .map(|records| records.iter().filter(|r| r.last_event_at() > after).collect())
        .unwrap_or_default();
    changed.sort_by(|a, b| a.last_event_at().cmp(&b.last_event_at()).then(a.id.cmp(&b.id)));

    let limit = request
        .query_value("limit")
        .and_then(|l| l.parse::<usize>().ok())
        .filter(|l| *l > 0)
        .unwrap_or(changed.len().max(1));
    let page = request
        .query_value("page")
        .and_then(|p| p.parse::<usize>().ok())
        .unwrap_or(0);

    let start = (page * limit).min(changed.len());
    let end = (start + limit).min(changed.len());
    let mut response = ApiResponse::success(to_value(&changed[start..end])?);
    response.has_more = end < changed.len();
    Ok(response)
}

fn create(state: &mut ServerState, collection: Collection, request: &ApiRequest) -> Result<ApiResponse> {
    let mut record = body_record(request)?;
    let now = state.tick();
    record.created_at = now;
    record.updated_at = now;
    record.deleted_at = None;
    record.organisation = state.organisation.id.clone();

    let records = state.collections.entry(collection).or_default();
    if records.iter().any(|r| r.id == record.id) {
        return Ok(ApiResponse::failure("Already exists"));
    }
    records.push(record.clone());
    Ok(ApiResponse::success(to_value(&record)?))
}

fn update(
    state: &mut ServerState,
    collection: Collection,
    id: &str,
    request: &ApiRequest,
) -> Result<ApiResponse> {
    let incoming = body_record(request)?;
    let now = state.tick();
    let Some(stored) = state
        .collections
        .get_mut(&collection)
        .and_then(|records| records.iter_mut().find(|r| r.id == id && !r.is_tombstoned()))
    else {
        return Ok(ApiResponse::failure("Not Found"));
    };
    stored.updated_at = now;
    stored.encrypted = incoming.encrypted;
    stored.encrypted_entity_key = incoming.encrypted_entity_key;
    Ok(ApiResponse::success(to_value(stored)?))
}

fn tombstone(state: &mut ServerState, collection: Collection, id: &str) -> Result<ApiResponse> {
    let now = state.tick();
    let Some(stored) = state
        .collections
        .get_mut(&collection)
        .and_then(|records| records.iter_mut().find(|r| r.id == id))
    else {
        return Ok(ApiResponse::failure("Not Found"));
    };
    stored.updated_at = now;
    stored.deleted_at = Some(now);
    stored.encrypted = None;
    stored.encrypted_entity_key = None;
    Ok(ApiResponse::success(to_value(stored)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> InMemoryServer {
        InMemoryServer::new(
            UserProfile::new("u1"),
            OrganisationProfile::new("org"),
        )
    }

    fn record(id: &str) -> Record {
        Record {
            id: id.into(),
            organisation: "org".into(),
            created_at: DateTime::<Utc>::UNIX_EPOCH,
            updated_at: DateTime::<Utc>::UNIX_EPOCH,
            deleted_at: None,
            encrypted: Some("c2VhbGVk".into()),
            encrypted_entity_key: Some("a2V5".into()),
        }
    }

    async fn post(server: &InMemoryServer, id: &str) -> Record {
        let body = serde_json::to_value(record(id)).unwrap();
        server
            .post(ApiRequest::new("person").body(body))
            .await
            .unwrap()
            .parse()
            .unwrap()
    }

    #[tokio::test]
    async fn test_now_and_stats() {
        let server = server();
        let before = server.now().timestamp_millis();
        post(&server, "p1").await;

        let now: i64 = server.get(ApiRequest::new("now")).await.unwrap().parse().unwrap();
        assert!(now > before);

        let stats: HashMap<String, usize> = server
            .get(ApiRequest::new("organisation/stats").query("after", before - 1))
            .await
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(stats["persons"], 1);
        assert_eq!(stats["actions"], 0);

        let stats: HashMap<String, usize> = server
            .get(ApiRequest::new("organisation/stats").query("after", now))
            .await
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(stats["persons"], 0);
    }

    #[tokio::test]
    async fn test_create_stamps_server_time() {
        let server = server();
        let created = post(&server, "p1").await;

        assert!(created.created_at > DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(created.created_at, created.updated_at);
        assert_eq!(server.records(Collection::Person).len(), 1);
    }

    #[tokio::test]
    async fn test_delta_pages() {
        let server = server();
        for i in 0..5 {
            post(&server, &format!("p{i}")).await;
        }

        let first = server
            .get(ApiRequest::new("person").query("limit", 2).query("page", 0))
            .await
            .unwrap();
        assert!(first.has_more);
        let last = server
            .get(ApiRequest::new("person").query("limit", 2).query("page", 2))
            .await
            .unwrap();
        assert!(!last.has_more);
        let records: Vec<Record> = last.parse().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "p4");
    }

    #[tokio::test]
    async fn test_delete_leaves_tombstone() {
        let server = server();
        post(&server, "p1").await;

        let gone: Record = server
            .delete(ApiRequest::new("person/p1"))
            .await
            .unwrap()
            .parse()
            .unwrap();

        assert!(gone.is_tombstoned());
        assert!(gone.encrypted.is_none());

        let update = server
            .put(ApiRequest::new("person/p1").body(serde_json::to_value(record("p1")).unwrap()))
            .await
            .unwrap();
        assert!(!update.ok);
    }

    #[tokio::test]
    async fn test_failing_path_is_a_transport_error() {
        let server = server();
        server.fail_path("person");

        let err = server.get(ApiRequest::new("person/p1")).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
        assert_eq!(server.requests(), vec!["GET person/p1".to_string()]);

        server.heal_path("person");
        let missing = server.get(ApiRequest::new("person/p1")).await.unwrap();
        assert!(matches!(missing.into_data(), Err(TransportError::Rejected(_))));
    }
}
