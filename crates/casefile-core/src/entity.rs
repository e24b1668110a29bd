//! Entity: a record of a named collection, in its wire and decrypted forms.
//!
//! Two shapes of the same record travel through the engine:
//! - `Record`: what the server stores and what sensitive collections persist locally.
//!   The payload is opaque (`encrypted`) and carries its own envelope key
//!   (`encryptedEntityKey`), itself encrypted with the organisation key.
//! - `Entity`: the decrypted working form. Metadata stays typed, the payload is
//!   flattened into `fields` and the append-only `history` log.
//!
//! Both forms carry `deletedAt` so tombstones flow through sync unchanged.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use uuid::Uuid;

/// Payload key holding the history log.
pub const HISTORY_FIELD: &str = "history";

/// Payload key overriding `createdAt` as the start of tracking.
pub const TRACKED_SINCE_FIELD: &str = "followedSince";

/// Generate a fresh client-side entity id.
pub fn new_entity_id() -> String {
    Uuid::new_v4().to_string()
}

/// Server time as of the last fully merged sync.
///
/// Serialized as milliseconds since the Unix epoch, the unit the server speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Checkpoint(#[serde(with = "chrono::serde::ts_milliseconds")] DateTime<Utc>);

impl Checkpoint {
    /// The checkpoint of a fresh installation: everything is newer.
    pub fn epoch() -> Self {
        Self(DateTime::<Utc>::UNIX_EPOCH)
    }

    pub fn from_millis(millis: i64) -> Option<Self> {
        Utc.timestamp_millis_opt(millis).single().map(Self)
    }

    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self(at)
    }

    pub fn as_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    pub fn is_epoch(&self) -> bool {
        self.0 == DateTime::<Utc>::UNIX_EPOCH
    }
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::epoch()
    }
}

impl Display for Checkpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

/// Wire form of an entity. The payload is ciphertext.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    #[serde(rename = "_id")]
    pub id: String,
    pub organisation: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    /// Base64 payload ciphertext (absent on tombstones)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted: Option<String>,
    /// Base64 entity key, wrapped with the organisation key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_entity_key: Option<String>,
}

impl Record {
    pub fn is_tombstoned(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Latest server-side event on this record (update or deletion).
    pub fn last_event_at(&self) -> DateTime<Utc> {
        match self.deleted_at {
            Some(deleted) if deleted > self.updated_at => deleted,
            _ => self.updated_at,
        }
    }
}

/// One field's change within a history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    #[serde(default)]
    pub old_value: Value,
    #[serde(default)]
    pub new_value: Value,
}

/// One accepted mutation in an entity's append-only log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub date: DateTime<Utc>,
    pub user: String,
    pub data: BTreeMap<String, FieldChange>,
}

/// Decrypted working form of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    #[serde(rename = "_id")]
    pub id: String,
    pub organisation: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<HistoryEntry>,
    /// Decrypted payload fields
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Entity {
    /// A brand new entity with a client-assigned id. The server's answer to the
    /// creating request is the canonical form; this one is only a draft.
    pub fn new(organisation: &str, fields: Map<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            id: new_entity_id(),
            organisation: organisation.to_string(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            history: Vec::new(),
            fields,
        }
    }

    /// Rebuild an entity from record metadata and a decrypted payload.
    ///
    /// The payload is a JSON object; its `history` key (if any) becomes the log,
    /// everything else becomes `fields`. Non-object payloads yield no fields.
    pub fn from_payload(record: &Record, payload: Value) -> serde_json::Result<Self> {
        let mut fields = match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let history = match fields.remove(HISTORY_FIELD) {
            Some(raw) => serde_json::from_value(raw)?,
            None => Vec::new(),
        };
        Ok(Self {
            id: record.id.clone(),
            organisation: record.organisation.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
            deleted_at: record.deleted_at,
            history,
            fields,
        })
    }

    /// The tombstone form of a record: metadata only.
    pub fn tombstone_of(record: &Record) -> Self {
        Self {
            id: record.id.clone(),
            organisation: record.organisation.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
            deleted_at: record.deleted_at.or(Some(record.updated_at)),
            history: Vec::new(),
            fields: Map::new(),
        }
    }

    /// The payload to encrypt: fields plus history.
    pub fn payload(&self) -> serde_json::Result<Value> {
        let mut map = self.fields.clone();
        if !self.history.is_empty() {
            map.insert(HISTORY_FIELD.to_string(), serde_json::to_value(&self.history)?);
        }
        Ok(Value::Object(map))
    }

    pub fn is_tombstoned(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// A field's current value; missing fields read as `null`.
    pub fn field(&self, name: &str) -> &Value {
        self.fields.get(name).unwrap_or(&Value::Null)
    }

    /// Set a field; writing `null` removes it.
    pub fn set_field(&mut self, name: &str, value: Value) {
        if value.is_null() {
            self.fields.remove(name);
        } else {
            self.fields.insert(name.to_string(), value);
        }
    }

    /// Start of tracking: `followedSince` when set and parseable, else `createdAt`.
    pub fn tracked_since(&self) -> DateTime<Utc> {
        self.fields
            .get(TRACKED_SINCE_FIELD)
            .and_then(Value::as_str)
            .and_then(parse_date)
            .unwrap_or(self.created_at)
    }

    /// History entries in chronological order (stable for equal dates).
    pub fn sorted_history(&self) -> Vec<&HistoryEntry> {
        let mut entries: Vec<&HistoryEntry> = self.history.iter().collect();
        entries.sort_by_key(|entry| entry.date);
        entries
    }
}

/// Parse an RFC 3339 timestamp or a bare `YYYY-MM-DD` date (as midnight UTC).
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}
