//! Core data model, augmentation merge and wire protocol for sheetsync.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

/// Opaque identifier of one external tabular resource. Equality is exact string match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Key under which the raw snapshot of this resource is memoized.
    pub fn snapshot_cache_key(&self) -> String {
        format!("snapshot:{}", self.0)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identity of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Scalar cell value as read from the upstream resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::Text(value.to_string())
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        CellValue::Text(value)
    }
}

/// One data row keyed by header. Keys are kept sorted so serialization is stable.
pub type Row = BTreeMap<String, CellValue>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("duplicate header {0:?}")]
    DuplicateHeader(String),
    #[error("empty header at column {0}")]
    EmptyHeader(usize),
}

/// Point-in-time read of a resource. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSnapshot {
    title: String,
    section_title: String,
    headers: Vec<String>,
    rows: Vec<Row>,
}

impl RawSnapshot {
    pub fn new(
        title: impl Into<String>,
        section_title: impl Into<String>,
        headers: Vec<String>,
        rows: Vec<Row>,
    ) -> Result<Self, SnapshotError> {
        let mut seen = HashSet::with_capacity(headers.len());
        for (idx, header) in headers.iter().enumerate() {
            if header.trim().is_empty() {
                return Err(SnapshotError::EmptyHeader(idx));
            }
            if !seen.insert(header.as_str()) {
                return Err(SnapshotError::DuplicateHeader(header.clone()));
            }
        }
        Ok(Self {
            title: title.into(),
            section_title: section_title.into(),
            headers,
            rows,
        })
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn section_title(&self) -> &str {
        &self.section_title
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ColumnDataType {
    Text,
    Date,
}

impl ColumnDataType {
    pub fn as_str(self) -> &'static str {
        match self {
            ColumnDataType::Text => "TEXT",
            ColumnDataType::Date => "DATE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized column data type {0:?}")]
pub struct UnknownDataType(pub String);

impl FromStr for ColumnDataType {
    type Err = UnknownDataType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TEXT" => Ok(ColumnDataType::Text),
            "DATE" => Ok(ColumnDataType::Date),
            _ => Err(UnknownDataType(s.to_string())),
        }
    }
}

/// User-defined supplemental column merged into snapshots for its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AugmentationColumn {
    pub id: String,
    pub name: String,
    pub data_type: ColumnDataType,
    pub position: i32,
    pub owner_user_id: UserId,
}

/// Position for a newly added column given the positions already in use.
pub fn next_position<'a>(existing: impl IntoIterator<Item = &'a AugmentationColumn>) -> i32 {
    existing
        .into_iter()
        .map(|c| c.position)
        .max()
        .map(|max| max + 1)
        .unwrap_or(0)
}

/// Snapshot as delivered to clients: source data plus one user's augmentation columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedSnapshot {
    pub title: String,
    pub section_title: String,
    pub headers: Vec<String>,
    pub original_headers: Vec<String>,
    pub rows: Vec<Row>,
    pub dynamic_columns: Vec<AugmentationColumn>,
}

impl EnrichedSnapshot {
    /// Stable serialized form used for change detection.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Byte equality of the canonical forms. A snapshot that fails to
    /// serialize never compares equal.
    pub fn same_content(&self, other: &EnrichedSnapshot) -> bool {
        match (self.canonical_bytes(), other.canonical_bytes()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }

    /// Hex SHA-256 of the canonical form, for logs.
    pub fn fingerprint(&self) -> Result<String, serde_json::Error> {
        let bytes = self.canonical_bytes()?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(hex::encode(hasher.finalize()))
    }

    pub fn reflects_columns(&self, columns: &[AugmentationColumn]) -> bool {
        self.dynamic_columns == ordered_columns(columns)
    }
}

fn ordered_columns(columns: &[AugmentationColumn]) -> Vec<AugmentationColumn> {
    let mut ordered = columns.to_vec();
    ordered.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.id.cmp(&b.id)));
    ordered
}

/// Merge augmentation columns into a raw snapshot.
///
/// Augmentation headers are appended after the source headers in position
/// order. A name that collides with an earlier header is shown with the first
/// free `" (n)"` suffix so the merged header list stays unique.
pub fn enrich(raw: &RawSnapshot, columns: &[AugmentationColumn]) -> EnrichedSnapshot {
    let dynamic_columns = ordered_columns(columns);
    let mut headers = raw.headers.clone();
    let mut taken: HashSet<String> = headers.iter().cloned().collect();

    for column in &dynamic_columns {
        let display = if taken.contains(&column.name) {
            (2..)
                .map(|n| format!("{} ({n})", column.name))
                .find(|candidate| !taken.contains(candidate))
                .unwrap_or_else(|| column.id.clone())
        } else {
            column.name.clone()
        };
        taken.insert(display.clone());
        headers.push(display);
    }

    EnrichedSnapshot {
        title: raw.title.clone(),
        section_title: raw.section_title.clone(),
        headers,
        original_headers: raw.headers.clone(),
        rows: raw.rows.clone(),
        dynamic_columns,
    }
}

/// Client → hub messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    Subscribe {
        resource_id: ResourceId,
        #[serde(default)]
        user_id: Option<UserId>,
    },
    Unsubscribe {
        resource_id: ResourceId,
    },
}

impl ClientEvent {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Hub → client messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    Snapshot(EnrichedSnapshot),
    Error { message: String },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            ServerEvent::Snapshot(_) => "snapshot",
            ServerEvent::Error { .. } => "error",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
