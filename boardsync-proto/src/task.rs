//! Task documents: the raw key/value form delivered by the store and the
//! typed [`Task`] decoded from it.
//!
//! Only `id`, `status`, `createdAt`, `ownerId` and `revision` carry meaning
//! for board reconciliation. Everything else is decoded for display and
//! passed through untouched, including fields this crate does not know
//! about (kept in [`Task::extra`]).

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::instant::RawInstant;

/// A document's field map, also used as the payload of point writes.
pub type FieldMap = serde_json::Map<String, Value>;

/// Document field names as stored.
pub mod fields {
    /// Stable task identifier.
    pub const ID: &str = "id";
    /// Owning user identifier.
    pub const OWNER_ID: &str = "ownerId";
    /// Legacy spelling of [`OWNER_ID`] found in older documents.
    pub const LEGACY_OWNER_ID: &str = "userId";
    /// Task title.
    pub const TITLE: &str = "title";
    /// Free-form description.
    pub const DESCRIPTION: &str = "description";
    /// Array of tag strings.
    pub const TAGS: &str = "tags";
    /// Optional due date.
    pub const DUE_DATE: &str = "dueDate";
    /// Raw status string.
    pub const STATUS: &str = "status";
    /// Priority (`low`, `medium`, `high`).
    pub const PRIORITY: &str = "priority";
    /// Creation instant.
    pub const CREATED_AT: &str = "createdAt";
    /// Last update instant.
    pub const UPDATED_AT: &str = "updatedAt";
    /// Store-assigned revision.
    pub const REVISION: &str = "revision";

    /// Fields decoded into typed members of [`super::Task`].
    pub const KNOWN: [&str; 12] = [
        ID,
        OWNER_ID,
        LEGACY_OWNER_ID,
        TITLE,
        DESCRIPTION,
        TAGS,
        DUE_DATE,
        STATUS,
        PRIORITY,
        CREATED_AT,
        UPDATED_AT,
        REVISION,
    ];
}

/// Errors produced when a raw document cannot become a [`Task`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The value is not a JSON object.
    #[error("task document is not an object")]
    NotAnObject,
    /// The document has no usable `id` field.
    #[error("task document has no id")]
    MissingId,
    /// The document has no owner field.
    #[error("task {0} has no owner")]
    MissingOwner(TaskId),
}

/// Opaque, stable task identifier. Ordered lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Creates a task identifier from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string form of this identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Identifier of the signed-in user owning a board.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    /// Creates an owner identifier from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string form of this identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store-assigned, monotonically increasing document revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(u64);

impl Revision {
    /// Wraps a raw revision number.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw revision number.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The revision following this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Display priority. Never interpreted by reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Low priority.
    Low,
    /// Medium priority (also the fallback for unknown values).
    #[default]
    Medium,
    /// High priority.
    High,
}

impl Priority {
    /// Parses a stored priority, case-insensitively.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" | "normal" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }

    /// The spelling written back to the store.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// A task document exactly as the store delivered it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawTask(FieldMap);

impl RawTask {
    /// Wraps an existing field map.
    #[must_use]
    pub const fn new(fields: FieldMap) -> Self {
        Self(fields)
    }

    /// Converts a JSON value into a raw task.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::NotAnObject`] if `value` is not an object.
    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            _ => Err(DecodeError::NotAnObject),
        }
    }

    /// Returns a field by its document name.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Returns the underlying field map.
    #[must_use]
    pub const fn fields(&self) -> &FieldMap {
        &self.0
    }

    /// Returns a mutable reference to the underlying field map.
    pub const fn fields_mut(&mut self) -> &mut FieldMap {
        &mut self.0
    }

    /// Best-effort id for diagnostics, before full decoding.
    #[must_use]
    pub fn id_hint(&self) -> Option<TaskId> {
        self.0.get(fields::ID).and_then(value_to_id)
    }
}

/// A decoded task document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Stable identifier.
    pub id: TaskId,
    /// Owning user.
    pub owner_id: OwnerId,
    /// Title (opaque).
    pub title: String,
    /// Description (opaque).
    pub description: String,
    /// Tag set (opaque).
    pub tags: BTreeSet<String>,
    /// Optional due date (opaque).
    pub due_date: RawInstant,
    /// Raw status string as stored; normalize before use.
    pub status: String,
    /// Display priority.
    pub priority: Priority,
    /// Creation instant in its stored representation.
    pub created_at: RawInstant,
    /// Last update instant in its stored representation.
    pub updated_at: RawInstant,
    /// Store revision, if the document carries one.
    pub revision: Option<Revision>,
    /// Fields not modelled above, passed through verbatim.
    #[serde(flatten)]
    pub extra: FieldMap,
}

impl Task {
    /// Decodes a raw store document.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::MissingId`] if the id is missing or empty, and
    /// [`DecodeError::MissingOwner`] if neither `ownerId` nor `userId` is set.
    pub fn decode(raw: &RawTask) -> Result<Self, DecodeError> {
        let id = raw.id_hint().ok_or(DecodeError::MissingId)?;
        let owner_id = raw
            .get(fields::OWNER_ID)
            .or_else(|| raw.get(fields::LEGACY_OWNER_ID))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(OwnerId::new)
            .ok_or_else(|| DecodeError::MissingOwner(id.clone()))?;

        let priority = match raw.get(fields::PRIORITY).and_then(Value::as_str) {
            Some(p) => Priority::parse(p).unwrap_or_else(|| {
                tracing::debug!(task_id = %id, priority = p, "unknown priority, using medium");
                Priority::Medium
            }),
            None => Priority::Medium,
        };

        let extra = raw
            .fields()
            .iter()
            .filter(|(k, _)| !fields::KNOWN.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Self {
            id,
            owner_id,
            title: string_field(raw.get(fields::TITLE)),
            description: string_field(raw.get(fields::DESCRIPTION)),
            tags: tags_field(raw.get(fields::TAGS)),
            due_date: RawInstant::from_value(raw.get(fields::DUE_DATE)),
            status: string_field(raw.get(fields::STATUS)),
            priority,
            created_at: RawInstant::from_value(raw.get(fields::CREATED_AT)),
            updated_at: RawInstant::from_value(raw.get(fields::UPDATED_AT)),
            revision: raw
                .get(fields::REVISION)
                .and_then(Value::as_u64)
                .map(Revision::new),
            extra,
        })
    }

    /// Current value of a field, by document name, in comparable form.
    ///
    /// Tags come back as a sorted array so set equality can be checked with
    /// plain value equality.
    #[must_use]
    pub fn field_value(&self, field: &str) -> Value {
        match field {
            fields::ID => Value::String(self.id.to_string()),
            fields::OWNER_ID | fields::LEGACY_OWNER_ID => {
                Value::String(self.owner_id.to_string())
            }
            fields::TITLE => Value::String(self.title.clone()),
            fields::DESCRIPTION => Value::String(self.description.clone()),
            fields::TAGS => tags_value(&self.tags),
            fields::DUE_DATE => self.due_date.to_value(),
            fields::STATUS => Value::String(self.status.clone()),
            fields::PRIORITY => Value::String(self.priority.as_str().to_string()),
            fields::CREATED_AT => self.created_at.to_value(),
            fields::UPDATED_AT => self.updated_at.to_value(),
            fields::REVISION => self.revision.map_or(Value::Null, |r| Value::from(r.get())),
            other => self.extra.get(other).cloned().unwrap_or(Value::Null),
        }
    }

    /// Returns `true` if every field in `update` already holds that value.
    #[must_use]
    pub fn reflects(&self, update: &FieldMap) -> bool {
        update.iter().all(|(field, expected)| {
            let expected = if field == fields::TAGS {
                tags_value(&tags_field(Some(expected)))
            } else if matches!(
                field.as_str(),
                fields::DUE_DATE | fields::CREATED_AT | fields::UPDATED_AT
            ) {
                RawInstant::from_value(Some(expected)).to_value()
            } else {
                expected.clone()
            };
            self.field_value(field) == expected
        })
    }

    /// Overlays a field update onto this task, as an edit would once stored.
    ///
    /// Identity fields (`id`, owner, `revision`) are never overwritten.
    pub fn apply_fields(&mut self, update: &FieldMap) {
        for (field, value) in update {
            match field.as_str() {
                fields::ID | fields::OWNER_ID | fields::LEGACY_OWNER_ID | fields::REVISION => {}
                fields::TITLE => self.title = string_field(Some(value)),
                fields::DESCRIPTION => self.description = string_field(Some(value)),
                fields::TAGS => self.tags = tags_field(Some(value)),
                fields::DUE_DATE => self.due_date = RawInstant::from_value(Some(value)),
                fields::STATUS => self.status = string_field(Some(value)),
                fields::PRIORITY => {
                    if let Some(p) = value.as_str().and_then(Priority::parse) {
                        self.priority = p;
                    }
                }
                fields::CREATED_AT => self.created_at = RawInstant::from_value(Some(value)),
                fields::UPDATED_AT => self.updated_at = RawInstant::from_value(Some(value)),
                other => {
                    self.extra.insert(other.to_string(), value.clone());
                }
            }
        }
    }
}

fn value_to_id(value: &Value) -> Option<TaskId> {
    match value {
        Value::String(s) if !s.is_empty() => Some(TaskId::new(s.clone())),
        Value::Number(n) => Some(TaskId::new(n.to_string())),
        _ => None,
    }
}

fn string_field(value: Option<&Value>) -> String {
    value
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_default()
}

fn tags_field(value: Option<&Value>) -> BTreeSet<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn tags_value(tags: &BTreeSet<String>) -> Value {
    Value::Array(tags.iter().cloned().map(Value::String).collect())
}
