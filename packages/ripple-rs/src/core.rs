//! Core types for ripple: entities, signals, and how receivers run.
//!
//! # Overview
//!
//! Ripple separates **state** from **notification**:
//! - [`Entity`] = State (a stored record, mutated only inside a unit of work)
//! - [`Signal`] = Notification (an immutable snapshot describing a change)
//!
//! Signals are never persisted. They exist only while the bus dispatches them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::SignalError;

/// Unique identifier of a stored entity.
///
/// # Example
///
/// ```ignore
/// use ripple::EntityId;
///
/// let id = EntityId::new();
/// let raw: uuid::Uuid = id.into();
/// assert_eq!(EntityId::from(raw), id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(Uuid);

impl EntityId {
    /// Create a new random entity ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get a reference to the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for EntityId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<EntityId> for Uuid {
    fn from(id: EntityId) -> Uuid {
        id.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stored record: identity, the model it belongs to, and its fields.
///
/// Fields are a JSON object so any serde type can be stored through
/// [`UnitOfWork::create_from`](crate::UnitOfWork::create_from) and read back
/// with [`Entity::decode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Unique identifier.
    pub id: EntityId,
    /// Model (table) name, e.g. `"User"`.
    pub model: String,
    /// Field values.
    pub fields: Map<String, Value>,
    /// When the entity was last written.
    pub saved_at: DateTime<Utc>,
}

impl Entity {
    pub(crate) fn new(model: String, fields: Map<String, Value>) -> Self {
        Self {
            id: EntityId::new(),
            model,
            fields,
            saved_at: Utc::now(),
        }
    }

    /// Get a field value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Get a string field value.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    /// Set a field value, returning the previous one.
    ///
    /// This only changes the local copy. Pass the entity to
    /// [`UnitOfWork::save`](crate::UnitOfWork::save) to write it.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(field.into(), value.into())
    }

    /// Deserialize the fields into a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, SignalError> {
        serde_json::from_value(Value::Object(self.fields.clone())).map_err(|e| {
            SignalError::InvalidFields {
                model: self.model.clone(),
                message: e.to_string(),
            }
        })
    }
}

/// Convert an arbitrary JSON value into an entity field map.
///
/// Only JSON objects are valid entity fields.
pub(crate) fn into_fields(model: &str, value: Value) -> Result<Map<String, Value>, SignalError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(SignalError::InvalidFields {
            model: model.to_string(),
            message: format!("expected a JSON object, got {}", json_type(&other)),
        }),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// The lifecycle moment a signal describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// Before an entity is inserted or updated. Failing aborts the write.
    PreSave,
    /// After an entity was inserted or updated.
    PostSave,
    /// Before an entity is deleted. Failing aborts the delete.
    PreDelete,
    /// After an entity was deleted.
    PostDelete,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::PreSave => write!(f, "pre_save"),
            SignalKind::PostSave => write!(f, "post_save"),
            SignalKind::PreDelete => write!(f, "pre_delete"),
            SignalKind::PostDelete => write!(f, "post_delete"),
        }
    }
}

/// An immutable notification about a state change on an entity.
///
/// # Example
///
/// ```ignore
/// if signal.kind == SignalKind::PostSave && signal.created {
///     println!("{} created: {}", signal.sender, signal.instance.id);
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Signal {
    /// What happened.
    pub kind: SignalKind,
    /// Model name of the entity (the sender, in receiver filters).
    pub sender: String,
    /// Snapshot of the entity at dispatch time.
    ///
    /// For `PostDelete` this is the entity as it was before removal.
    pub instance: Entity,
    /// True when the save inserted a new entity.
    pub created: bool,
    /// The unit of work the change belongs to (None for synthetic signals).
    pub unit_of_work: Option<Uuid>,
}

impl Signal {
    /// Create a signal not tied to any unit of work.
    ///
    /// Useful for publishing directly on a bus, e.g. in tests.
    pub fn new(kind: SignalKind, instance: Entity) -> Self {
        Self {
            kind,
            sender: instance.model.clone(),
            instance,
            created: false,
            unit_of_work: None,
        }
    }

    pub(crate) fn within(
        kind: SignalKind,
        instance: &Entity,
        created: bool,
        unit_of_work: Uuid,
    ) -> Self {
        Self {
            kind,
            sender: instance.model.clone(),
            instance: instance.clone(),
            created,
            unit_of_work: Some(unit_of_work),
        }
    }

    /// Mark the signal as describing an insert.
    pub fn created(mut self, created: bool) -> Self {
        self.created = created;
        self
    }
}

/// How a receiver is executed relative to the publisher.
///
/// - [`ExecutionMode::Synchronous`] - Run inline; the publisher waits for it
///   and its writes join the publisher's unit of work
/// - [`ExecutionMode::Detached`] - Spawn on the tokio runtime; the publisher
///   does not wait and its writes run in their own unit of work
///
/// There is no ordering guarantee between a detached receiver's effects and
/// the publisher's subsequent code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Execute immediately, blocking the publisher.
    #[default]
    Synchronous,
    /// Execute on a separate task.
    Detached,
}
