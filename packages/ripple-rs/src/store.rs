//! In-memory entity store that owns the signal bus.
//!
//! The store holds one table per model. It is not a persistence engine: it
//! exists so writes, their undo log, and `exists` checks can be observed.
//!
//! # Writes
//!
//! Every write runs inside a [`UnitOfWork`]. The convenience methods
//! [`Store::create`], [`Store::save`] and [`Store::delete`] open a one-write
//! unit and commit it immediately (autocommit).
//!
//! # Isolation
//!
//! Writes are applied to the tables immediately and are visible to every
//! reader before commit. Concurrent units of work touching the same entity
//! are not isolated from each other.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tracing::error;

use crate::bus::EventBus;
use crate::core::{Entity, EntityId};
use crate::error::SignalError;
use crate::unit_of_work::UnitOfWork;

type Table = BTreeMap<EntityId, Entity>;

/// A full copy of every table, keyed by model then entity ID.
pub type Snapshot = BTreeMap<String, Table>;

/// Field equality constraints on one model.
///
/// # Example
///
/// ```ignore
/// let criteria = Criteria::model("Profile").eq("user", "testuser");
/// assert!(!store.exists(&criteria));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Criteria {
    model: String,
    fields: Vec<(String, Value)>,
}

impl Criteria {
    /// Match every entity of a model.
    pub fn model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            fields: Vec::new(),
        }
    }

    /// Additionally require `field == value`.
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push((field.into(), value.into()));
        self
    }

    /// Check whether an entity satisfies every constraint.
    pub fn matches(&self, entity: &Entity) -> bool {
        entity.model == self.model
            && self
                .fields
                .iter()
                .all(|(field, value)| entity.fields.get(field) == Some(value))
    }
}

struct StoreInner {
    tables: Mutex<HashMap<String, Table>>,
    bus: EventBus,
}

/// Shared handle to the entity tables and their bus.
///
/// Cheap to clone; clones share the same tables.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Create an empty store with a fresh bus.
    pub fn new() -> Self {
        Self::with_bus(EventBus::new())
    }

    /// Create an empty store publishing on the given bus.
    pub fn with_bus(bus: EventBus) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                tables: Mutex::new(HashMap::new()),
                bus,
            }),
        }
    }

    /// The bus signals are published on.
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Open a unit of work.
    ///
    /// Dropping the unit without committing rolls it back.
    pub fn begin(&self) -> UnitOfWork {
        UnitOfWork::new(self.clone())
    }

    /// Run `f` inside a unit of work.
    ///
    /// Commits when `f` returns `Ok`. Rolls back when it returns `Err` and
    /// then returns that error. If the rollback itself cannot restore the
    /// pre-region state, the fatal [`SignalError::Inconsistent`] is returned
    /// instead and the original error is logged.
    ///
    /// # Example
    ///
    /// ```ignore
    /// use futures::FutureExt;
    ///
    /// let result: anyhow::Result<()> = store
    ///     .atomic(|uow| {
    ///         async move {
    ///             uow.create("User", json!({ "username": "testuser" })).await?;
    ///             anyhow::bail!("forcing rollback");
    ///         }
    ///         .boxed()
    ///     })
    ///     .await;
    /// ```
    pub async fn atomic<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: for<'u> FnOnce(&'u mut UnitOfWork) -> BoxFuture<'u, Result<T, E>>,
        E: From<SignalError> + Display,
    {
        let mut unit = self.begin();
        match f(&mut unit).await {
            Ok(value) => {
                unit.commit();
                Ok(value)
            }
            Err(err) => {
                let unit_id = unit.id();
                if let Err(fatal) = unit.rollback(&err) {
                    error!(uow = %unit_id, error = %err, "rollback failed after region error");
                    return Err(E::from(fatal));
                }
                Err(err)
            }
        }
    }

    /// Create an entity in its own unit of work.
    pub async fn create(
        &self,
        model: impl Into<String>,
        fields: Value,
    ) -> Result<Entity, SignalError> {
        let mut unit = self.begin();
        let entity = unit.create(model, fields).await?;
        unit.commit();
        Ok(entity)
    }

    /// Create an entity from a serializable value in its own unit of work.
    pub async fn create_from<T: Serialize + Sync>(
        &self,
        model: impl Into<String>,
        value: &T,
    ) -> Result<Entity, SignalError> {
        let mut unit = self.begin();
        let entity = unit.create_from(model, value).await?;
        unit.commit();
        Ok(entity)
    }

    /// Update an entity in its own unit of work.
    pub async fn save(&self, entity: Entity) -> Result<Entity, SignalError> {
        let mut unit = self.begin();
        let entity = unit.save(entity).await?;
        unit.commit();
        Ok(entity)
    }

    /// Delete an entity in its own unit of work.
    pub async fn delete(&self, model: &str, id: EntityId) -> Result<Entity, SignalError> {
        let mut unit = self.begin();
        let entity = unit.delete(model, id).await?;
        unit.commit();
        Ok(entity)
    }

    /// Get an entity by ID.
    pub fn get(&self, model: &str, id: EntityId) -> Option<Entity> {
        self.tables()
            .get(model)
            .and_then(|table| table.get(&id))
            .cloned()
    }

    /// Check whether any entity satisfies the criteria.
    pub fn exists(&self, criteria: &Criteria) -> bool {
        self.tables()
            .get(&criteria.model)
            .is_some_and(|table| table.values().any(|e| criteria.matches(e)))
    }

    /// All entities satisfying the criteria, ordered by ID.
    pub fn filter(&self, criteria: &Criteria) -> Vec<Entity> {
        self.tables()
            .get(&criteria.model)
            .map(|table| {
                table
                    .values()
                    .filter(|e| criteria.matches(e))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of entities of a model.
    pub fn count(&self, model: &str) -> usize {
        self.tables().get(model).map_or(0, BTreeMap::len)
    }

    /// Copy of every non-empty table.
    pub fn snapshot(&self) -> Snapshot {
        self.tables()
            .iter()
            .filter(|(_, table)| !table.is_empty())
            .map(|(model, table)| (model.clone(), table.clone()))
            .collect()
    }

    // =========================================================================
    // Raw table access (units of work only)
    // =========================================================================

    pub(crate) fn tables(&self) -> MutexGuard<'_, HashMap<String, Table>> {
        self.inner
            .tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn insert(&self, entity: Entity) {
        self.tables()
            .entry(entity.model.clone())
            .or_default()
            .insert(entity.id, entity);
    }

    /// Replace an existing entity, returning the previous version.
    pub(crate) fn replace(&self, entity: Entity) -> Result<Entity, SignalError> {
        let mut tables = self.tables();
        let slot = tables
            .get_mut(&entity.model)
            .and_then(|table| table.get_mut(&entity.id))
            .ok_or_else(|| SignalError::NotFound {
                model: entity.model.clone(),
                id: entity.id,
            })?;
        Ok(std::mem::replace(slot, entity))
    }

    pub(crate) fn remove(&self, model: &str, id: EntityId) -> Result<Entity, SignalError> {
        self.tables()
            .get_mut(model)
            .and_then(|table| table.remove(&id))
            .ok_or_else(|| SignalError::NotFound {
                model: model.to_string(),
                id,
            })
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables();
        let counts: BTreeMap<&str, usize> = tables
            .iter()
            .map(|(model, table)| (model.as_str(), table.len()))
            .collect();
        f.debug_struct("Store")
            .field("tables", &counts)
            .field("bus", &self.inner.bus)
            .finish()
    }
}
