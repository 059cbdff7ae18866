//! Scoped atomic region of writes with commit/rollback semantics.
//!
//! # State Machine
//!
//! ```text
//! Open ──commit()────► Committed
//!   │
//!   └──rollback()/drop──► RolledBack
//! ```
//!
//! Both terminal states are reached by consuming the unit, so nothing can
//! transition out of them. Dropping an open unit rolls it back, which makes
//! exactly one of commit/rollback run however the region exits.
//!
//! # Write Log
//!
//! Every write appends an undo record, whether it was issued by application
//! code or by a receiver reacting to a signal from this unit. Rollback
//! replays the records in reverse against a copy of the touched tables and
//! swaps the copy in only if every record applied cleanly.

use std::collections::HashMap;
use std::fmt::Display;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::core::{into_fields, Entity, EntityId, Signal, SignalKind};
use crate::error::SignalError;
use crate::receiver::ReceiverContext;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitState {
    Open,
    Committed,
    RolledBack,
}

/// Undo information for one applied write.
#[derive(Debug, Clone)]
enum WriteRecord {
    Inserted { model: String, id: EntityId },
    Updated { previous: Entity },
    Deleted { previous: Entity },
}

impl WriteRecord {
    fn model(&self) -> &str {
        match self {
            WriteRecord::Inserted { model, .. } => model,
            WriteRecord::Updated { previous } | WriteRecord::Deleted { previous } => {
                &previous.model
            }
        }
    }
}

type CommitHook = Box<dyn FnOnce() + Send>;

/// Position in a unit's write log, see [`UnitOfWork::rollback_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Savepoint {
    writes: usize,
    hooks: usize,
}

/// An open transactional region over a [`Store`].
///
/// # Example
///
/// ```ignore
/// let mut uow = store.begin();
/// let user = uow.create("User", json!({ "username": "testuser" })).await?;
/// uow.on_commit(move || tracing::info!("welcome {}", user.id));
/// uow.commit();
/// ```
pub struct UnitOfWork {
    id: Uuid,
    store: Store,
    state: UnitState,
    log: Vec<WriteRecord>,
    on_commit: Vec<CommitHook>,
}

impl UnitOfWork {
    pub(crate) fn new(store: Store) -> Self {
        let id = Uuid::new_v4();
        debug!(uow = %id, "unit of work opened");
        Self {
            id,
            store,
            state: UnitState::Open,
            log: Vec::new(),
            on_commit: Vec::new(),
        }
    }

    /// Unique identifier, carried by every signal this unit publishes.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The store this unit writes to.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Number of writes that would be undone by a rollback.
    pub fn pending_writes(&self) -> usize {
        self.log.len()
    }

    /// Create an entity.
    ///
    /// Publishes `PreSave` before and `PostSave` after the insert, both with
    /// `created = true`.
    pub async fn create(
        &mut self,
        model: impl Into<String>,
        fields: Value,
    ) -> Result<Entity, SignalError> {
        let model = model.into();
        let fields = into_fields(&model, fields)?;
        let entity = Entity::new(model, fields);

        self.dispatch(SignalKind::PreSave, &entity, true).await?;

        self.store.insert(entity.clone());
        self.log.push(WriteRecord::Inserted {
            model: entity.model.clone(),
            id: entity.id,
        });
        debug!(uow = %self.id, model = %entity.model, id = %entity.id, "entity created");

        self.dispatch(SignalKind::PostSave, &entity, true).await?;
        Ok(entity)
    }

    /// Create an entity from any serializable value.
    ///
    /// The value must serialize to a JSON object.
    pub async fn create_from<T: Serialize + Sync>(
        &mut self,
        model: impl Into<String>,
        value: &T,
    ) -> Result<Entity, SignalError> {
        let model = model.into();
        let fields = serde_json::to_value(value).map_err(|e| SignalError::InvalidFields {
            model: model.clone(),
            message: e.to_string(),
        })?;
        self.create(model, fields).await
    }

    /// Write the fields of an existing entity.
    ///
    /// Publishes `PreSave` and `PostSave` with `created = false`.
    pub async fn save(&mut self, mut entity: Entity) -> Result<Entity, SignalError> {
        if self.store.get(&entity.model, entity.id).is_none() {
            return Err(SignalError::NotFound {
                model: entity.model,
                id: entity.id,
            });
        }

        self.dispatch(SignalKind::PreSave, &entity, false).await?;

        entity.saved_at = Utc::now();
        let previous = self.store.replace(entity.clone())?;
        self.log.push(WriteRecord::Updated { previous });
        debug!(uow = %self.id, model = %entity.model, id = %entity.id, "entity updated");

        self.dispatch(SignalKind::PostSave, &entity, false).await?;
        Ok(entity)
    }

    /// Delete an entity, returning its last state.
    ///
    /// Publishes `PreDelete` and `PostDelete`.
    pub async fn delete(&mut self, model: &str, id: EntityId) -> Result<Entity, SignalError> {
        let current = self
            .store
            .get(model, id)
            .ok_or_else(|| SignalError::NotFound {
                model: model.to_string(),
                id,
            })?;

        self.dispatch(SignalKind::PreDelete, &current, false).await?;

        let previous = self.store.remove(model, id)?;
        self.log.push(WriteRecord::Deleted {
            previous: previous.clone(),
        });
        debug!(uow = %self.id, model = %model, id = %id, "entity deleted");

        self.dispatch(SignalKind::PostDelete, &previous, false).await?;
        Ok(previous)
    }

    /// Run `f` after this unit commits. Discarded on rollback.
    pub fn on_commit<F>(&mut self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_commit.push(Box::new(f));
    }

    /// Make every write permanent and run the commit hooks.
    pub fn commit(mut self) {
        let writes = self.log.len();
        self.log.clear();
        self.state = UnitState::Committed;
        let hooks = std::mem::take(&mut self.on_commit);
        debug!(uow = %self.id, writes, hooks = hooks.len(), "unit of work committed");

        for hook in hooks {
            hook();
        }
    }

    /// Undo every write in reverse order.
    ///
    /// Returns [`SignalError::Inconsistent`] if an undo record no longer
    /// matches the store; in that case no record is applied.
    pub fn rollback(mut self, reason: impl Display) -> Result<(), SignalError> {
        self.rollback_in_place(&reason)
    }

    async fn dispatch(
        &mut self,
        kind: SignalKind,
        instance: &Entity,
        created: bool,
    ) -> Result<(), SignalError> {
        let bus = self.store.bus().clone();
        let signal = Signal::within(kind, instance, created, self.id);
        let mut ctx = ReceiverContext::within(self);
        bus.publish(&signal, &mut ctx).await
    }

    /// Mark the current end of the write log and hook list.
    pub(crate) fn savepoint(&self) -> Savepoint {
        Savepoint {
            writes: self.log.len(),
            hooks: self.on_commit.len(),
        }
    }

    /// Undo the writes and discard the hooks added since `savepoint`.
    ///
    /// The unit stays open. Like a full rollback, either every record after
    /// the savepoint is undone or none is.
    pub(crate) fn rollback_to(&mut self, savepoint: Savepoint) -> Result<(), SignalError> {
        if savepoint.writes > self.log.len() {
            return Ok(());
        }
        let records = self.log.split_off(savepoint.writes);
        self.on_commit.truncate(savepoint.hooks);
        debug!(
            uow = %self.id,
            writes = records.len(),
            "rolling back to savepoint"
        );
        let result = self.undo(&records);
        if result.is_err() {
            self.log.extend(records);
        }
        result
    }

    fn rollback_in_place(&mut self, reason: &dyn Display) -> Result<(), SignalError> {
        let records = std::mem::take(&mut self.log);
        let discarded_hooks = std::mem::take(&mut self.on_commit).len();
        self.state = UnitState::RolledBack;

        warn!(
            uow = %self.id,
            writes = records.len(),
            discarded_hooks,
            reason = %reason,
            "rolling back unit of work"
        );

        self.undo(&records)
    }

    /// Apply undo records in reverse to a copy of the touched tables, then
    /// swap the copy in. Nothing is applied if any record fails.
    fn undo(&self, records: &[WriteRecord]) -> Result<(), SignalError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tables = self.store.tables();
        let mut scratch: HashMap<String, _> = HashMap::new();
        for record in records {
            if !scratch.contains_key(record.model()) {
                let table = tables.get(record.model()).cloned().unwrap_or_default();
                scratch.insert(record.model().to_string(), table);
            }
        }

        for record in records.iter().rev() {
            let table = scratch.entry(record.model().to_string()).or_default();
            let applied = match record {
                WriteRecord::Inserted { id, .. } => table.remove(id).is_some(),
                WriteRecord::Updated { previous } => match table.get_mut(&previous.id) {
                    Some(slot) => {
                        *slot = previous.clone();
                        true
                    }
                    None => false,
                },
                WriteRecord::Deleted { previous } => table
                    .insert(previous.id, previous.clone())
                    .is_none(),
            };

            if !applied {
                let reason = match record {
                    WriteRecord::Inserted { model, id } => {
                        format!("{model} {id} inserted in this unit no longer exists")
                    }
                    WriteRecord::Updated { previous } => format!(
                        "{} {} updated in this unit no longer exists",
                        previous.model, previous.id
                    ),
                    WriteRecord::Deleted { previous } => format!(
                        "{} {} deleted in this unit was recreated",
                        previous.model, previous.id
                    ),
                };
                error!(uow = %self.id, %reason, "rollback aborted, store left untouched");
                return Err(SignalError::Inconsistent {
                    unit_of_work: self.id,
                    reason,
                });
            }
        }

        tables.extend(scratch);
        Ok(())
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        if self.state != UnitState::Open {
            return;
        }
        if let Err(e) = self.rollback_in_place(&"dropped without commit") {
            error!(uow = %self.id, error = %e, "rollback on drop failed");
        }
    }
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("pending_writes", &self.log.len())
            .field("on_commit", &self.on_commit.len())
            .finish()
    }
}
