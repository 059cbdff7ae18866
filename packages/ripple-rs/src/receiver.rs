//! Receiver trait and context for reacting to signals.
//!
//! Receivers are the subscribers of the bus. They may perform further writes
//! through their [`ReceiverContext`], and those writes land in the same unit
//! of work as the write that triggered the signal.
//!
//! # Example
//!
//! ```ignore
//! use ripple::{async_trait, Receiver, ReceiverContext, Signal};
//! use serde_json::json;
//!
//! struct CreateProfile;
//!
//! #[async_trait]
//! impl Receiver for CreateProfile {
//!     async fn receive(&self, signal: &Signal, ctx: &mut ReceiverContext<'_>) -> anyhow::Result<()> {
//!         if signal.created {
//!             let username = signal.instance.get_str("username").unwrap_or_default();
//!             ctx.create("Profile", json!({ "user": username, "bio": "" })).await?;
//!         }
//!         Ok(())
//!     }
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::core::{Entity, EntityId, Signal};
use crate::error::SignalError;
use crate::store::Store;
use crate::unit_of_work::UnitOfWork;

/// Context passed to receivers.
///
/// Synchronous receivers get a context bound to the publisher's unit of work,
/// so everything they write is rolled back with it. Detached receivers get a
/// context without one; their writes autocommit on their own.
pub struct ReceiverContext<'a> {
    store: Store,
    unit: Option<&'a mut UnitOfWork>,
}

impl<'a> ReceiverContext<'a> {
    /// Create a context bound to a unit of work.
    pub fn within(unit: &'a mut UnitOfWork) -> Self {
        Self {
            store: unit.store().clone(),
            unit: Some(unit),
        }
    }

    /// Create a context without a unit of work. Writes autocommit.
    pub fn new(store: Store) -> ReceiverContext<'static> {
        ReceiverContext { store, unit: None }
    }

    /// The store the signal originated from.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// The enclosing unit of work, if any.
    ///
    /// Use this to register [`UnitOfWork::on_commit`] hooks.
    pub fn unit_of_work(&mut self) -> Option<&mut UnitOfWork> {
        self.unit.as_deref_mut()
    }

    /// Returns true when writes bypass any enclosing unit of work.
    pub fn is_autocommit(&self) -> bool {
        self.unit.is_none()
    }

    /// Create an entity.
    pub async fn create(
        &mut self,
        model: impl Into<String>,
        fields: Value,
    ) -> Result<Entity, SignalError> {
        match self.unit.as_deref_mut() {
            Some(unit) => unit.create(model, fields).await,
            None => self.store.create(model, fields).await,
        }
    }

    /// Update an existing entity.
    pub async fn save(&mut self, entity: Entity) -> Result<Entity, SignalError> {
        match self.unit.as_deref_mut() {
            Some(unit) => unit.save(entity).await,
            None => self.store.save(entity).await,
        }
    }

    /// Delete an entity.
    pub async fn delete(&mut self, model: &str, id: EntityId) -> Result<Entity, SignalError> {
        match self.unit.as_deref_mut() {
            Some(unit) => unit.delete(model, id).await,
            None => self.store.delete(model, id).await,
        }
    }
}

impl std::fmt::Debug for ReceiverContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiverContext")
            .field("unit_of_work", &self.unit.as_ref().map(|u| u.id()))
            .finish_non_exhaustive()
    }
}

/// Trait for reacting to published signals.
///
/// Returning an error fails the dispatch. Under the default
/// [`FailurePolicy::Propagate`](crate::FailurePolicy::Propagate) that error
/// reaches the writer and rolls back its unit of work.
#[async_trait]
pub trait Receiver: Send + Sync + 'static {
    /// Called for every matching signal.
    async fn receive(&self, signal: &Signal, ctx: &mut ReceiverContext<'_>) -> Result<()>;
}

/// A receiver backed by a plain closure. See [`receiver_fn`].
pub struct FnReceiver<F> {
    f: F,
}

#[async_trait]
impl<F> Receiver for FnReceiver<F>
where
    F: Fn(&Signal) -> Result<()> + Send + Sync + 'static,
{
    async fn receive(&self, signal: &Signal, _ctx: &mut ReceiverContext<'_>) -> Result<()> {
        (self.f)(signal)
    }
}

/// Wrap a closure as a receiver.
///
/// Closure receivers observe signals but cannot write; implement
/// [`Receiver`] for that.
///
/// ```ignore
/// bus.subscribe(SignalKind::PostSave, receiver_fn(|signal| {
///     tracing::info!(sender = %signal.sender, "saved");
///     Ok(())
/// }));
/// ```
pub fn receiver_fn<F>(f: F) -> FnReceiver<F>
where
    F: Fn(&Signal) -> Result<()> + Send + Sync + 'static,
{
    FnReceiver { f }
}
