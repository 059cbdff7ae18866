//! # Ripple
//!
//! Lifecycle signals for stored entities, where everything a receiver writes
//! belongs to the unit of work that triggered it.
//!
//! ## Core Concepts
//!
//! Ripple separates **state** from **notification**:
//! - [`Entity`] = State (records in a [`Store`], written only inside a [`UnitOfWork`])
//! - [`Signal`] = Notification (what happened to an entity)
//!
//! The key principle: **a receiver's writes share the fate of the write that
//! triggered it**. If the unit of work fails, the receiver's writes are undone
//! with it.
//!
//! ## Architecture
//!
//! ```text
//! Application
//!     │
//!     ▼ store.atomic() / store.begin()
//! UnitOfWork ◄──────────────────────────────────────┐
//!     │                                             │
//!     ▼ create() / save() / delete()                │
//! Store tables + undo log                           │
//!     │                                             │
//!     ▼ publish(PreSave/PostSave/...)               │
//! EventBus                                          │
//!     │                                             │
//!     ├─► Receiver A (synchronous) ─► ctx.create() ─┘
//!     │
//!     ├─► Receiver B (synchronous, slow) ── writer waits
//!     │
//!     └─► Receiver C (detached) ─► on commit: tokio::spawn ─► own unit of work
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Registration order** - Receivers of one kind run in subscription order
//! 2. **Exactly one outcome** - A unit of work commits or rolls back, never both
//! 3. **All or nothing** - Rollback restores the pre-region state or reports
//!    [`SignalError::Inconsistent`] without touching the store
//! 4. **Failures surface** - A failing receiver fails the write (by default)
//!    and the region's error is returned after rollback
//! 5. **No globals** - The bus is owned by the store it publishes for
//!
//! ## Example
//!
//! ```ignore
//! use futures::FutureExt;
//! use ripple::{async_trait, Criteria, Receiver, ReceiverContext, Signal, SignalKind, Store, Subscription};
//! use serde_json::json;
//!
//! struct CreateProfile;
//!
//! #[async_trait]
//! impl Receiver for CreateProfile {
//!     async fn receive(&self, signal: &Signal, ctx: &mut ReceiverContext<'_>) -> anyhow::Result<()> {
//!         let username = signal.instance.get_str("username").unwrap_or_default();
//!         ctx.create("Profile", json!({ "user": username })).await?;
//!         Ok(())
//!     }
//! }
//!
//! let store = Store::new();
//! store.bus().subscribe_with(
//!     Subscription::to(SignalKind::PostSave).from_sender("User"),
//!     CreateProfile,
//! );
//!
//! let result: anyhow::Result<()> = store
//!     .atomic(|uow| async move {
//!         uow.create("User", json!({ "username": "testuser" })).await?;
//!         anyhow::bail!("Forcing rollback!");
//!     }.boxed())
//!     .await;
//!
//! assert!(result.is_err());
//! assert!(!store.exists(&Criteria::model("Profile").eq("user", "testuser")));
//! ```
//!
//! ## What This Is Not
//!
//! Ripple is **not**:
//! - A persistence engine (the store is in-memory)
//! - A distributed transaction coordinator
//! - A message broker (signals never leave the process)

// Core modules
mod bus;
mod core;
mod error;
mod receiver;
mod store;
mod unit_of_work;


// Re-export core types
pub use crate::core::{Entity, EntityId, ExecutionMode, Signal, SignalKind};

// Re-export error types
pub use crate::error::SignalError;

// Re-export bus types
pub use bus::{BusConfig, EventBus, FailurePolicy, Subscription, SubscriptionId};

// Re-export receiver types
pub use receiver::{receiver_fn, FnReceiver, Receiver, ReceiverContext};

// Re-export store types
pub use store::{Criteria, Snapshot, Store};

// Re-export unit of work
pub use unit_of_work::UnitOfWork;

// Re-export commonly used external types
pub use async_trait::async_trait;
