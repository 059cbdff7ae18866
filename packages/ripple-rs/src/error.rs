//! Structured error types for ripple.
//!
//! `SignalError` provides pattern-matchable errors instead of generic `anyhow::Error`.
//!
//! # The Error Boundary Rule
//!
//! - `anyhow` is receiver transport (ergonomic inside receivers)
//! - `SignalError` is what the bus and units of work return
//!
//! A receiver's `anyhow::Error` is wrapped in [`SignalError::ReceiverFailed`]
//! so callers can still reach it through `source()`.
//!
//! # Example
//!
//! ```ignore
//! use ripple::SignalError;
//!
//! match store.atomic(|uow| register(uow).boxed()).await {
//!     Ok(user) => println!("created {}", user.id),
//!     Err(SignalError::ReceiverFailed { receiver, kind, .. }) => {
//!         eprintln!("{receiver} failed on {kind}, nothing was written");
//!     }
//!     Err(e) if e.is_fatal() => panic!("store is inconsistent: {e}"),
//!     Err(e) => eprintln!("rolled back: {e}"),
//! }
//! ```

use thiserror::Error;
use uuid::Uuid;

use crate::core::{EntityId, SignalKind};

/// Errors returned by the bus, the store and units of work.
#[derive(Debug, Error)]
pub enum SignalError {
    /// A synchronous receiver returned an error.
    #[error("receiver {receiver} failed on {kind}: {source}")]
    ReceiverFailed {
        /// Name of the receiver.
        receiver: String,
        /// Kind of the signal being dispatched.
        kind: SignalKind,
        /// The receiver's error.
        #[source]
        source: anyhow::Error,
    },

    /// A synchronous receiver panicked.
    #[error("receiver {receiver} panicked on {kind}: {message}")]
    ReceiverPanicked {
        /// Name of the receiver.
        receiver: String,
        /// Kind of the signal being dispatched.
        kind: SignalKind,
        /// Panic payload, if it was a string.
        message: String,
    },

    /// The entity to update or delete does not exist.
    #[error("{model} {id} not found")]
    NotFound {
        /// Model name.
        model: String,
        /// Entity ID.
        id: EntityId,
    },

    /// Entity fields are not a JSON object or do not match the requested type.
    #[error("invalid fields for {model}: {message}")]
    InvalidFields {
        /// Model name.
        model: String,
        /// What was wrong.
        message: String,
    },

    /// A detached receiver was published to outside a tokio runtime.
    #[error("detached receiver {receiver} requires a tokio runtime")]
    NoRuntime {
        /// Name of the receiver.
        receiver: String,
    },

    /// Rollback could not restore the pre-region state.
    ///
    /// Nothing from the undo log was applied. This is unrecoverable for the
    /// affected entities and distinct from an ordinary rollback.
    #[error("unit of work {unit_of_work} could not be rolled back: {reason}")]
    Inconsistent {
        /// The unit of work whose rollback failed.
        unit_of_work: Uuid,
        /// Which undo record no longer matched the store.
        reason: String,
    },
}

impl SignalError {
    /// Returns true for errors that leave the store in an unknown state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SignalError::Inconsistent { .. })
    }

    /// Returns true for errors raised by a receiver.
    pub fn is_receiver_error(&self) -> bool {
        matches!(
            self,
            SignalError::ReceiverFailed { .. } | SignalError::ReceiverPanicked { .. }
        )
    }
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
