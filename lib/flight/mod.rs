//! Duplicate call suppression.
//!
//! A group forms a namespace in which units of work are executed with duplicate suppression: for
//! any key, at most one execution is in flight at a time. Callers arriving while it runs join it
//! and receive a clone of the same outcome instead of running the work again.
//!
//! Two coordinators share the same contract:
//!
//! - [`Group`] for threads. The leader runs the work on the calling thread (or, for
//!   [`Group::call_detached`], on a spawned thread) and joiners block on a condition variable.
//! - [`AsyncGroup`] for futures. The in-flight work is a [`Shared`](futures::future::Shared)
//!   future cloned to every subscriber.

use std::any::Any;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod blocking;
pub mod future;
pub mod stats;

pub use blocking::{FlightReceiver, Group};
pub use future::{AsyncGroup, FlightHandle};
pub use stats::{FlightStats, StatsSnapshot};

/// Why a call produced no value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError<E> {
    /// The work function returned an error. It is delivered unaltered to every caller.
    #[error("{0}")]
    Work(E),

    /// The work function panicked. Carries the panic message.
    #[error("work function panicked: {0}")]
    Panicked(Arc<str>),

    /// The executor went away without producing a result. Only [`Group`](crate::Group) produces
    /// this, when its detached executor thread fails to start.
    #[error("in-flight call was abandoned before completing")]
    Abandoned,
}

impl<E> CallError<E> {
    /// Returns the work function's own error, if that is what this is.
    pub fn into_work(self) -> Option<E> {
        match self {
            Self::Work(e) => Some(e),
            Self::Panicked(_) | Self::Abandoned => None,
        }
    }

    /// Whether the execution terminated abnormally rather than returning.
    #[must_use]
    pub fn is_abnormal(&self) -> bool {
        !matches!(self, Self::Work(_))
    }
}

/// The result of one execution, as seen by one caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome<V, E> {
    /// The value or error produced by the single execution.
    pub result: Result<V, CallError<E>>,
    /// Whether the result was given to more than one caller.
    pub shared: bool,
}

impl<V, E> Outcome<V, E> {
    /// Split into the `(result, shared)` pair.
    pub fn into_parts(self) -> (Result<V, CallError<E>>, bool) {
        (self.result, self.shared)
    }
}

/// What the leader does when its own work function panics.
///
/// Joiners always receive [`CallError::Panicked`]; this only affects the caller that ran the work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PanicPolicy {
    /// Return [`CallError::Panicked`] to the leader too.
    #[default]
    Deliver,
    /// Re-raise the panic in the leader once every joiner has been released.
    Resume,
}

pub(crate) type WorkResult<V, E> = Result<V, CallError<E>>;

/// Best-effort extraction of a panic payload's message.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> Arc<str> {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        Arc::from(*s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        Arc::from(s.as_str())
    } else {
        Arc::from("Box<dyn Any>")
    }
}
