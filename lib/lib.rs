//! Duplicate function call suppression.
//!
//! Callers name a unit of work with a key. While one execution for a key is in flight, further
//! callers for that key wait for it and share its result instead of running the work again.
//!
//! ```
//! use flightgroup::Group;
//!
//! let group: Group<&str, u64, String> = Group::new();
//! let outcome = group.call("build:target-A", || Ok(42));
//! assert_eq!(outcome.result, Ok(42));
//! assert!(!outcome.shared);
//! ```

/// Group configuration.
pub mod config;
/// Blocking and async deduplicating coordinators.
pub mod flight;
pub mod sync;

pub use config::{ConfigError, GroupConfig};
pub use flight::{
    AsyncGroup, CallError, FlightHandle, FlightReceiver, Group, Outcome, PanicPolicy,
    StatsSnapshot,
};
