//! Session and part-loading orchestration for view-models.
//!
//! - `session`: load requests, parameters, cancellation and state
//! - `parts`: part registry and applicability rules
//! - `action`: sequential/parallel action groups
//! - `view_model`: the `load` orchestrator and its active-session set
//! - `routing`: cancellation vs. failure routing and the error handler hook
//! - `exchange`: busy/idle data-exchange counter
//! - `events`: lifecycle observers and event forwarding
//! - `registry`: explicitly-owned singleton view-model registry
//! - `config`: TOML configuration

pub mod action;
pub mod config;
pub mod error;
pub mod events;
pub mod exchange;
pub mod parts;
pub mod registry;
pub mod routing;
pub mod session;
pub mod view_model;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use action::{ActionGroup, ExecutionMode};
pub use error::{LoadError, LoadResult, ParameterError};
pub use events::{AbortNotice, Observers, SessionEvent};
pub use exchange::{DataExchange, ExchangeCounter, ExchangeGuard};
pub use parts::{PartEntry, PartFuture, PartRegistry};
pub use registry::ViewModelRegistry;
pub use routing::ErrorHandler;
pub use session::{PartSelector, Session, SessionBuilder, SessionId, SessionState};
pub use view_model::{ViewModel, ViewModelBuilder};

/// Locks `mutex`, recovering the data if a previous holder panicked.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
