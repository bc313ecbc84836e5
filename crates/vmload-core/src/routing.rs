//! Failure routing for settled sessions.
//!
//! Cancellation is reported and swallowed. A genuine failure is reported to
//! the abort observers first; it is suppressed if an observer marked it
//! handled or the error handler accepts it, and returned to the caller
//! otherwise.

use crate::error::{LoadError, LoadResult};
use crate::events::{AbortNotice, Observers};
use crate::session::Session;

/// Collaborator offered every genuine failure no observer handled.
pub trait ErrorHandler: Send + Sync {
    /// Returns true to take responsibility for `error`.
    fn handle(&self, owner: &str, session: &Session, error: &LoadError) -> bool;
}

impl<F> ErrorHandler for F
where
    F: Fn(&str, &Session, &LoadError) -> bool + Send + Sync,
{
    fn handle(&self, owner: &str, session: &Session, error: &LoadError) -> bool {
        self(owner, session, error)
    }
}

/// Settles `session` after `error` and decides whether to rethrow it.
pub(crate) fn route(
    owner: &str,
    session: &Session,
    error: LoadError,
    observers: &Observers,
    handler: Option<&dyn ErrorHandler>,
) -> LoadResult {
    if error.is_canceled() {
        session.mark_canceled();
        tracing::debug!(view_model = owner, session = %session.id(), "session canceled");
        observers.notify_aborted(&mut AbortNotice {
            session: session.clone(),
            error: None,
            handled: false,
        });
        return Ok(());
    }

    session.complete();
    let mut notice = AbortNotice {
        session: session.clone(),
        error: Some(error.clone()),
        handled: false,
    };
    observers.notify_aborted(&mut notice);
    if notice.handled {
        tracing::debug!(
            view_model = owner,
            session = %session.id(),
            error = %error,
            "failure handled by observer"
        );
        return Ok(());
    }

    if handler.is_some_and(|h| h.handle(owner, session, &error)) {
        tracing::debug!(
            view_model = owner,
            session = %session.id(),
            error = %error,
            "failure handled by error handler"
        );
        return Ok(());
    }

    tracing::warn!(view_model = owner, session = %session.id(), error = %error, "session failed");
    Err(error)
}
