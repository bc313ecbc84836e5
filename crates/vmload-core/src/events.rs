//! Session lifecycle notifications.
//!
//! Observers are plain callbacks, notified synchronously in registration
//! order. `forward_to` bridges them into a channel of serializable
//! `SessionEvent`s for consumers that live on another task.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::LoadError;
use crate::lock;
use crate::session::{Session, SessionId};

/// Default channel capacity for forwarded session events.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 128;

/// Serializable record of a lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The session passed the applicability check and became active.
    Started { session: SessionId },

    /// Every part of the session succeeded.
    Completed { session: SessionId },

    /// The session was canceled (`error` is `None`) or failed.
    Aborted {
        session: SessionId,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// Whether an earlier observer marked the failure handled.
        handled: bool,
    },
}

pub type SessionEventTx = mpsc::Sender<SessionEvent>;
pub type SessionEventRx = mpsc::Receiver<SessionEvent>;

/// Creates a bounded session event channel.
pub fn create_event_channel(capacity: usize) -> (SessionEventTx, SessionEventRx) {
    mpsc::channel(capacity.max(1))
}

/// Payload of the "session aborted" notification.
///
/// Observers may set `handled` to keep a genuine failure from being
/// returned to the caller of `load`.
#[derive(Debug)]
pub struct AbortNotice {
    pub session: Session,
    /// `None` for pure cancellation.
    pub error: Option<LoadError>,
    pub handled: bool,
}

type SessionCallback = Arc<dyn Fn(&Session) + Send + Sync>;
type AbortCallback = Arc<dyn Fn(&mut AbortNotice) + Send + Sync>;

/// Subscriber lists for the three lifecycle notifications.
#[derive(Default)]
pub struct Observers {
    started: Mutex<Vec<SessionCallback>>,
    completed: Mutex<Vec<SessionCallback>>,
    aborted: Mutex<Vec<AbortCallback>>,
}

impl Observers {
    pub fn on_started<F>(&self, f: F)
    where
        F: Fn(&Session) + Send + Sync + 'static,
    {
        lock(&self.started).push(Arc::new(f));
    }

    pub fn on_completed<F>(&self, f: F)
    where
        F: Fn(&Session) + Send + Sync + 'static,
    {
        lock(&self.completed).push(Arc::new(f));
    }

    pub fn on_aborted<F>(&self, f: F)
    where
        F: Fn(&mut AbortNotice) + Send + Sync + 'static,
    {
        lock(&self.aborted).push(Arc::new(f));
    }

    /// Forwards every notification into `tx`.
    ///
    /// Best-effort: events are dropped when the channel is full or closed, so
    /// a slow consumer never stalls a load.
    pub fn forward_to(&self, tx: SessionEventTx) {
        let started_tx = tx.clone();
        self.on_started(move |session| {
            let _ = started_tx.try_send(SessionEvent::Started {
                session: session.id(),
            });
        });
        let completed_tx = tx.clone();
        self.on_completed(move |session| {
            let _ = completed_tx.try_send(SessionEvent::Completed {
                session: session.id(),
            });
        });
        self.on_aborted(move |notice| {
            let _ = tx.try_send(SessionEvent::Aborted {
                session: notice.session.id(),
                error: notice.error.as_ref().map(ToString::to_string),
                handled: notice.handled,
            });
        });
    }

    pub(crate) fn notify_started(&self, session: &Session) {
        for f in snapshot(&self.started) {
            f(session);
        }
    }

    pub(crate) fn notify_completed(&self, session: &Session) {
        for f in snapshot(&self.completed) {
            f(session);
        }
    }

    pub(crate) fn notify_aborted(&self, notice: &mut AbortNotice) {
        for f in snapshot(&self.aborted) {
            f(notice);
        }
    }
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("started", &lock(&self.started).len())
            .field("completed", &lock(&self.completed).len())
            .field("aborted", &lock(&self.aborted).len())
            .finish()
    }
}

/// Clones the subscriber list so callbacks run without the lock held and may
/// subscribe or cancel sessions themselves.
fn snapshot<T: ?Sized>(list: &Mutex<Vec<Arc<T>>>) -> Vec<Arc<T>> {
    lock(list).iter().map(Arc::clone).collect()
}
