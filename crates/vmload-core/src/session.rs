//! Load sessions.
//!
//! A `Session` is one load/refresh request directed at a view-model. It is a
//! cheaply-cloneable handle: the caller keeps one clone, the view-model keeps
//! another in its active set while the load is running. Identity is the
//! process-unique `SessionId`, never the session's contents.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::ParameterError;
use crate::lock;
use crate::parts::PartFuture;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl SessionId {
    fn next() -> Self {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Session lifecycle state.
///
/// Transitions only move forward: `Created -> Active -> {Complete | Canceled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Active,
    Complete,
    Canceled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Complete | SessionState::Canceled)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Created => write!(f, "created"),
            SessionState::Active => write!(f, "active"),
            SessionState::Complete => write!(f, "complete"),
            SessionState::Canceled => write!(f, "canceled"),
        }
    }
}

/// Which parts a session asks the view-model to load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PartSelector {
    /// Every part registered as a default part.
    #[default]
    Defaults,
    /// Only the named parts, whether or not they are default parts.
    Only(Vec<String>),
}

impl PartSelector {
    pub fn is_explicit(&self) -> bool {
        matches!(self, PartSelector::Only(_))
    }

    /// Returns true if `id` is named explicitly.
    pub fn names(&self, id: &str) -> bool {
        match self {
            PartSelector::Defaults => false,
            PartSelector::Only(ids) => ids.iter().any(|p| p == id),
        }
    }
}

struct SessionInner {
    id: SessionId,
    exclusive: bool,
    parts: PartSelector,
    entity_key: Option<String>,
    parameters: Mutex<HashMap<String, Value>>,
    state: Mutex<SessionState>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<PartFuture>>,
}

/// Handle to one load request.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Creates a non-exclusive session that loads the default parts.
    pub fn new() -> Self {
        SessionBuilder::default().build()
    }

    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    /// Session loading a whole entity.
    ///
    /// Exclusive: it supersedes any in-flight load on the same view-model.
    pub fn entity(key: impl Into<String>) -> Self {
        SessionBuilder::default().entity(key).exclusive(true).build()
    }

    /// Session loading one named part of an entity.
    ///
    /// Non-exclusive: it may run alongside loads of other parts.
    pub fn entity_part(key: impl Into<String>, part: impl Into<String>) -> Self {
        SessionBuilder::default()
            .entity(key)
            .parts([part])
            .exclusive(false)
            .build()
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn is_exclusive(&self) -> bool {
        self.inner.exclusive
    }

    pub fn parts(&self) -> &PartSelector {
        &self.inner.parts
    }

    pub fn entity_key(&self) -> Option<&str> {
        self.inner.entity_key.as_deref()
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.inner.state)
    }

    /// Returns true once cancellation has been requested.
    pub fn is_canceled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Token that loaders observe to stop work early.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Requests cooperative cancellation.
    ///
    /// Safe to call any number of times. Running work is not aborted; it is
    /// only signalled through the cancellation token. A session that already
    /// completed keeps its `Complete` state.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
        let mut state = lock(&self.inner.state);
        if !state.is_terminal() {
            *state = SessionState::Canceled;
        }
    }

    /// Reads a typed parameter.
    ///
    /// # Errors
    /// `NotFound` if the parameter is missing, `Invalid` if it does not
    /// decode as `T`.
    pub fn parameter<T: DeserializeOwned>(&self, name: &str) -> Result<T, ParameterError> {
        let value = lock(&self.inner.parameters)
            .get(name)
            .cloned()
            .ok_or_else(|| ParameterError::NotFound {
                name: name.to_string(),
            })?;
        serde_json::from_value(value).map_err(|source| ParameterError::Invalid {
            name: name.to_string(),
            source,
        })
    }

    /// Reads a typed parameter, falling back to `default` when it is missing
    /// or does not decode as `T`.
    pub fn parameter_or<T: DeserializeOwned>(&self, name: &str, default: T) -> T {
        self.parameter(name).unwrap_or(default)
    }

    pub fn has_parameter(&self, name: &str) -> bool {
        lock(&self.inner.parameters).contains_key(name)
    }

    /// Sets a parameter; the last write wins.
    pub fn set_parameter(&self, name: impl Into<String>, value: impl Into<Value>) {
        lock(&self.inner.parameters).insert(name.into(), value.into());
    }

    /// Adds a unit of work the session's load must wait for.
    pub fn add_task(&self, task: PartFuture) {
        lock(&self.inner.tasks).push(task);
    }

    /// Number of tasks enqueued but not yet awaited.
    pub fn pending_tasks(&self) -> usize {
        lock(&self.inner.tasks).len()
    }

    pub(crate) fn take_tasks(&self) -> Vec<PartFuture> {
        std::mem::take(&mut *lock(&self.inner.tasks))
    }

    /// `Created -> Active`. Fails for any other state, including a session
    /// canceled before its load started.
    pub(crate) fn activate(&self) -> bool {
        let mut state = lock(&self.inner.state);
        if *state == SessionState::Created && !self.inner.cancel.is_cancelled() {
            *state = SessionState::Active;
            true
        } else {
            false
        }
    }

    pub(crate) fn complete(&self) {
        let mut state = lock(&self.inner.state);
        if !state.is_terminal() {
            *state = SessionState::Complete;
        }
    }

    pub(crate) fn mark_canceled(&self) {
        let mut state = lock(&self.inner.state);
        if !state.is_terminal() {
            *state = SessionState::Canceled;
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("exclusive", &self.inner.exclusive)
            .field("parts", &self.inner.parts)
            .field("entity_key", &self.inner.entity_key)
            .field("state", &self.state())
            .field("pending_tasks", &self.pending_tasks())
            .finish_non_exhaustive()
    }
}

/// Builder for sessions with explicit parts, parameters or exclusivity.
#[derive(Debug, Default)]
pub struct SessionBuilder {
    exclusive: bool,
    parts: PartSelector,
    entity_key: Option<String>,
    parameters: HashMap<String, Value>,
}

impl SessionBuilder {
    #[must_use]
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    /// Restricts the session to the named parts.
    #[must_use]
    pub fn parts<I, S>(mut self, parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parts = PartSelector::Only(parts.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn entity(mut self, key: impl Into<String>) -> Self {
        self.entity_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn build(self) -> Session {
        Session {
            inner: Arc::new(SessionInner {
                id: SessionId::next(),
                exclusive: self.exclusive,
                parts: self.parts,
                entity_key: self.entity_key,
                parameters: Mutex::new(self.parameters),
                state: Mutex::new(SessionState::Created),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }
}
