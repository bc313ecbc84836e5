//! Part registry and applicability rules.
//!
//! A part is a named unit of loading work. Registration stores an entry per
//! id; registering the same id again replaces the earlier entry in place,
//! which is how a derived view-model overrides a base part.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;

use crate::action::ActionGroup;
use crate::error::LoadResult;
use crate::session::Session;

/// In-flight asynchronous work started by a loader.
pub type PartFuture = BoxFuture<'static, LoadResult>;

/// Starts a part's work.
///
/// Runs synchronously during the registration phase and only returns a handle
/// to the started work (`None` when there is nothing to wait for). An error
/// returned here aborts the whole session load.
pub type Loader = Arc<dyn Fn(&Session, &str) -> LoadResult<Option<PartFuture>> + Send + Sync>;

/// Decides whether an otherwise-selected part should run for a session.
///
/// Must be free of side effects: it is evaluated more than once per load.
pub type Checker = Arc<dyn Fn(&Session, &str) -> bool + Send + Sync>;

/// One registered part.
#[derive(Clone)]
pub struct PartEntry {
    id: String,
    loader: Loader,
    checker: Option<Checker>,
    default: bool,
}

impl PartEntry {
    /// Creates a default part from a synchronous loader.
    pub fn new<F>(id: impl Into<String>, loader: F) -> Self
    where
        F: Fn(&Session, &str) -> LoadResult<Option<PartFuture>> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            loader: Arc::new(loader),
            checker: None,
            default: true,
        }
    }

    /// Creates a default part whose loader starts an async task.
    pub fn task<F, Fut>(id: impl Into<String>, task: F) -> Self
    where
        F: Fn(Session, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = LoadResult> + Send + 'static,
    {
        Self::new(id, move |session, id| {
            Ok(Some(task(session.clone(), id.to_string()).boxed()))
        })
    }

    /// Creates a default part that runs an action group.
    pub fn action(id: impl Into<String>, group: ActionGroup) -> Self {
        let group = Arc::new(group);
        Self::new(id, move |session, _| Ok(Some(group.run(session))))
    }

    #[must_use]
    pub fn with_checker<F>(mut self, checker: F) -> Self
    where
        F: Fn(&Session, &str) -> bool + Send + Sync + 'static,
    {
        self.checker = Some(Arc::new(checker));
        self
    }

    /// Sets whether the part runs for sessions that do not name parts.
    #[must_use]
    pub fn default_part(mut self, default: bool) -> Self {
        self.default = default;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_default(&self) -> bool {
        self.default
    }

    /// Returns true if this part should run for `session`.
    ///
    /// The part must be selected (named explicitly, or a default part when the
    /// session names none) and its checker, if any, must accept it.
    pub fn is_applicable(&self, session: &Session) -> bool {
        let selected = if session.parts().is_explicit() {
            session.parts().names(&self.id)
        } else {
            self.default
        };
        selected
            && self
                .checker
                .as_ref()
                .is_none_or(|check| check(session, &self.id))
    }

    fn start(&self, session: &Session) -> LoadResult<Option<PartFuture>> {
        (self.loader)(session, &self.id)
    }
}

impl fmt::Debug for PartEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartEntry")
            .field("id", &self.id)
            .field("default", &self.default)
            .field("has_checker", &self.checker.is_some())
            .finish_non_exhaustive()
    }
}

/// Per-view-model table of parts, in registration order.
#[derive(Debug, Clone, Default)]
pub struct PartRegistry {
    entries: Vec<PartEntry>,
}

impl PartRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the entry, replacing any earlier entry with the same id.
    pub fn register(&mut self, entry: PartEntry) {
        if let Some(existing) = self.entries.iter_mut().find(|e| e.id == entry.id) {
            tracing::debug!(part = %entry.id, "replacing registered part");
            *existing = entry;
        } else {
            self.entries.push(entry);
        }
    }

    pub fn get(&self, id: &str) -> Option<&PartEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.id.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns true if any part applies to `session`.
    pub fn should_load(&self, session: &Session) -> bool {
        self.entries.iter().any(|e| e.is_applicable(session))
    }

    /// Runs the loader of every applicable part and enqueues the started
    /// work on the session.
    ///
    /// # Errors
    /// Returns the first loader error; parts after it are not started.
    pub fn start(&self, session: &Session) -> LoadResult {
        for entry in self.entries.iter().filter(|e| e.is_applicable(session)) {
            tracing::debug!(session = %session.id(), part = %entry.id, "starting part");
            if let Some(task) = entry.start(session)? {
                session.add_task(task);
            }
        }
        Ok(())
    }
}
