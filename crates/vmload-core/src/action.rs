//! Composable action groups.
//!
//! An `ActionGroup` is a tree of parts. Each group runs its direct children
//! either one after another (`Sequential`) or all at once (`Parallel`), with
//! optional initializer and finalizer hooks around them:
//!
//! - sequential: child N+1 is not even started before child N settles
//! - parallel: every child is started before any is awaited; the group
//!   settles once every child has settled, and a genuine failure outranks
//!   sibling cancellations
//! - the initializer settles before any child starts; the finalizer runs
//!   only after every child, nested groups included, has succeeded
//!
//! Group boundaries are cancellation checkpoints: a canceled session stops
//! before the next sequential step and before the finalizer.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::{self, join_all};
use serde::{Deserialize, Serialize};

use crate::error::{LoadError, LoadResult};
use crate::parts::PartFuture;
use crate::session::Session;

/// How a group runs its direct children.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Sequential => write!(f, "sequential"),
            ExecutionMode::Parallel => write!(f, "parallel"),
        }
    }
}

type StepFn = Arc<dyn Fn(&Session, &str) -> LoadResult<Option<PartFuture>> + Send + Sync>;
type HookFn = Arc<dyn Fn(&Session) -> LoadResult<Option<PartFuture>> + Send + Sync>;

#[derive(Clone)]
enum ActionNode {
    Step { id: String, start: StepFn },
    Group(Arc<ActionGroup>),
}

impl ActionNode {
    /// Starts the child; `None`-returning steps settle immediately.
    fn start(&self, session: &Session) -> LoadResult<PartFuture> {
        match self {
            ActionNode::Step { id, start } => {
                tracing::trace!(session = %session.id(), step = %id, "starting step");
                Ok(start(session, id)?.unwrap_or_else(|| future::ok(()).boxed()))
            }
            ActionNode::Group(group) => Ok(group.run(session)),
        }
    }
}

/// A group of steps and nested groups with an execution mode.
#[derive(Clone, Default)]
pub struct ActionGroup {
    mode: ExecutionMode,
    children: Vec<ActionNode>,
    initializer: Option<HookFn>,
    finalizer: Option<HookFn>,
}

impl ActionGroup {
    /// Creates an empty sequential group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty parallel group.
    pub fn new_parallel() -> Self {
        Self::new().parallel()
    }

    /// Runs the direct children one after another.
    #[must_use]
    pub fn sequential(mut self) -> Self {
        self.mode = ExecutionMode::Sequential;
        self
    }

    /// Starts all direct children before awaiting any of them.
    #[must_use]
    pub fn parallel(mut self) -> Self {
        self.mode = ExecutionMode::Parallel;
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Appends a step with a synchronous starter (see [`crate::parts::Loader`]).
    #[must_use]
    pub fn step<F>(mut self, id: impl Into<String>, start: F) -> Self
    where
        F: Fn(&Session, &str) -> LoadResult<Option<PartFuture>> + Send + Sync + 'static,
    {
        self.children.push(ActionNode::Step {
            id: id.into(),
            start: Arc::new(start),
        });
        self
    }

    /// Appends a step backed by an async task.
    #[must_use]
    pub fn task<F, Fut>(self, id: impl Into<String>, task: F) -> Self
    where
        F: Fn(Session, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = LoadResult> + Send + 'static,
    {
        self.step(id, move |session, id| {
            Ok(Some(task(session.clone(), id.to_string()).boxed()))
        })
    }

    /// Appends a nested group.
    #[must_use]
    pub fn group(mut self, group: ActionGroup) -> Self {
        self.children.push(ActionNode::Group(Arc::new(group)));
        self
    }

    /// Sets the hook that settles before any child starts.
    #[must_use]
    pub fn initializer<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Session) -> LoadResult<Option<PartFuture>> + Send + Sync + 'static,
    {
        self.initializer = Some(Arc::new(hook));
        self
    }

    /// Sets the hook that runs after all children succeed.
    #[must_use]
    pub fn finalizer<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Session) -> LoadResult<Option<PartFuture>> + Send + Sync + 'static,
    {
        self.finalizer = Some(Arc::new(hook));
        self
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Number of direct children.
    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Runs the whole tree for `session`.
    pub fn run(self: &Arc<Self>, session: &Session) -> PartFuture {
        let group = Arc::clone(self);
        let session = session.clone();
        async move {
            if let Some(hook) = &group.initializer {
                run_hook(hook, &session).await?;
            }

            match group.mode {
                ExecutionMode::Sequential => {
                    for child in &group.children {
                        ensure_not_canceled(&session)?;
                        child.start(&session)?.await?;
                    }
                }
                ExecutionMode::Parallel => {
                    ensure_not_canceled(&session)?;
                    let started = group
                        .children
                        .iter()
                        .map(|child| child.start(&session))
                        .collect::<LoadResult<Vec<_>>>()?;
                    // Siblings run to completion even after one fails.
                    let failures = join_all(started).await.into_iter().filter_map(Result::err);
                    if let Some(error) = LoadError::aggregate(failures) {
                        return Err(error);
                    }
                }
            }

            if let Some(hook) = &group.finalizer {
                ensure_not_canceled(&session)?;
                run_hook(hook, &session).await?;
            }
            Ok(())
        }
        .boxed()
    }
}

impl fmt::Debug for ActionGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionGroup")
            .field("mode", &self.mode)
            .field("children", &self.children.len())
            .field("initializer", &self.initializer.is_some())
            .field("finalizer", &self.finalizer.is_some())
            .finish()
    }
}

async fn run_hook(hook: &HookFn, session: &Session) -> LoadResult {
    match hook(session)? {
        Some(work) => work.await,
        None => Ok(()),
    }
}

fn ensure_not_canceled(session: &Session) -> LoadResult {
    if session.is_canceled() {
        Err(LoadError::Canceled)
    } else {
        Ok(())
    }
}
