//! View-model load orchestration.
//!
//! `ViewModel::load` drives one session:
//!
//! 1. applicability: no applicable part settles the session as `Complete`
//! 2. exclusivity: an exclusive session cancels and clears every other
//!    active session, then joins the active set and becomes `Active`
//! 3. data exchange begins, "started" observers run (and may cancel)
//! 4. registration phase: loaders of applicable parts start their work
//! 5. fan-in: enqueued tasks are awaited together; failures are collected
//! 6. cleanup (active-set removal, exchange end) always happens before
//!    the outcome is routed
//!
//! The active set is the only state shared between concurrent loads and is
//! guarded by a single mutex. The part registry is frozen at build time.

use std::fmt;
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;

use crate::action::ActionGroup;
use crate::error::{LoadError, LoadResult};
use crate::events::Observers;
use crate::exchange::{DataExchange, ExchangeGuard};
use crate::lock;
use crate::parts::{PartEntry, PartRegistry};
use crate::routing::{self, ErrorHandler};
use crate::session::{Session, SessionId, SessionState};

/// Builder for a `ViewModel`. Parts are registered here and frozen by `build`.
pub struct ViewModelBuilder {
    name: String,
    parts: PartRegistry,
    exchange: Option<Arc<dyn DataExchange>>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
}

impl ViewModelBuilder {
    /// Registers a part; a later registration with the same id wins.
    #[must_use]
    pub fn part(mut self, entry: PartEntry) -> Self {
        self.parts.register(entry);
        self
    }

    /// Registers an action group as a default part.
    #[must_use]
    pub fn action(self, id: impl Into<String>, group: ActionGroup) -> Self {
        self.part(PartEntry::action(id, group))
    }

    #[must_use]
    pub fn exchange(mut self, exchange: Arc<dyn DataExchange>) -> Self {
        self.exchange = Some(exchange);
        self
    }

    #[must_use]
    pub fn error_handler(mut self, handler: impl ErrorHandler + 'static) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> ViewModel {
        ViewModel {
            name: self.name,
            parts: self.parts,
            active: Mutex::new(Vec::new()),
            exchange: self.exchange,
            error_handler: self.error_handler,
            observers: Observers::default(),
        }
    }
}

/// A loadable view-model: a part registry plus the set of active sessions.
pub struct ViewModel {
    name: String,
    parts: PartRegistry,
    active: Mutex<Vec<Session>>,
    exchange: Option<Arc<dyn DataExchange>>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    observers: Observers,
}

impl ViewModel {
    pub fn builder(name: impl Into<String>) -> ViewModelBuilder {
        ViewModelBuilder {
            name: name.into(),
            parts: PartRegistry::new(),
            exchange: None,
            error_handler: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parts(&self) -> &PartRegistry {
        &self.parts
    }

    /// Lifecycle notifications; subscribe at any time.
    pub fn observers(&self) -> &Observers {
        &self.observers
    }

    /// Snapshot of the sessions currently loading.
    pub fn active_sessions(&self) -> Vec<Session> {
        lock(&self.active).clone()
    }

    pub fn is_loading(&self) -> bool {
        !lock(&self.active).is_empty()
    }

    /// Returns true if any registered part applies to `session`.
    pub fn should_load(&self, session: &Session) -> bool {
        self.parts.should_load(session)
    }

    /// Cancels and clears every active session.
    pub fn cancel_all(&self) {
        let drained: Vec<Session> = lock(&self.active).drain(..).collect();
        for session in drained {
            tracing::debug!(view_model = %self.name, session = %session.id(), "canceling session");
            session.cancel();
        }
    }

    /// Loads `session`.
    ///
    /// Returns `Ok` on success, on cancellation and on suppressed failures.
    ///
    /// # Errors
    /// Returns a genuine failure that neither an abort observer nor the error
    /// handler took responsibility for, or a failure if `session` was
    /// already loaded.
    pub async fn load(&self, session: &Session) -> LoadResult {
        match session.state() {
            SessionState::Created => {}
            SessionState::Canceled => {
                tracing::debug!(
                    view_model = %self.name,
                    session = %session.id(),
                    "session canceled before load"
                );
                return Ok(());
            }
            state => return Err(already_loaded(session, state)),
        }

        if !self.parts.should_load(session) {
            tracing::debug!(
                view_model = %self.name,
                session = %session.id(),
                "no applicable parts"
            );
            session.complete();
            return Ok(());
        }

        let Some(entry) = self.enter(session)? else {
            tracing::debug!(
                view_model = %self.name,
                session = %session.id(),
                "session canceled before start"
            );
            return Ok(());
        };

        let outcome = {
            let _entry = entry;
            let _exchange = ExchangeGuard::begin(self.exchange.clone());
            tracing::info!(view_model = %self.name, session = %session.id(), "session started");
            self.observers.notify_started(session);
            self.execute(session).await
        };

        match outcome {
            Ok(()) => {
                session.complete();
                tracing::info!(
                    view_model = %self.name,
                    session = %session.id(),
                    "session complete"
                );
                self.observers.notify_completed(session);
                Ok(())
            }
            Err(error) => routing::route(
                &self.name,
                session,
                error,
                &self.observers,
                self.error_handler.as_deref(),
            ),
        }
    }

    /// Activates `session`, applies the exclusivity rule and adds it to the
    /// active set.
    ///
    /// Returns `None` if the session was canceled before it could start, and
    /// an error if a concurrent `load` activated it first. Other sessions are
    /// only canceled once activation succeeded.
    fn enter(&self, session: &Session) -> LoadResult<Option<ActiveEntry<'_>>> {
        let mut active = lock(&self.active);
        if !session.activate() {
            return match session.state() {
                SessionState::Created | SessionState::Canceled => Ok(None),
                state => Err(already_loaded(session, state)),
            };
        }
        if session.is_exclusive() {
            for other in active.drain(..) {
                tracing::debug!(
                    view_model = %self.name,
                    session = %other.id(),
                    by = %session.id(),
                    "superseded by exclusive session"
                );
                other.cancel();
            }
        }
        active.push(session.clone());
        Ok(Some(ActiveEntry {
            active: &self.active,
            id: session.id(),
        }))
    }

    async fn execute(&self, session: &Session) -> LoadResult {
        if session.is_canceled() {
            return Err(LoadError::Canceled);
        }

        self.parts.start(session)?;

        // Tasks may enqueue further tasks while running.
        loop {
            let tasks = session.take_tasks();
            if tasks.is_empty() {
                break;
            }
            tracing::debug!(session = %session.id(), count = tasks.len(), "awaiting tasks");
            let failures = join_all(tasks).await.into_iter().filter_map(Result::err);
            if let Some(error) = LoadError::aggregate(failures) {
                return Err(error);
            }
        }

        // Work that ignored the token still counts as canceled.
        if session.is_canceled() {
            return Err(LoadError::Canceled);
        }
        Ok(())
    }
}

fn already_loaded(session: &Session, state: SessionState) -> LoadError {
    LoadError::msg(format!(
        "session {} cannot be loaded: already {state}",
        session.id()
    ))
}

impl fmt::Debug for ViewModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewModel")
            .field("name", &self.name)
            .field("parts", &self.parts)
            .field("active", &lock(&self.active).len())
            .field("has_exchange", &self.exchange.is_some())
            .field("has_error_handler", &self.error_handler.is_some())
            .finish_non_exhaustive()
    }
}

/// Removes a session from the active set on drop.
struct ActiveEntry<'a> {
    active: &'a Mutex<Vec<Session>>,
    id: SessionId,
}

impl Drop for ActiveEntry<'_> {
    fn drop(&mut self) {
        lock(self.active).retain(|s| s.id() != self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::time::{Duration, sleep};

    use super::*;
    use crate::events::{SessionEvent, create_event_channel};
    use crate::exchange::ExchangeCounter;

    /// Part that sleeps, honoring cancellation.
    fn delayed(id: &str, ms: u64) -> PartEntry {
        PartEntry::task(id, move |session, _| async move {
            let token = session.cancellation_token();
            tokio::select! {
                () = token.cancelled() => Err(LoadError::Canceled),
                () = sleep(Duration::from_millis(ms)) => Ok(()),
            }
        })
    }

    fn failing(id: &str, message: &'static str) -> PartEntry {
        PartEntry::task(id, move |_, _| async move { Err(LoadError::msg(message)) })
    }

    fn with_counter(builder: ViewModelBuilder) -> (ViewModel, Arc<ExchangeCounter>) {
        let counter = Arc::new(ExchangeCounter::new());
        let vm = builder
            .exchange(Arc::clone(&counter) as Arc<dyn DataExchange>)
            .build();
        (vm, counter)
    }

    #[tokio::test(start_paused = true)]
    async fn test_exclusive_session_cancels_previous() {
        let vm = Arc::new(ViewModel::builder("orders").part(delayed("header", 1_000)).build());
        let a = Session::entity("1");
        let b = Session::entity("2");

        let a_canceled_when_b_started = Arc::new(Mutex::new(None));
        vm.observers().on_started({
            let a = a.clone();
            let b_id = b.id();
            let seen = Arc::clone(&a_canceled_when_b_started);
            move |session| {
                if session.id() == b_id {
                    *seen.lock().unwrap() = Some(a.is_canceled());
                }
            }
        });

        let first = tokio::spawn({
            let vm = Arc::clone(&vm);
            let a = a.clone();
            async move { vm.load(&a).await }
        });
        sleep(Duration::from_millis(10)).await;
        assert_eq!(a.state(), SessionState::Active);

        vm.load(&b).await.unwrap();
        first.await.unwrap().unwrap();

        assert_eq!(a.state(), SessionState::Canceled);
        assert_eq!(b.state(), SessionState::Complete);
        assert_eq!(*a_canceled_when_b_started.lock().unwrap(), Some(true));
        assert!(!vm.is_loading());
    }

    #[tokio::test(start_paused = true)]
    async fn test_losing_activation_race_reports_error_without_canceling_others() {
        let vm = Arc::new(ViewModel::builder("orders").part(delayed("header", 1_000)).build());
        let other = Session::new();
        let running = tokio::spawn({
            let vm = Arc::clone(&vm);
            let other = other.clone();
            async move { vm.load(&other).await }
        });
        sleep(Duration::from_millis(10)).await;

        // A concurrent load already activated this session.
        let session = Session::entity("1");
        assert!(session.activate());
        let err = vm.enter(&session).err().unwrap();
        assert_eq!(
            err.to_string(),
            format!("session {} cannot be loaded: already active", session.id())
        );
        assert!(!other.is_canceled());
        assert_eq!(vm.active_sessions().len(), 1);

        running.await.unwrap().unwrap();
        assert_eq!(other.state(), SessionState::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_genuine_failure_in_parallel_action_is_not_swallowed() {
        let group = ActionGroup::new_parallel()
            .task("canceled", |_, _| async { Err(LoadError::Canceled) })
            .task("disk", |_, _| async {
                sleep(Duration::from_millis(10)).await;
                Err(LoadError::msg("disk full"))
            });
        let vm = ViewModel::builder("orders").action("refresh", group).build();
        let session = Session::new();

        let err = vm.load(&session).await.unwrap_err();
        assert_eq!(err.to_string(), "disk full");
        assert_eq!(session.state(), SessionState::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_exclusive_sessions_overlap() {
        let vm = Arc::new(
            ViewModel::builder("orders")
                .part(delayed("x", 100))
                .part(delayed("y", 100))
                .build(),
        );
        let a = Session::entity_part("1", "x");
        let b = Session::entity_part("1", "y");

        let (ra, rb, overlapped) = tokio::join!(vm.load(&a), vm.load(&b), async {
            sleep(Duration::from_millis(50)).await;
            vm.active_sessions().len()
        });
        ra.unwrap();
        rb.unwrap();
        assert_eq!(overlapped, 2);
        assert_eq!(a.state(), SessionState::Complete);
        assert_eq!(b.state(), SessionState::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_parts_and_checkers() {
        let ran = Arc::new(Mutex::new(Vec::new()));
        let record = |id: &str| {
            let ran = Arc::clone(&ran);
            PartEntry::new(id, move |_, id| {
                ran.lock().unwrap().push(id.to_string());
                Ok(None)
            })
        };
        let vm = ViewModel::builder("orders")
            .part(record("header"))
            .part(record("lines").default_part(false))
            .part(record("customer").with_checker(|s, _| s.has_parameter("customer")))
            .build();

        vm.load(&Session::new()).await.unwrap();
        assert_eq!(*ran.lock().unwrap(), vec!["header"]);
    }

    #[tokio::test]
    async fn test_nothing_applicable_completes_immediately() {
        let started = Arc::new(AtomicUsize::new(0));
        let (vm, counter) = with_counter(
            ViewModel::builder("orders").part(delayed("lines", 10).default_part(false)),
        );
        let seen = Arc::clone(&started);
        vm.observers().on_started(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let session = Session::new();
        vm.load(&session).await.unwrap();
        assert_eq!(session.state(), SessionState::Complete);
        assert_eq!(started.load(Ordering::SeqCst), 0);
        assert_eq!(counter.begun(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_synchronous_parts_complete() {
        let vm = ViewModel::builder("orders")
            .part(PartEntry::new("none", |_, _| Ok(None)))
            .part(PartEntry::task("ready", |_, _| async { Ok(()) }))
            .part(delayed("slow", 100))
            .build();
        let session = Session::new();
        vm.load(&session).await.unwrap();
        assert_eq!(session.state(), SessionState::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_action_group_as_part() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let step = |name: &'static str, ms: u64| {
            let order = Arc::clone(&order);
            move |_: Session, _: String| {
                let order = Arc::clone(&order);
                async move {
                    sleep(Duration::from_millis(ms)).await;
                    order.lock().unwrap().push(name);
                    Ok::<(), LoadError>(())
                }
            }
        };
        let group = ActionGroup::new()
            .task("load", step("load", 200))
            .group(
                ActionGroup::new_parallel()
                    .task("a", step("a", 50))
                    .task("b", step("b", 10)),
            );
        let vm = ViewModel::builder("orders").action("refresh", group).build();

        vm.load(&Session::builder().parts(["refresh"]).build())
            .await
            .unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["load", "b", "a"]);
    }

    #[tokio::test]
    async fn test_handled_flag_suppresses_failure() {
        let vm = ViewModel::builder("orders").part(failing("header", "boom")).build();
        vm.observers().on_aborted(|notice| notice.handled = true);

        let session = Session::new();
        vm.load(&session).await.unwrap();
        assert_eq!(session.state(), SessionState::Complete);
    }

    #[tokio::test]
    async fn test_unhandled_failure_is_returned() {
        let vm = ViewModel::builder("orders").part(failing("header", "boom")).build();
        let aborted = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&aborted);
        vm.observers().on_aborted(move |notice| {
            assert_eq!(notice.error.as_ref().map(ToString::to_string).as_deref(), Some("boom"));
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let err = vm.load(&Session::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert_eq!(aborted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_error_handler_suppresses_failure() {
        let vm = ViewModel::builder("orders")
            .part(failing("header", "boom"))
            .error_handler(|owner: &str, _: &Session, _: &LoadError| owner == "orders")
            .build();
        vm.load(&Session::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_registration_failure_routes_and_cleans_up() {
        let (vm, counter) = with_counter(
            ViewModel::builder("orders")
                .part(PartEntry::new("broken", |_, _| Err(LoadError::msg("bad loader")))),
        );
        let err = vm.load(&Session::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "bad loader");
        assert!(!vm.is_loading());
        assert!(!counter.is_in_progress());
        assert_eq!((counter.begun(), counter.ended()), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_canceled_failures_are_cancellation() {
        let vm = ViewModel::builder("orders")
            .part(delayed("a", 1_000))
            .part(delayed("b", 1_000))
            .part(PartEntry::new("cancel", |session, _| {
                session.cancel();
                Ok(None)
            }))
            .build();
        let (tx, mut rx) = create_event_channel(8);
        vm.observers().forward_to(tx);

        let session = Session::new();
        vm.load(&session).await.unwrap();
        assert_eq!(session.state(), SessionState::Canceled);

        assert!(matches!(rx.recv().await, Some(SessionEvent::Started { .. })));
        assert_eq!(
            rx.recv().await,
            Some(SessionEvent::Aborted {
                session: session.id(),
                error: None,
                handled: false,
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_mixed_failures_surface_genuine_error() {
        let vm = ViewModel::builder("orders")
            .part(PartEntry::task("canceled", |_, _| async { Err(LoadError::Canceled) }))
            .part(failing("real", "disk full"))
            .build();
        let err = vm.load(&Session::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "disk full");
    }

    #[tokio::test]
    async fn test_started_observer_can_cancel_before_work() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let (vm, exchange) = with_counter(ViewModel::builder("orders").part(PartEntry::new(
            "header",
            move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            },
        )));
        vm.observers().on_started(Session::cancel);

        let session = Session::new();
        vm.load(&session).await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(session.state(), SessionState::Canceled);
        assert_eq!((exchange.begun(), exchange.ended()), (1, 1));
        assert!(!vm.is_loading());
    }

    #[tokio::test]
    async fn test_pre_canceled_session_is_not_started() {
        let (vm, exchange) = with_counter(ViewModel::builder("orders").part(delayed("a", 10)));
        let session = Session::new();
        session.cancel();
        vm.load(&session).await.unwrap();
        assert_eq!(exchange.begun(), 0);
        assert_eq!(session.state(), SessionState::Canceled);
    }

    #[tokio::test]
    async fn test_completed_session_cannot_be_reloaded() {
        let vm = ViewModel::builder("orders").part(delayed("a", 0)).build();
        let session = Session::new();
        vm.load(&session).await.unwrap();
        let err = vm.load(&session).await.unwrap_err();
        assert!(err.to_string().contains("already complete"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exchange_counter_balances_across_outcomes() {
        let (vm, counter) = with_counter(
            ViewModel::builder("orders")
                .part(delayed("ok", 100))
                .part(failing("bad", "boom").default_part(false))
                .part(delayed("slow", 1_000).default_part(false)),
        );
        vm.observers().on_aborted(|notice| {
            if notice.session.parameter_or("suppress", false) {
                notice.handled = true;
            }
        });
        let vm = Arc::new(vm);
        assert!(!counter.is_in_progress());

        vm.load(&Session::new()).await.unwrap();
        vm.load(&Session::builder().parts(["bad"]).parameter("suppress", true).build())
            .await
            .unwrap();
        vm.load(&Session::builder().parts(["bad"]).build())
            .await
            .unwrap_err();

        let slow = Session::builder().parts(["slow"]).build();
        let pending = tokio::spawn({
            let vm = Arc::clone(&vm);
            let slow = slow.clone();
            async move { vm.load(&slow).await }
        });
        sleep(Duration::from_millis(10)).await;
        assert!(counter.is_in_progress());
        slow.cancel();
        pending.await.unwrap().unwrap();

        assert_eq!(counter.begun(), 4);
        assert_eq!(counter.ended(), 4);
        assert!(!counter.is_in_progress());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_clears_active_set() {
        let vm = Arc::new(
            ViewModel::builder("orders")
                .part(delayed("x", 1_000).default_part(false))
                .part(delayed("y", 1_000).default_part(false))
                .build(),
        );
        let a = Session::entity_part("1", "x");
        let b = Session::entity_part("1", "y");
        let loads = tokio::spawn({
            let vm = Arc::clone(&vm);
            let (a, b) = (a.clone(), b.clone());
            async move {
                let (ra, rb) = tokio::join!(vm.load(&a), vm.load(&b));
                ra.and(rb)
            }
        });
        sleep(Duration::from_millis(10)).await;
        assert_eq!(vm.active_sessions().len(), 2);

        vm.cancel_all();
        assert!(!vm.is_loading());
        loads.await.unwrap().unwrap();
        assert_eq!(a.state(), SessionState::Canceled);
        assert_eq!(b.state(), SessionState::Canceled);
    }

    #[tokio::test]
    async fn test_part_replacement_runs_only_latest_loader() {
        let ran = Arc::new(Mutex::new(Vec::new()));
        let part = |label: &'static str| {
            let ran = Arc::clone(&ran);
            PartEntry::new("p", move |_, _| {
                ran.lock().unwrap().push(label);
                Ok(None)
            })
        };
        let vm = ViewModel::builder("orders")
            .part(part("base"))
            .part(part("derived"))
            .build();
        vm.load(&Session::new()).await.unwrap();
        assert_eq!(*ran.lock().unwrap(), vec!["derived"]);
    }
}
