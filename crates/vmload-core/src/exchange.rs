//! Data-exchange (busy/idle) notifier.
//!
//! The orchestrator calls `begin_exchange` once for every session that
//! becomes active and `end_exchange` once when it settles, whatever the
//! outcome. `ExchangeGuard` ties the end call to scope exit.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::lock;

/// Collaborator told when loads start and stop exchanging data.
pub trait DataExchange: Send + Sync {
    fn begin_exchange(&self);
    fn end_exchange(&self);
}

#[derive(Debug, Default)]
struct Counts {
    active: usize,
    begun: u64,
    ended: u64,
}

/// Counting `DataExchange` with a derived "in progress" signal.
///
/// The signal flips to `true` on the 0 -> 1 transition and back to `false`
/// on 1 -> 0.
#[derive(Debug)]
pub struct ExchangeCounter {
    counts: Mutex<Counts>,
    in_progress: watch::Sender<bool>,
}

impl ExchangeCounter {
    pub fn new() -> Self {
        let (in_progress, _) = watch::channel(false);
        Self {
            counts: Mutex::new(Counts::default()),
            in_progress,
        }
    }

    pub fn is_in_progress(&self) -> bool {
        *self.in_progress.borrow()
    }

    /// Receiver for the in-progress signal.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.in_progress.subscribe()
    }

    /// Exchanges currently running.
    pub fn active(&self) -> usize {
        lock(&self.counts).active
    }

    /// Total `begin_exchange` calls.
    pub fn begun(&self) -> u64 {
        lock(&self.counts).begun
    }

    /// Total `end_exchange` calls that matched a begin.
    pub fn ended(&self) -> u64 {
        lock(&self.counts).ended
    }
}

impl Default for ExchangeCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl DataExchange for ExchangeCounter {
    fn begin_exchange(&self) {
        let mut counts = lock(&self.counts);
        counts.active += 1;
        counts.begun += 1;
        if counts.active == 1 {
            self.in_progress.send_replace(true);
        }
    }

    fn end_exchange(&self) {
        let mut counts = lock(&self.counts);
        if counts.active == 0 {
            tracing::warn!("end_exchange called without a matching begin_exchange");
            return;
        }
        counts.active -= 1;
        counts.ended += 1;
        if counts.active == 0 {
            self.in_progress.send_replace(false);
        }
    }
}

/// Begins an exchange on creation and ends it on drop.
#[must_use = "the exchange ends when the guard is dropped"]
pub struct ExchangeGuard {
    exchange: Option<Arc<dyn DataExchange>>,
}

impl ExchangeGuard {
    pub fn begin(exchange: Option<Arc<dyn DataExchange>>) -> Self {
        if let Some(exchange) = &exchange {
            exchange.begin_exchange();
        }
        Self { exchange }
    }
}

impl Drop for ExchangeGuard {
    fn drop(&mut self) {
        if let Some(exchange) = self.exchange.take() {
            exchange.end_exchange();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_flips_on_first_begin_and_last_end() {
        let counter = ExchangeCounter::new();
        assert!(!counter.is_in_progress());

        counter.begin_exchange();
        counter.begin_exchange();
        assert!(counter.is_in_progress());
        assert_eq!(counter.active(), 2);

        counter.end_exchange();
        assert!(counter.is_in_progress());
        counter.end_exchange();
        assert!(!counter.is_in_progress());
        assert_eq!((counter.begun(), counter.ended()), (2, 2));
    }

    #[test]
    fn test_unmatched_end_is_ignored() {
        let counter = ExchangeCounter::new();
        counter.end_exchange();
        assert_eq!(counter.active(), 0);
        assert_eq!(counter.ended(), 0);
        assert!(!counter.is_in_progress());
    }

    #[test]
    fn test_guard_ends_on_drop() {
        let counter = Arc::new(ExchangeCounter::new());
        {
            let _guard = ExchangeGuard::begin(Some(Arc::clone(&counter) as Arc<dyn DataExchange>));
            assert!(counter.is_in_progress());
        }
        assert!(!counter.is_in_progress());
        assert_eq!((counter.begun(), counter.ended()), (1, 1));
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions() {
        let counter = ExchangeCounter::new();
        let mut rx = counter.subscribe();

        counter.begin_exchange();
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());

        counter.end_exchange();
        rx.changed().await.unwrap();
        assert!(!*rx.borrow_and_update());
    }
}
