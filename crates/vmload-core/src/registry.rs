//! Explicitly-owned registry of singleton view-models.
//!
//! The host creates one `ViewModelRegistry` at startup, hands it to whatever
//! needs view-models, and calls `shutdown` on exit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::lock;
use crate::view_model::ViewModel;

#[derive(Debug, Default)]
pub struct ViewModelRegistry {
    view_models: Mutex<HashMap<String, Arc<ViewModel>>>,
}

impl ViewModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the view-model registered under `name`, creating it with
    /// `factory` on first request.
    ///
    /// The factory runs without the registry lock held. If two callers race,
    /// the first insert wins and the other instance is discarded.
    pub fn get_or_create<F>(&self, name: &str, factory: F) -> Arc<ViewModel>
    where
        F: FnOnce() -> ViewModel,
    {
        if let Some(existing) = self.get(name) {
            return existing;
        }
        let created = Arc::new(factory());
        let mut view_models = lock(&self.view_models);
        Arc::clone(view_models.entry(name.to_string()).or_insert(created))
    }

    pub fn get(&self, name: &str) -> Option<Arc<ViewModel>> {
        lock(&self.view_models).get(name).map(Arc::clone)
    }

    /// Removes `name`, canceling its active sessions.
    pub fn remove(&self, name: &str) -> Option<Arc<ViewModel>> {
        let removed = lock(&self.view_models).remove(name);
        if let Some(vm) = &removed {
            vm.cancel_all();
        }
        removed
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.view_models).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        lock(&self.view_models).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.view_models).is_empty()
    }

    /// Cancels every active session of every view-model and empties the
    /// registry.
    pub fn shutdown(&self) {
        let drained: Vec<Arc<ViewModel>> = lock(&self.view_models)
            .drain()
            .map(|(_, vm)| vm)
            .collect();
        tracing::debug!(count = drained.len(), "shutting down view-models");
        for vm in drained {
            vm.cancel_all();
        }
    }
}
