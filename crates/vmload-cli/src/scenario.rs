//! Scenario files: a simulated view-model plus the sessions to run against it.
//!
//! ```toml
//! name = "orders"
//!
//! [[parts]]
//! id = "header"
//! delay_ms = 100
//!
//! [[actions]]
//! id = "refresh"
//! mode = "parallel"
//! default = false
//!
//! [[actions.steps]]
//! id = "totals"
//! delay_ms = 50
//!
//! [[sessions]]
//! label = "first"
//! entity = "42"
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde_json::Value;
use vmload_core::config::Config;
use vmload_core::{
    ActionGroup, DataExchange, ExecutionMode, LoadError, LoadResult, PartEntry, Session,
    ViewModel,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    #[serde(default = "default_name")]
    pub name: String,

    /// Marks every failure handled from an abort observer.
    #[serde(default)]
    pub handle_errors: bool,

    #[serde(default)]
    pub parts: Vec<PartSpec>,

    #[serde(default)]
    pub actions: Vec<ActionSpec>,

    #[serde(default)]
    pub sessions: Vec<SessionSpec>,
}

fn default_name() -> String {
    "scenario".to_string()
}

fn default_true() -> bool {
    true
}

/// A simulated part: sleeps for `delay_ms`, then succeeds or fails.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartSpec {
    pub id: String,
    #[serde(default)]
    pub delay_ms: u64,
    /// Failure message; the part succeeds when absent.
    pub fail: Option<String>,
    #[serde(default = "default_true")]
    pub default: bool,
    /// Only run when the session carries this parameter.
    pub requires_param: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionSpec {
    pub id: String,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default = "default_true")]
    pub default: bool,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StepSpec {
    Group(GroupSpec),
    Step(SimulatedStep),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupSpec {
    #[serde(default)]
    pub mode: ExecutionMode,
    pub steps: Vec<StepSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimulatedStep {
    pub id: String,
    #[serde(default)]
    pub delay_ms: u64,
    pub fail: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionSpec {
    pub label: Option<String>,
    /// Entity key; makes this an entity session.
    pub entity: Option<String>,
    /// Explicit parts; default parts run when absent.
    pub parts: Option<Vec<String>>,
    /// Overrides the exclusivity derived from `entity`/`parts`.
    pub exclusive: Option<bool>,
    #[serde(default)]
    pub start_after_ms: u64,
    pub cancel_after_ms: Option<u64>,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario from {}", path.display()))?;
        let scenario: Scenario = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse scenario from {}", path.display()))?;
        scenario.validate()?;
        Ok(scenario)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        let ids = self.parts.iter().map(|p| &p.id);
        for id in ids.chain(self.actions.iter().map(|a| &a.id)) {
            if !seen.insert(id.as_str()) {
                bail!("duplicate part id '{id}'");
            }
        }
        for session in &self.sessions {
            for part in session.parts.iter().flatten() {
                if !seen.contains(part.as_str()) {
                    bail!("session requests unknown part '{part}'");
                }
            }
        }
        Ok(())
    }

    /// Builds the simulated view-model.
    pub fn build_view_model(&self, exchange: Arc<dyn DataExchange>) -> ViewModel {
        let mut builder = ViewModel::builder(self.name.clone()).exchange(exchange);
        for part in &self.parts {
            builder = builder.part(part.to_entry());
        }
        for action in &self.actions {
            let group = build_group(action.mode, &action.steps);
            builder =
                builder.part(PartEntry::action(&action.id, group).default_part(action.default));
        }
        let vm = builder.build();
        if self.handle_errors {
            vm.observers().on_aborted(|notice| notice.handled = true);
        }
        vm
    }
}

impl PartSpec {
    fn to_entry(&self) -> PartEntry {
        let delay = Duration::from_millis(self.delay_ms);
        let fail = self.fail.clone();
        let entry = PartEntry::task(&self.id, move |session, id| {
            simulate(session, id, delay, fail.clone())
        })
        .default_part(self.default);
        match &self.requires_param {
            Some(param) => {
                let param = param.clone();
                entry.with_checker(move |session, _| session.has_parameter(&param))
            }
            None => entry,
        }
    }
}

impl SessionSpec {
    pub fn label(&self, index: usize) -> String {
        self.label
            .clone()
            .unwrap_or_else(|| format!("session-{}", index + 1))
    }

    pub fn build(&self, config: &Config) -> Session {
        let mut builder = match &self.entity {
            Some(entity) => config.entity_session(entity),
            None => Session::builder(),
        };
        // Narrowed to named parts, it no longer supersedes other loads.
        if let Some(parts) = &self.parts {
            builder = builder.parts(parts.iter().cloned()).exclusive(false);
        }
        if let Some(exclusive) = self.exclusive {
            builder = builder.exclusive(exclusive);
        }
        for (name, value) in &self.params {
            builder = builder.parameter(name, value.clone());
        }
        builder.build()
    }
}

fn build_group(mode: ExecutionMode, steps: &[StepSpec]) -> ActionGroup {
    steps
        .iter()
        .fold(ActionGroup::new().with_mode(mode), |group, step| match step {
            StepSpec::Group(nested) => group.group(build_group(nested.mode, &nested.steps)),
            StepSpec::Step(step) => {
                let delay = Duration::from_millis(step.delay_ms);
                let fail = step.fail.clone();
                group.task(&step.id, move |session, id| {
                    simulate(session, id, delay, fail.clone())
                })
            }
        })
}

async fn simulate(
    session: Session,
    id: String,
    delay: Duration,
    fail: Option<String>,
) -> LoadResult {
    let token = session.cancellation_token();
    tokio::select! {
        () = token.cancelled() => {
            tracing::debug!(session = %session.id(), part = %id, "part canceled");
            return Err(LoadError::Canceled);
        }
        () = tokio::time::sleep(delay) => {}
    }
    if let Some(message) = fail {
        return Err(LoadError::msg(format!("part '{id}' failed: {message}")));
    }
    tracing::info!(session = %session.id(), part = %id, "part loaded");
    Ok(())
}
