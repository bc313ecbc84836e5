//! `vmload run` and `vmload check`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use futures_util::future::join_all;
use serde_json::json;
use tokio::time::sleep;
use vmload_core::config::Config;
use vmload_core::events::create_event_channel;
use vmload_core::{
    DataExchange, ExchangeCounter, LoadResult, Session, SessionEvent, SessionId, ViewModel,
    ViewModelRegistry,
};

use crate::scenario::{Scenario, SessionSpec};

pub struct RunOptions<'a> {
    pub scenario: &'a Path,
    pub config: &'a Config,
    pub concurrent: bool,
    pub fail_fast: bool,
    pub json: bool,
}

struct Planned<'a> {
    label: String,
    session: Session,
    spec: &'a SessionSpec,
}

pub async fn run(opts: RunOptions<'_>) -> Result<()> {
    let scenario = Scenario::load(opts.scenario)?;
    let exchange = Arc::new(ExchangeCounter::new());
    let registry = ViewModelRegistry::new();
    let vm = registry.get_or_create(&scenario.name, || {
        scenario.build_view_model(Arc::clone(&exchange) as Arc<dyn DataExchange>)
    });

    let (tx, mut rx) = create_event_channel(opts.config.event_channel_capacity);
    vm.observers().forward_to(tx);

    let planned: Vec<Planned<'_>> = scenario
        .sessions
        .iter()
        .enumerate()
        .map(|(i, spec)| Planned {
            label: spec.label(i),
            session: spec.build(opts.config),
            spec,
        })
        .collect();

    let labels: HashMap<SessionId, String> = planned
        .iter()
        .map(|p| (p.session.id(), p.label.clone()))
        .collect();
    let json = opts.json;
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(&labels, &event, json);
        }
    });

    tracing::info!(
        scenario = %scenario.name,
        sessions = planned.len(),
        concurrent = opts.concurrent,
        "running scenario"
    );

    let mut outcomes: Vec<Option<LoadResult>> = Vec::with_capacity(planned.len());
    if opts.concurrent {
        let loads = planned.iter().map(|p| drive(&vm, p));
        outcomes.extend(join_all(loads).await.into_iter().map(Some));
    } else {
        for p in &planned {
            let outcome = drive(&vm, p).await;
            let failed = outcome.is_err();
            outcomes.push(Some(outcome));
            if failed && opts.fail_fast {
                break;
            }
        }
        outcomes.resize_with(planned.len(), || None);
    }

    // Dropping the last view-model handle closes the event channel.
    registry.shutdown();
    drop(vm);
    printer.await?;

    print_summary(&exchange, &planned, &outcomes, opts.json)?;

    if opts.fail_fast {
        let failure = planned
            .iter()
            .zip(&outcomes)
            .find_map(|(p, outcome)| match outcome {
                Some(Err(e)) => Some((p.label.as_str(), e)),
                _ => None,
            });
        if let Some((label, e)) = failure {
            bail!("session '{label}' failed: {e}");
        }
    }
    Ok(())
}

/// Waits for the session's start offset, arms its cancel timer and loads it.
async fn drive(vm: &ViewModel, planned: &Planned<'_>) -> LoadResult {
    let spec = planned.spec;
    if spec.start_after_ms > 0 {
        sleep(Duration::from_millis(spec.start_after_ms)).await;
    }
    if let Some(ms) = spec.cancel_after_ms {
        let session = planned.session.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(ms)).await;
            session.cancel();
        });
    }
    vm.load(&planned.session).await
}

fn print_event(labels: &HashMap<SessionId, String>, event: &SessionEvent, json: bool) {
    let session = match event {
        SessionEvent::Started { session }
        | SessionEvent::Completed { session }
        | SessionEvent::Aborted { session, .. } => *session,
    };
    let label = labels
        .get(&session)
        .cloned()
        .unwrap_or_else(|| session.to_string());

    if json {
        println!("{}", json!({ "label": label, "event": event }));
        return;
    }
    match event {
        SessionEvent::Started { .. } => println!("[{label}] started"),
        SessionEvent::Completed { .. } => println!("[{label}] completed"),
        SessionEvent::Aborted { error: None, .. } => println!("[{label}] aborted: canceled"),
        SessionEvent::Aborted {
            error: Some(error),
            handled,
            ..
        } => {
            let suffix = if *handled { " (handled)" } else { "" };
            println!("[{label}] aborted: {error}{suffix}");
        }
    }
}

fn print_summary(
    exchange: &ExchangeCounter,
    planned: &[Planned<'_>],
    outcomes: &[Option<LoadResult>],
    json: bool,
) -> Result<()> {
    if json {
        let sessions: Vec<_> = planned
            .iter()
            .zip(outcomes)
            .map(|(p, outcome)| {
                let error = match outcome {
                    Some(Err(e)) => Some(e.to_string()),
                    _ => None,
                };
                json!({
                    "label": p.label,
                    "session": p.session.id(),
                    "state": p.session.state(),
                    "skipped": outcome.is_none(),
                    "error": error,
                })
            })
            .collect();
        let summary = json!({
            "type": "summary",
            "exchanges_begun": exchange.begun(),
            "exchanges_ended": exchange.ended(),
            "in_progress": exchange.is_in_progress(),
            "sessions": sessions,
        });
        println!("{}", serde_json::to_string(&summary)?);
        return Ok(());
    }

    println!(
        "summary: exchanges begun={} ended={} in_progress={}",
        exchange.begun(),
        exchange.ended(),
        exchange.is_in_progress()
    );
    for (p, outcome) in planned.iter().zip(outcomes) {
        match outcome {
            None => println!("  {}: skipped", p.label),
            Some(Ok(())) => println!("  {}: {}", p.label, p.session.state()),
            Some(Err(e)) => println!("  {}: {} (failed: {e})", p.label, p.session.state()),
        }
    }
    Ok(())
}

/// Parses and validates a scenario, then lists what it would run.
pub fn check(path: &Path) -> Result<()> {
    let scenario = Scenario::load(path)?;
    println!(
        "{}: {} parts, {} actions, {} sessions",
        scenario.name,
        scenario.parts.len(),
        scenario.actions.len(),
        scenario.sessions.len()
    );
    Ok(())
}
