//! Orchestration loop for apply and destroy.
//!
//! apply: graph → load state → plan → for each change: resolve references,
//! converge through the provider or push through the secret store, record the
//! outcome → destroy orphans → save state.
//!
//! State is saved even when a step fails, so everything applied before the
//! failure is remembered.

use super::codegen;
use super::error::{ConnectivityError, Operation, ProviderError, Result, SecretPushError};
use super::planner;
use super::resolver;
use super::retry::{self, Backoff};
use super::state::{self, StateStore};
use super::types::*;
use crate::provider::Provider;
use crate::secrets::{self, SecretStore};
use crate::tripwire::eventlog;
use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;

/// Configuration for an apply run.
pub struct ApplyConfig<'a> {
    pub stack: &'a str,
    pub environment: &'a str,
    pub region: &'a str,
    pub specs: &'a [ResourceSpec],
    pub state: &'a dyn StateStore,
    /// Directory holding `<environment>/events.jsonl`; `None` disables the log
    pub event_dir: Option<&'a Path>,
    pub dry_run: bool,
    /// Resource ids to converge even if unchanged
    pub replace: &'a [String],
    /// Database reachability policy
    pub backoff: Backoff,
}

/// Configuration for a destroy run.
pub struct DestroyConfig<'a> {
    pub stack: &'a str,
    pub environment: &'a str,
    pub region: &'a str,
    pub state: &'a dyn StateStore,
    pub event_dir: Option<&'a Path>,
}

/// Order the specs and diff them against stored state. No provider calls.
pub fn plan(cfg: &ApplyConfig) -> Result<ExecutionPlan> {
    let order = resolver::build_execution_order(cfg.specs)?;
    let lock = cfg.state.load()?;
    Ok(planner::plan(
        cfg.stack,
        cfg.environment,
        cfg.specs,
        &order,
        lock.as_ref(),
        cfg.replace,
    ))
}

/// Execute the apply loop.
pub fn apply(
    cfg: &ApplyConfig,
    provider: &mut dyn Provider,
    store: &mut dyn SecretStore,
) -> Result<ApplyResult> {
    let start = Instant::now();
    let order = resolver::build_execution_order(cfg.specs)?;
    let existing = cfg.state.load()?;
    let plan = planner::plan(
        cfg.stack,
        cfg.environment,
        cfg.specs,
        &order,
        existing.as_ref(),
        cfg.replace,
    );
    tracing::info!(
        create = plan.to_create,
        update = plan.to_update,
        destroy = plan.to_destroy,
        unchanged = plan.unchanged,
        "plan ready"
    );

    if cfg.dry_run {
        return Ok(ApplyResult {
            unchanged: plan.unchanged,
            total_duration: start.elapsed(),
            ..ApplyResult::default()
        });
    }

    let lock = existing.unwrap_or_else(|| state::new_lock(cfg.stack, cfg.environment, cfg.region));
    let mut run = Run::new(cfg, lock);
    run.event(ProvenanceEvent::ApplyStarted {
        environment: cfg.environment.to_string(),
        run_id: run.run_id.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    });

    let outcome = run.execute(&plan, provider, store);

    run.result.total_duration = start.elapsed();
    run.event(ProvenanceEvent::ApplyCompleted {
        environment: cfg.environment.to_string(),
        run_id: run.run_id.clone(),
        mutations: run.result.mutations(),
        unchanged: run.result.unchanged,
        failed: run.failed,
        total_seconds: run.result.total_duration.as_secs_f64(),
    });

    run.lock.generated_at = eventlog::now_iso8601();
    let saved = cfg.state.save(&run.lock);
    match (outcome, saved) {
        (Err(e), saved) => {
            if let Err(save_err) = saved {
                tracing::error!(error = %save_err, "state not saved after failure");
            }
            Err(e)
        }
        (Ok(()), Err(e)) => Err(e.into()),
        (Ok(()), Ok(())) => Ok(run.result),
    }
}

/// Delete every resource recorded in state, dependents first. External
/// secrets are removed from their store.
pub fn destroy(
    cfg: &DestroyConfig,
    provider: &mut dyn Provider,
    store: &mut dyn SecretStore,
) -> Result<DestroyResult> {
    let start = Instant::now();
    let Some(mut lock) = cfg.state.load()? else {
        tracing::info!(state = %cfg.state.describe(), "no state, nothing to destroy");
        return Ok(DestroyResult::default());
    };

    let nodes: Vec<(String, Vec<String>)> = lock
        .resources
        .iter()
        .map(|(id, entry)| (id.clone(), entry.depends_on.clone()))
        .collect();
    let mut order = resolver::order_nodes(&nodes)?;
    order.reverse();

    let mut result = DestroyResult::default();
    let mut failure = None;
    for id in order {
        let Some(entry) = lock.resources.get(&id).cloned() else {
            continue;
        };
        tracing::info!(resource = %id, kind = %entry.kind, name = %entry.name, "destroying");
        if let Err(e) = delete(&id, &entry, provider, store) {
            failure = Some(e);
            break;
        }
        lock.resources.shift_remove(&id);
        log_event(
            cfg.event_dir,
            cfg.environment,
            ProvenanceEvent::ResourceDestroyed {
                environment: cfg.environment.to_string(),
                resource: id.clone(),
            },
        );
        result.destroyed.push(id);
    }

    lock.generated_at = eventlog::now_iso8601();
    let saved = cfg.state.save(&lock);
    if let Some(e) = failure {
        if let Err(save_err) = saved {
            tracing::error!(error = %save_err, "state not saved after failure");
        }
        return Err(e.into());
    }
    saved?;
    result.total_duration = start.elapsed();
    Ok(result)
}

/// Remove the object behind a lock entry.
fn delete(
    id: &str,
    entry: &ResourceLock,
    provider: &mut dyn Provider,
    store: &mut dyn SecretStore,
) -> std::result::Result<(), ProviderError> {
    if entry.kind == ResourceKind::ExternalSecret {
        return store
            .delete(&entry.name)
            .map_err(|message| ProviderError::new(id, Operation::Delete, message));
    }
    provider.delete(id, entry)
}

fn log_event(event_dir: Option<&Path>, environment: &str, event: ProvenanceEvent) {
    if let Some(dir) = event_dir {
        if let Err(e) = eventlog::append_event(dir, environment, event) {
            tracing::warn!(error = %e, "event not recorded");
        }
    }
}

/// Mutable state of one apply run.
struct Run<'a> {
    cfg: &'a ApplyConfig<'a>,
    lock: StateLock,
    outputs: HashMap<String, Outputs>,
    result: ApplyResult,
    failed: u32,
    run_id: String,
}

impl<'a> Run<'a> {
    fn new(cfg: &'a ApplyConfig<'a>, lock: StateLock) -> Self {
        // Unchanged resources contribute their recorded outputs.
        let outputs = lock
            .resources
            .iter()
            .map(|(id, entry)| {
                let recorded = entry
                    .outputs
                    .iter()
                    .map(|(k, v)| (k.clone(), AttrValue::Str(v.clone())))
                    .collect();
                (id.clone(), recorded)
            })
            .collect();
        Self {
            cfg,
            lock,
            outputs,
            result: ApplyResult::default(),
            failed: 0,
            run_id: eventlog::generate_run_id(),
        }
    }

    fn event(&self, event: ProvenanceEvent) {
        log_event(self.cfg.event_dir, self.cfg.environment, event);
    }

    fn execute(
        &mut self,
        plan: &ExecutionPlan,
        provider: &mut dyn Provider,
        store: &mut dyn SecretStore,
    ) -> Result<()> {
        let cfg = self.cfg;
        let specs: HashMap<&str, &ResourceSpec> =
            cfg.specs.iter().map(|s| (s.id.as_str(), s)).collect();

        for change in &plan.changes {
            if change.action == PlanAction::NoOp {
                self.result.unchanged += 1;
                continue;
            }
            self.event(ProvenanceEvent::ResourceStarted {
                environment: self.cfg.environment.to_string(),
                resource: change.resource_id.clone(),
                action: change.action.to_string(),
            });
            tracing::info!(resource = %change.resource_id, "{}", change.description);

            if change.action == PlanAction::Destroy {
                self.destroy_orphan(&change.resource_id, provider, store)?;
                continue;
            }
            let Some(spec) = specs.get(change.resource_id.as_str()) else {
                continue;
            };
            if spec.kind == ResourceKind::ExternalSecret {
                self.push_secret(spec, store)?;
            } else {
                self.converge(spec, change.action, provider)?;
            }
        }
        Ok(())
    }

    fn converge(
        &mut self,
        spec: &ResourceSpec,
        action: PlanAction,
        provider: &mut dyn Provider,
    ) -> Result<()> {
        let started = Instant::now();
        let resolved = match resolver::resolve_references(spec, &self.outputs) {
            Ok(r) => r,
            Err(e) => {
                self.record_failure(spec, started, &e.to_string());
                return Err(e.into());
            }
        };

        if spec.kind.requires_database() {
            if let Err(e) = self.wait_for_database(&resolved, provider) {
                self.record_failure(spec, started, &e.to_string());
                return Err(e.into());
            }
        }

        let converged = match action {
            PlanAction::Create => match provider.read(&resolved) {
                Ok(Some(existing)) => {
                    tracing::info!(resource = %spec.id, "already exists, adopting");
                    provider.update(&resolved, &existing).map(|o| (o, false))
                }
                Ok(None) => provider.create(&resolved).map(|o| (o, true)),
                Err(e) => Err(e),
            },
            _ => match provider.read(&resolved) {
                Ok(Some(mut existing)) => {
                    if let Some(entry) = self.lock.resources.get(&spec.id) {
                        for (k, v) in &entry.outputs {
                            existing.entry(k.clone()).or_insert_with(|| v.clone());
                        }
                    }
                    provider.update(&resolved, &existing).map(|o| (o, false))
                }
                Ok(None) => {
                    tracing::warn!(
                        resource = %spec.id,
                        name = %spec.name,
                        "missing remotely, recreating"
                    );
                    provider.create(&resolved).map(|o| (o, true))
                }
                Err(e) => Err(e),
            },
        };

        match converged {
            Ok((outputs, created)) => {
                if created {
                    self.result.created += 1;
                } else {
                    self.result.updated += 1;
                }
                self.record_success(spec, &resolved, &outputs, started, None);
                self.outputs.insert(spec.id.clone(), outputs);
                Ok(())
            }
            Err(e) => {
                self.record_failure(spec, started, &e.to_string());
                Err(e.into())
            }
        }
    }

    fn wait_for_database(
        &self,
        resolved: &ResourceSpec,
        provider: &mut dyn Provider,
    ) -> std::result::Result<(), ConnectivityError> {
        retry::retry(&self.cfg.backoff, |attempt| {
            tracing::debug!(resource = %resolved.id, attempt, "probing database");
            provider.probe(resolved)
        })
        .map_err(|exhausted| ConnectivityError::UnreachableDatabase {
            resource: resolved.id.clone(),
            operation: Operation::Probe,
            attempts: exhausted.attempts,
            waited_secs: exhausted.waited.as_secs(),
            last_error: exhausted.last_error,
        })
    }

    /// Push the payload if its trigger changed. A failed push is reported,
    /// not fatal.
    fn push_secret(&mut self, spec: &ResourceSpec, store: &mut dyn SecretStore) -> Result<()> {
        let started = Instant::now();
        let resolved = match resolver::resolve_references(spec, &self.outputs) {
            Ok(r) => r,
            Err(e) => {
                self.record_failure(spec, started, &e.to_string());
                return Err(e.into());
            }
        };

        let trigger = secrets::trigger(&resolved);
        let current = self.lock.resources.get(&spec.id);
        if current.is_some_and(|e| {
            e.status == ResourceStatus::Converged
                && e.name == spec.name
                && e.trigger.as_deref() == Some(trigger.as_str())
        }) {
            tracing::debug!(resource = %spec.id, "payload unchanged, push skipped");
            self.record_success(spec, &resolved, &Outputs::new(), started, Some(trigger));
            return Ok(());
        }

        let pushed = secrets::payload(&resolved).and_then(|payload| store.push(&spec.name, &payload));
        match pushed {
            Ok(()) => {
                self.result.secret_pushes += 1;
                self.record_success(spec, &resolved, &Outputs::new(), started, Some(trigger));
                self.event(ProvenanceEvent::SecretPushed {
                    environment: self.cfg.environment.to_string(),
                    resource: spec.id.clone(),
                    store: store.name().to_string(),
                });
            }
            Err(message) => {
                let err = SecretPushError::SecretPushFailed {
                    resource: spec.id.clone(),
                    store: store.name().to_string(),
                    message,
                };
                tracing::warn!(error = %err, "secret push failed; the access key will be rotated on the next apply");
                self.record_failure(spec, started, &err.to_string());
                self.result.warnings.push(err.to_string());
            }
        }
        Ok(())
    }

    fn destroy_orphan(
        &mut self,
        id: &str,
        provider: &mut dyn Provider,
        store: &mut dyn SecretStore,
    ) -> Result<()> {
        let Some(entry) = self.lock.resources.get(id).cloned() else {
            return Ok(());
        };
        delete(id, &entry, provider, store)?;
        self.lock.resources.shift_remove(id);
        self.result.destroyed += 1;
        self.event(ProvenanceEvent::ResourceDestroyed {
            environment: self.cfg.environment.to_string(),
            resource: id.to_string(),
        });
        Ok(())
    }

    fn record_success(
        &mut self,
        spec: &ResourceSpec,
        resolved: &ResourceSpec,
        outputs: &Outputs,
        started: Instant,
        trigger: Option<String>,
    ) {
        self.retire_previous(spec);
        let duration = started.elapsed().as_secs_f64();
        let hash = planner::hash_desired_state(spec);
        let details = resolved
            .attributes
            .iter()
            .filter_map(|(k, v)| v.recordable().map(|text| (k.clone(), text)))
            .collect();
        self.lock.resources.insert(
            spec.id.clone(),
            ResourceLock {
                kind: spec.kind,
                name: spec.name.clone(),
                status: ResourceStatus::Converged,
                applied_at: Some(eventlog::now_iso8601()),
                duration_seconds: Some(duration),
                hash: hash.clone(),
                depends_on: spec.dependencies(),
                outputs: codegen::recordable_outputs(outputs),
                details,
                trigger,
            },
        );
        self.event(ProvenanceEvent::ResourceConverged {
            environment: self.cfg.environment.to_string(),
            resource: spec.id.clone(),
            duration_seconds: duration,
            hash,
        });
    }

    /// Keep the entry of a replaced object under its retired id, so the old
    /// object stays recorded until it is destroyed.
    fn retire_previous(&mut self, spec: &ResourceSpec) {
        let Some(previous) = self.lock.resources.get(&spec.id) else {
            return;
        };
        if previous.name == spec.name {
            return;
        }
        let retired = planner::retired_id(&spec.id, &previous.name);
        tracing::info!(resource = %spec.id, old = %previous.name, new = %spec.name, "replaced");
        let previous = previous.clone();
        self.lock.resources.insert(retired, previous);
    }

    /// Mark the entry failed. Prior identity, outputs and details are kept
    /// so the object can still be found and torn down.
    fn record_failure(&mut self, spec: &ResourceSpec, started: Instant, error: &str) {
        self.failed += 1;
        let duration = started.elapsed().as_secs_f64();
        let previous = self.lock.resources.get(&spec.id);
        let name = previous.map_or_else(|| spec.name.clone(), |e| e.name.clone());
        let outputs = previous.map(|e| e.outputs.clone()).unwrap_or_default();
        let mut details = previous.map(|e| e.details.clone()).unwrap_or_default();
        if name == spec.name {
            for (k, v) in &spec.attributes {
                if let Some(text) = v.recordable() {
                    details.insert(k.clone(), text);
                }
            }
        }
        self.lock.resources.insert(
            spec.id.clone(),
            ResourceLock {
                kind: spec.kind,
                name,
                status: ResourceStatus::Failed,
                applied_at: Some(eventlog::now_iso8601()),
                duration_seconds: Some(duration),
                hash: String::new(),
                depends_on: spec.dependencies(),
                outputs,
                details,
                trigger: None,
            },
        );
        tracing::error!(resource = %spec.id, error, "resource failed");
        self.event(ProvenanceEvent::ResourceFailed {
            environment: self.cfg.environment.to_string(),
            resource: spec.id.clone(),
            error: error.to_string(),
        });
    }
}
