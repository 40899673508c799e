//! One full sync pass: read every machine's notes, find every machine, plan, and apply.
//!
//! The pass runs in stages, each finishing for every machine before the next begins:
//!
//! 1. List machines. Failure aborts the run.
//! 2. Read and parse each machine's notes, encrypting plaintext secrets in place when a key is
//!    configured. A machine whose notes cannot be read is skipped with a warning.
//! 3. List the broker's connections. Failure aborts the run.
//! 4. Resolve the address of every machine that has at least one directive. Addresses the broker
//!    already holds seed the resolver's cache.
//! 5. Build the desired connections and diff them against the broker's, one machine at a time.
//! 6. Apply the plan, unless this is a dry run.
//!
//! Cancellation during resolution ends the pass with nothing applied. Cancellation while applying
//! leaves the applied actions in place and reports the rest as skipped.

use crate::config::Config;
use crate::core::directive::{parse_annotation, Annotation, USERNAME};
use crate::core::machine::{ActualConnection, MachineId, MachineRecord};
use crate::core::plan::{
    diff_machine, DiffInput, DiffOptions, MachinePlan, ReconciliationPlan, SkippedRecord,
};
use crate::core::spec::{build_specs, MachineContext};
use crate::crypto::{SecretCodec, SecretError};
use crate::network::probe::Probe;
use crate::network::resolver::Resolver;
use crate::network::wake::WakeTransmitter;
use crate::network::{Cancelled, LocationCache, MachineLocation};
use crate::platform::{Broker, Virtualization};
use crate::run_plan::report::Report;
use crate::run_plan::{Executor, MachineResults};
use anyhow::Context;
use serde::Serialize;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What a sync pass planned and did.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SyncReport {
    pub plan: ReconciliationPlan,
    /// Empty for a dry run or a pass cancelled before applying.
    pub results: Vec<MachineResults>,
    /// Problems that skipped part of a machine's notes or a whole machine.
    pub warnings: Vec<String>,
    /// Machines whose notes were rewritten with encrypted secrets.
    pub migrated: Vec<MachineId>,
    pub cancelled: bool,
}

impl SyncReport {
    pub fn failures(&self) -> usize {
        self.results.iter().map(MachineResults::failures).sum()
    }
}

/// A configured sync pass and its collaborators.
pub struct Session<R: Report> {
    config: Config,
    codec: Arc<SecretCodec>,
    platform: Arc<dyn Virtualization>,
    broker: Arc<dyn Broker>,
    resolver: Arc<Resolver>,
    executor: Executor<R>,
    hostname: String,
    cancel: CancellationToken,
}

impl<R: Report + Clone> Session<R> {
    /// Wires up a session.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured encryption key is unusable. Nothing should run with a
    /// bad key, since every encrypted secret would fail to decrypt.
    pub fn new(
        config: Config,
        platform: Arc<dyn Virtualization>,
        broker: Arc<dyn Broker>,
        probe: Arc<dyn Probe>,
        wake: Arc<dyn WakeTransmitter>,
        reporter: R,
        cancel: CancellationToken,
    ) -> Result<Self, SecretError> {
        let codec = Arc::new(SecretCodec::new(config.encryption_key.as_deref())?);
        let resolver = Arc::new(Resolver::new(
            probe,
            platform.clone(),
            config.resolver.options(),
        ));
        let executor = Executor {
            broker: broker.clone(),
            platform: platform.clone(),
            wake,
            codec: codec.clone(),
            reporter,
        };
        let hostname = controller_hostname(config.sync.hostname.as_deref());
        Ok(Self {
            config,
            codec,
            platform,
            broker,
            resolver,
            executor,
            hostname,
            cancel,
        })
    }

    pub async fn run(&self) -> anyhow::Result<SyncReport> {
        let mut report = SyncReport::default();

        let machines = self
            .platform
            .list_machines()
            .await
            .context("failed to list machines")?;
        info!(machines = machines.len(), "listed machines");

        let mut notes = Vec::with_capacity(machines.len());
        for machine in machines {
            match self.read_notes(&machine, &mut report).await {
                Ok(annotation) => notes.push((machine, annotation)),
                Err(e) => {
                    warn!(machine = %machine.id, "skipping machine: {e:#}");
                    report
                        .warnings
                        .push(format!("{}: skipped: {e:#}", machine.id));
                }
            }
        }

        let connections = self
            .broker
            .list_connections()
            .await
            .context("failed to list broker connections")?;
        debug!(connections = connections.len(), "listed broker connections");

        let to_resolve: Vec<MachineRecord> = notes
            .iter()
            .filter(|(_, annotation)| !annotation.records.is_empty())
            .map(|(machine, _)| machine.clone())
            .collect();
        let resolved = self
            .resolver
            .resolve_all(
                to_resolve,
                Arc::new(seed_cache(&connections)),
                self.config.resolver.workers,
                &self.cancel,
            )
            .await;
        let mut locations: HashMap<MachineId, MachineLocation> = match resolved {
            Ok(locations) => locations.into_iter().collect(),
            Err(Cancelled) => {
                info!("cancelled while resolving addresses; nothing was applied");
                report.cancelled = true;
                return Ok(report);
            }
        };

        for (machine, annotation) in notes.iter() {
            let location = locations
                .remove(&machine.id)
                .unwrap_or_else(|| MachineLocation::unresolved(None));
            let plan = self.plan_machine(
                machine,
                annotation,
                &location,
                &connections,
                &mut report.warnings,
            );
            report.plan.machines.push(plan);
        }

        if self.config.sync.dry_run {
            info!("dry run; not applying the plan");
            return Ok(report);
        }
        report.results = self.executor.run_plan(&report.plan, &self.cancel).await?;
        report.cancelled = self.cancel.is_cancelled();
        Ok(report)
    }

    // Reads, parses, and migrates one machine's notes.
    async fn read_notes(
        &self,
        machine: &MachineRecord,
        report: &mut SyncReport,
    ) -> anyhow::Result<Annotation> {
        let text = self
            .platform
            .read_annotation(&machine.id)
            .await
            .with_context(|| format!("failed to read the notes of {}", machine.id))?;
        let mut annotation = parse_annotation(&text);

        let persist = self.config.sync.persist_migrations && !self.config.sync.dry_run;
        if persist && self.codec.has_key() {
            match self.codec.migrate_annotation(&annotation) {
                Ok(None) => {}
                Ok(Some(migrated)) => {
                    match self.platform.write_annotation(&machine.id, &migrated).await {
                        Ok(()) => {
                            report.migrated.push(machine.id.clone());
                            annotation = parse_annotation(&migrated);
                        }
                        // The plaintext still works for this pass; the next one tries again.
                        Err(e) => {
                            warn!(machine = %machine.id, "could not save encrypted notes: {e:#}");
                            report.warnings.push(format!(
                                "{}: could not save encrypted notes: {e:#}",
                                machine.id,
                            ));
                        }
                    }
                }
                Err(e) => {
                    warn!(machine = %machine.id, "could not encrypt notes: {e}");
                    report
                        .warnings
                        .push(format!("{}: could not encrypt notes: {e}", machine.id));
                }
            }
        }

        for warning in annotation.warnings.iter() {
            warn!(machine = %machine.id, "{warning}");
            report.warnings.push(format!("{}: {warning}", machine.id));
        }
        Ok(annotation)
    }

    fn plan_machine(
        &self,
        machine: &MachineRecord,
        annotation: &Annotation,
        location: &MachineLocation,
        connections: &[ActualConnection],
        warnings: &mut Vec<String>,
    ) -> MachinePlan {
        let context = MachineContext {
            machine,
            location,
            controller_hostname: &self.hostname,
            default_template: annotation.default_template.as_deref(),
        };

        let mut desired = Vec::new();
        let mut skipped = Vec::new();
        for record in annotation.records.iter() {
            let line = record.span().line;
            match build_specs(record, &context, &self.codec) {
                Ok(batch) => {
                    for warning in batch.warnings {
                        warn!(machine = %machine.id, line = warning.line, "{}", warning.message);
                        warnings.push(format!(
                            "{}: line {}: {}",
                            machine.id, warning.line, warning.message,
                        ));
                    }
                    desired.extend(batch.specs);
                }
                Err(e) => {
                    warn!(machine = %machine.id, line, "skipping directive: {e}");
                    warnings.push(format!("{}: line {line}: skipped: {e}", machine.id));
                    skipped.push(SkippedRecord {
                        line,
                        username: record.get(USERNAME).map(str::to_string),
                        reason: e.to_string(),
                    });
                }
            }
        }

        let location_pending = !location.is_resolved() && !desired.is_empty();
        let names: Vec<&str> = desired.iter().map(|s| s.name.as_str()).collect();
        // Until the address is known, names may still hold the placeholder, so every untagged
        // connection stays a candidate. Answering the address question narrows them down.
        let actual = connections
            .iter()
            .filter(|c| match location_pending {
                true => c.source_tag.is_none() || c.belongs_to(&machine.id, &names),
                false => c.belongs_to(&machine.id, &names),
            })
            .cloned()
            .collect();

        let options = DiffOptions {
            pull_orphans_into_notes: self.config.sync.pull_orphans_into_notes,
        };
        diff_machine(
            DiffInput {
                machine: machine.id.clone(),
                machine_name: machine.name.clone(),
                power: machine.power,
                location_pending,
                desired,
                actual,
                skipped,
            },
            &options,
        )
    }
}

// Addresses the broker already points at, keyed by the machine that owns the connection.
fn seed_cache(connections: &[ActualConnection]) -> LocationCache {
    let mut cache = LocationCache::new();
    for connection in connections.iter() {
        let Some(owner) = &connection.source_tag else {
            continue;
        };
        if let Ok(address) = connection.host.parse::<Ipv4Addr>() {
            cache.insert(owner.clone(), address);
        }
    }
    cache
}

/// Returns the short host name used for the `{hostname}` placeholder: `configured` if given,
/// otherwise `$HOSTNAME` or `/etc/hostname`, falling back to `localhost`.
pub fn controller_hostname(configured: Option<&str>) -> String {
    let full = configured
        .map(str::to_string)
        .or_else(|| env::var("HOSTNAME").ok())
        .or_else(|| fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    match full.split_once('.') {
        Some((short, _)) if !short.is_empty() => short.to_string(),
        _ => full,
    }
}
