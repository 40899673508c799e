//! Applies a [ReconciliationPlan] through the broker and platform collaborators.
//!
//! Each action is one best-effort remote call (two for a recreate). A failed action is reported
//! and the rest of the machine's plan still runs. Cancellation is checked before every action:
//! actions already applied stay applied and the rest are reported as skipped. Because the differ
//! classifies already-applied work as [ReconciliationAction::NoOp], a rerun picks up where a
//! cancelled or failed run stopped.

pub mod report;

use crate::core::directive::parse_annotation;
use crate::core::machine::{ActualConnection, MachineId};
use crate::core::plan::{MachinePlan, MachineStatus, ReconciliationAction, ReconciliationPlan};
use crate::crypto::SecretCodec;
use crate::network::wake::WakeTransmitter;
use crate::platform::{Broker, ConnectionRequest, Virtualization};
use anyhow::{anyhow, bail, Context};
use report::Report;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How applying one action went.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub enum Outcome {
    Applied,
    Unchanged,
    Failed(String),
    Skipped(String),
}

/// The outcome of one action, titled for display.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ActionResult {
    pub title: String,
    pub outcome: Outcome,
}

/// The results for one machine.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct MachineResults {
    pub machine: MachineId,
    pub results: Vec<ActionResult>,
}

impl MachineResults {
    pub fn failures(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, Outcome::Failed(_)))
            .count()
    }
}

/// Everything needed to apply plans.
pub struct Executor<R: Report> {
    pub broker: Arc<dyn Broker>,
    pub platform: Arc<dyn Virtualization>,
    pub wake: Arc<dyn WakeTransmitter>,
    pub codec: Arc<SecretCodec>,
    pub reporter: R,
}

impl<R: Report + Clone> Executor<R> {
    /// Applies every machine's plan in order.
    ///
    /// # Errors
    ///
    /// Returns an error only if reporting fails. Failed actions are recorded in the results.
    pub async fn run_plan(
        &self,
        plan: &ReconciliationPlan,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<MachineResults>> {
        let mut all = Vec::new();
        for machine_plan in plan.machines.iter() {
            let results = self
                .apply_machine_plan(machine_plan, self.reporter.clone(), cancel)
                .await?;
            all.push(MachineResults {
                machine: machine_plan.machine.clone(),
                results,
            });
        }
        Ok(all)
    }
}

impl<R: Report> Executor<R> {
    /// Applies one machine's plan.
    pub async fn apply_machine_plan(
        &self,
        plan: &MachinePlan,
        mut reporter: R,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<ActionResult>> {
        let machine = plan.machine_name.as_str();
        let mut results = Vec::new();
        if plan.status == MachineStatus::LocationPending {
            info!(machine = %plan.machine, "address unknown; leaving connections alone");
            return Ok(results);
        }

        let mutating = plan.actions.iter().any(ReconciliationAction::is_mutating);
        let mut group = None;
        if mutating && !cancel.is_cancelled() {
            if let Some(mac) = plan.wake {
                // Best effort. The connections are still worth fixing if the machine sleeps on.
                if let Err(e) = self.wake.wake(mac).await {
                    warn!(machine = %plan.machine, "could not wake machine: {e:#}");
                }
            }
            if let Some(name) = &plan.group {
                match self.broker.ensure_group(name).await {
                    Ok(id) => group = Some(id),
                    Err(e) => warn!(machine = %plan.machine, "could not ensure group {name}: {e:#}"),
                }
            }
        }

        for action in plan.actions.iter() {
            let outcome = if !action.is_mutating() {
                Outcome::Unchanged
            } else if cancel.is_cancelled() {
                let outcome = Outcome::Skipped("cancelled".to_string());
                reporter.report(machine, action, &outcome).await?;
                outcome
            } else {
                reporter.starting(machine, action).await?;
                let outcome = match self.apply(plan, action, group.clone()).await {
                    Ok(()) => Outcome::Applied,
                    Err(e) => {
                        warn!(machine = %plan.machine, "{e:#}");
                        Outcome::Failed(format!("{e:#}"))
                    }
                };
                reporter.report(machine, action, &outcome).await?;
                outcome
            };
            results.push(ActionResult {
                title: report::title(action),
                outcome,
            });
        }
        Ok(results)
    }

    async fn apply(
        &self,
        plan: &MachinePlan,
        action: &ReconciliationAction,
        group: Option<String>,
    ) -> anyhow::Result<()> {
        use ReconciliationAction::*;
        match action {
            Create(spec) => {
                let password = self.codec.reveal(&spec.secret)?;
                let request = ConnectionRequest::new(spec, password, group);
                let id = self
                    .broker
                    .create(&request)
                    .await
                    .with_context(|| format!("failed to create {}", spec.name))?;
                info!(connection = %id, name = %spec.name, "created connection");
            }
            Update { existing, spec, .. } => {
                let password = self.codec.reveal(&spec.secret)?;
                let request = ConnectionRequest::new(spec, password, group);
                self.broker
                    .update(&existing.id, &request)
                    .await
                    .with_context(|| format!("failed to update {}", existing.name))?;
                info!(connection = %existing.id, name = %spec.name, "updated connection");
            }
            Recreate { existing, spec, .. } => {
                let password = self.codec.reveal(&spec.secret)?;
                let request = ConnectionRequest::new(spec, password, group);
                self.broker
                    .delete(&existing.id)
                    .await
                    .with_context(|| format!("failed to delete {}", existing.name))?;
                let id = self.broker.create(&request).await.with_context(|| {
                    format!(
                        "deleted {} but failed to create {}; it will be created on the next run",
                        existing.name, spec.name,
                    )
                })?;
                info!(connection = %id, name = %spec.name, "recreated connection");
            }
            PullIntoNotes(connection) => self.pull_into_notes(plan, connection).await?,
            Delete(connection) => {
                self.broker
                    .delete(&connection.id)
                    .await
                    .with_context(|| format!("failed to delete {}", connection.name))?;
                info!(connection = %connection.id, name = %connection.name, "deleted connection");
            }
            NoOp { .. } => {}
        }
        Ok(())
    }

    // Appends a directive for `connection` to the machine's annotation, encrypting it if a key is
    // configured, and writes the annotation back.
    async fn pull_into_notes(
        &self,
        plan: &MachinePlan,
        connection: &ActualConnection,
    ) -> anyhow::Result<()> {
        let Some(secret) = self.broker.reveal_secret(&connection.id).await? else {
            bail!("the broker did not reveal the secret of {}", connection.name);
        };
        let line = directive_line(connection, &secret)?;

        let mut text = self
            .platform
            .read_annotation(&plan.machine)
            .await
            .with_context(|| format!("failed to read the notes of {}", plan.machine))?;
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&line);
        text.push('\n');

        if self.codec.has_key() {
            if let Some(migrated) = self.codec.migrate_annotation(&parse_annotation(&text))? {
                text = migrated;
            }
        }

        self.platform
            .write_annotation(&plan.machine, &text)
            .await
            .with_context(|| format!("failed to write the notes of {}", plan.machine))?;
        info!(machine = %plan.machine, name = %connection.name, "pulled connection into notes");
        Ok(())
    }
}

/// Renders a directive that reproduces `connection`.
///
/// The port is only written when it differs from the protocol's default.
pub fn directive_line(connection: &ActualConnection, secret: &str) -> anyhow::Result<String> {
    let protocol = connection.protocol;
    let mut line = format!(
        "user:{} pass:{} protos:{}",
        quote(&connection.username)?,
        quote(secret)?,
        quote(protocol.as_str())?,
    );
    if connection.port != protocol.default_port() {
        line.push_str(&format!(
            " {protocol}_port:{}",
            quote(&connection.port.to_string())?,
        ));
    }
    line.push_str(&format!(" confName:{};", quote(&connection.name)?));
    Ok(line)
}

// Double quotes unless the value contains one, then single quotes.
fn quote(value: &str) -> anyhow::Result<String> {
    if value.contains('\n') {
        return Err(anyhow!("value spans lines and cannot be written as a directive"));
    }
    match (value.contains('"'), value.contains('\'')) {
        (false, _) => Ok(format!("\"{value}\"")),
        (true, false) => Ok(format!("'{value}'")),
        (true, true) => bail!("value contains both quote characters and cannot be written as a directive"),
    }
}
