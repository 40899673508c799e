//! Reports the outcome of each [ReconciliationAction] as it is applied.
//!
//! The real [Report] implementation locks stdout and stderr only for the duration of a single
//! report and hands the locked writers to [_report] and [_starting], which hold all of the logic.
//! Tests call those two directly with in-memory writers. Locking per report keeps the lines of
//! concurrently reconciled machines from interleaving without serializing the rest of the program.

use super::Outcome;
use crate::core::plan::ReconciliationAction;
use async_trait::async_trait;
use std::fmt::Display;
use std::io::{self, Write};
use std::ops::DerefMut;
use tokio::task;

/// Prints feedback about each applied action so the operator can follow along.
#[async_trait]
pub trait Report: Send {
    /// Reports that an action is about to be applied.
    async fn starting(&mut self, machine: &str, action: &ReconciliationAction) -> io::Result<()>;

    /// Reports how an action went.
    async fn report(
        &mut self,
        machine: &str,
        action: &ReconciliationAction,
        outcome: &Outcome,
    ) -> io::Result<()>;
}

/// The production [Report] implementation. Uses the real stdout/stderr.
#[derive(Clone, Debug)]
pub struct Reporter;

#[async_trait]
impl Report for Reporter {
    async fn starting(&mut self, machine: &str, action: &ReconciliationAction) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        task::block_in_place(move || _starting(&mut stdout, machine, action))
    }

    async fn report(
        &mut self,
        machine: &str,
        action: &ReconciliationAction,
        outcome: &Outcome,
    ) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        let mut stderr = io::stderr().lock();
        task::block_in_place(move || _report(&mut stdout, &mut stderr, machine, action, outcome))
    }
}

/// Generates a one-line title for an action, suitable for user output. Never includes secrets.
pub fn title(action: &ReconciliationAction) -> String {
    use ReconciliationAction::*;
    match action {
        Create(spec) => format!(
            "create {} ({} {}@{}:{})",
            spec.name,
            spec.protocol,
            spec.username,
            spec.host_string(),
            spec.port,
        ),
        Update {
            existing, diffs, ..
        } => {
            let fields: Vec<String> = diffs.iter().map(ToString::to_string).collect();
            format!("update {} ({})", existing.name, fields.join(", "))
        }
        Recreate { existing, spec, .. } => format!(
            "recreate {} as {} ({} -> {})",
            existing.name, spec.name, existing.protocol, spec.protocol,
        ),
        PullIntoNotes(connection) => format!("pull into notes: {}", connection.name),
        Delete(connection) => format!("delete {}", connection.name),
        NoOp { existing } => format!("unchanged {}", existing.name),
    }
}

/// A testable method containing the logic for reporting an action's outcome.
pub fn _report<OT: Write, ET: Write, O: DerefMut<Target = OT>, E: DerefMut<Target = ET>>(
    mut stdout: O,
    mut stderr: E,
    machine: &str,
    action: &ReconciliationAction,
    outcome: &Outcome,
) -> io::Result<()> {
    fn write_indented(
        mut writer: impl Write,
        header: impl Display,
        content: impl AsRef<str>,
    ) -> io::Result<()> {
        writeln!(writer, "    {header}")?;
        for line in content.as_ref().lines() {
            writeln!(writer, "        {line}")?;
        }
        Ok(())
    }

    match outcome {
        Outcome::Applied => writeln!(&mut stdout, "[{machine}] Completed {}", title(action)),
        Outcome::Unchanged => writeln!(&mut stdout, "[{machine}] Unchanged {}", title(action)),
        Outcome::Skipped(reason) => {
            writeln!(&mut stdout, "[{machine}] Skipped   {}: {reason}", title(action))
        }
        Outcome::Failed(message) => {
            writeln!(
                &mut stderr,
                "[{machine}] Action failed. See below for details.",
            )?;
            write_indented(stderr.deref_mut(), "Error:", message)?;
            let yaml = serde_yaml::to_string(action).map_err(io::Error::other)?;
            write_indented(stderr.deref_mut(), "Action:", yaml)
        }
    }
}

/// A testable method containing the logic for reporting that an action is starting.
pub fn _starting<OT: Write, O: DerefMut<Target = OT>>(
    mut stdout: O,
    machine: &str,
    action: &ReconciliationAction,
) -> io::Result<()> {
    let action = title(action);
    writeln!(
        &mut stdout,
        // The extra space lines up "Starting" with "Completed".
        "[{machine}] Starting  {action}",
    )
}

#[cfg(test)]
mod test;
