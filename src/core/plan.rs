//! Compares the connections a machine should have with the ones the broker holds.
//!
//! [diff_machine] is pure: it looks only at already-fetched data, so machines can be diffed in any
//! order or in parallel. The resulting [MachinePlan] lists one [ReconciliationAction] per desired
//! connection plus anything the operator has to decide about (orphans and duplicates).
//!
//! Desired and actual connections are matched on `(username, protocol)`. Directive order never
//! matters. A connection whose key changed but whose name did not is still recognized as the same
//! connection (see [ReconciliationAction::Recreate]).

use crate::core::machine::{ActualConnection, MachineId, PowerState};
use crate::core::spec::{DesiredConnectionSpec, Protocol};
use crate::network::MacAddress;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt::{self, Display};

/// A field that differs between a desired and an actual connection.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Name,
    Host,
    Port,
    Username,
    Secret,
    Protocol,
    WakeEnabled,
}

impl Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Field::Name => "name",
            Field::Host => "host",
            Field::Port => "port",
            Field::Username => "username",
            Field::Secret => "secret",
            Field::Protocol => "protocol",
            Field::WakeEnabled => "wake",
        };
        f.write_str(name)
    }
}

/// How one desired connection compares with the broker.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Ok,
    /// Addressing changed: host, port, name, or wake-on-LAN.
    Port,
    /// The username or secret changed.
    Creds,
    /// The protocol changed, so the connection has to be recreated.
    Proto,
    /// The connection does not exist yet.
    Missing,
}

/// Summary of a whole machine's plan.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MachineStatus {
    Ok,
    Port,
    Creds,
    Proto,
    Missing,
    /// More than one kind of discrepancy.
    Mixed,
    /// The machine's address is unknown, so nothing was planned.
    LocationPending,
}

impl From<ConnectionStatus> for MachineStatus {
    fn from(status: ConnectionStatus) -> Self {
        match status {
            ConnectionStatus::Ok => MachineStatus::Ok,
            ConnectionStatus::Port => MachineStatus::Port,
            ConnectionStatus::Creds => MachineStatus::Creds,
            ConnectionStatus::Proto => MachineStatus::Proto,
            ConnectionStatus::Missing => MachineStatus::Missing,
        }
    }
}

impl Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MachineStatus::Ok => "OK",
            MachineStatus::Port => "PORT",
            MachineStatus::Creds => "CREDS",
            MachineStatus::Proto => "PROTO",
            MachineStatus::Missing => "MISSING",
            MachineStatus::Mixed => "MIXED",
            MachineStatus::LocationPending => "LOCATION PENDING",
        };
        f.write_str(name)
    }
}

/// One step toward converging the broker with the desired connections.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReconciliationAction {
    Create(DesiredConnectionSpec),

    Update {
        existing: ActualConnection,
        diffs: BTreeSet<Field>,
        spec: DesiredConnectionSpec,
    },

    /// Delete `existing`, then create `spec`. Used when the protocol of a connection changed.
    Recreate {
        existing: ActualConnection,
        diffs: BTreeSet<Field>,
        spec: DesiredConnectionSpec,
    },

    /// Write an orphaned connection back into the machine's annotation as a directive.
    PullIntoNotes(ActualConnection),

    /// Delete a connection. Only ever planned in answer to a clarification.
    Delete(ActualConnection),

    NoOp {
        existing: ActualConnection,
    },
}

impl ReconciliationAction {
    /// The status this action contributes to its machine, if any. Orphan handling contributes
    /// none.
    pub fn status(&self) -> Option<ConnectionStatus> {
        use ReconciliationAction::*;
        match self {
            Create(_) => Some(ConnectionStatus::Missing),
            Update { diffs, .. } => Some(classify(diffs)),
            Recreate { .. } => Some(ConnectionStatus::Proto),
            NoOp { .. } => Some(ConnectionStatus::Ok),
            PullIntoNotes(_) | Delete(_) => None,
        }
    }

    /// Returns `true` if applying this action calls the broker.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, ReconciliationAction::NoOp { .. })
    }

    /// The desired spec this action converges toward, if any.
    pub fn spec(&self) -> Option<&DesiredConnectionSpec> {
        use ReconciliationAction::*;
        match self {
            Create(spec) | Update { spec, .. } | Recreate { spec, .. } => Some(spec),
            PullIntoNotes(_) | Delete(_) | NoOp { .. } => None,
        }
    }

    /// The existing connection this action touches, if any.
    pub fn existing(&self) -> Option<&ActualConnection> {
        use ReconciliationAction::*;
        match self {
            Create(_) => None,
            Update { existing, .. }
            | Recreate { existing, .. }
            | NoOp { existing }
            | PullIntoNotes(existing)
            | Delete(existing) => Some(existing),
        }
    }
}

fn classify(diffs: &BTreeSet<Field>) -> ConnectionStatus {
    if diffs.contains(&Field::Protocol) {
        ConnectionStatus::Proto
    } else if diffs.contains(&Field::Secret) || diffs.contains(&Field::Username) {
        ConnectionStatus::Creds
    } else if diffs.is_empty() {
        ConnectionStatus::Ok
    } else {
        ConnectionStatus::Port
    }
}

/// A directive record that produced no connections, and why.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct SkippedRecord {
    pub line: usize,
    /// The record's username, if it had one. Connections for this user are never pulled back into
    /// the notes while the record is broken.
    pub username: Option<String>,
    pub reason: String,
}

/// Differ policy.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DiffOptions {
    /// Plan [ReconciliationAction::PullIntoNotes] for every orphan instead of only reporting it.
    pub pull_orphans_into_notes: bool,
}

/// Everything [diff_machine] looks at for one machine.
#[derive(Clone, Debug, PartialEq)]
pub struct DiffInput {
    pub machine: MachineId,
    pub machine_name: String,
    pub power: PowerState,
    /// The machine's address could not be determined.
    pub location_pending: bool,
    pub desired: Vec<DesiredConnectionSpec>,
    /// The broker connections that belong to this machine.
    pub actual: Vec<ActualConnection>,
    pub skipped: Vec<SkippedRecord>,
}

/// The reconciliation plan for one machine.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MachinePlan {
    pub machine: MachineId,
    pub machine_name: String,
    pub status: MachineStatus,
    /// Group to file the machine's connections under. Set when it has more than one.
    pub group: Option<String>,
    /// Send a wake-on-LAN packet to this address before applying the actions.
    pub wake: Option<MacAddress>,
    pub actions: Vec<ReconciliationAction>,
    /// Connections that belong to the machine but match no directive.
    pub orphans: Vec<ActualConnection>,
    /// Older connections that share a key with a newer one.
    pub duplicates: Vec<ActualConnection>,
    pub skipped: Vec<SkippedRecord>,
    pub warnings: Vec<String>,
    #[serde(skip)]
    pub(crate) pending: Option<DiffInput>,
    #[serde(skip)]
    pub(crate) options: DiffOptions,
}

impl MachinePlan {
    /// Returns `true` if applying this plan would not call the broker.
    pub fn is_converged(&self) -> bool {
        self.status != MachineStatus::LocationPending
            && !self.actions.iter().any(ReconciliationAction::is_mutating)
    }
}

/// Plans for every machine in a sync pass, in the order the platform listed them.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ReconciliationPlan {
    pub machines: Vec<MachinePlan>,
}

impl ReconciliationPlan {
    /// Returns `true` if no machine needs a broker call.
    pub fn is_converged(&self) -> bool {
        self.machines.iter().all(MachinePlan::is_converged)
    }

    pub fn plan_for(&self, machine: &MachineId) -> Option<&MachinePlan> {
        self.machines.iter().find(|p| &p.machine == machine)
    }
}

type Key = (String, Protocol);

/// Computes the plan for one machine.
///
/// Matching happens in three passes:
///
/// 1. Exact `(username, protocol)` matches become [ReconciliationAction::NoOp] or
///    [ReconciliationAction::Update].
/// 2. Remaining desired connections whose name equals a remaining actual connection's name are
///    treated as renames of its key: a changed protocol becomes [ReconciliationAction::Recreate],
///    a changed username an [ReconciliationAction::Update].
/// 3. Whatever desired connections are left are created. Whatever actual connections are left are
///    orphans. They are never deleted here; with [DiffOptions::pull_orphans_into_notes] they are
///    pulled back into the machine's annotation.
///
/// When several actual connections share a key, the most recently created one takes part in
/// matching and the rest are listed as duplicates.
pub fn diff_machine(input: DiffInput, options: &DiffOptions) -> MachinePlan {
    let mut plan = MachinePlan {
        machine: input.machine.clone(),
        machine_name: input.machine_name.clone(),
        status: MachineStatus::Ok,
        group: None,
        wake: None,
        actions: Vec::new(),
        orphans: Vec::new(),
        duplicates: Vec::new(),
        skipped: input.skipped.clone(),
        warnings: Vec::new(),
        pending: None,
        options: *options,
    };

    let desired = dedupe_desired(&input.desired, &mut plan.warnings);
    if desired.len() > 1 {
        plan.group = Some(input.machine_name.clone());
    }

    if input.location_pending && !desired.is_empty() {
        plan.status = MachineStatus::LocationPending;
        plan.pending = Some(input);
        return plan;
    }

    let (mut canonical, duplicates) = pick_canonical(&input.actual);
    plan.duplicates = duplicates;

    // Pass 1: exact key matches. Unmatched desired entries are kept in order for the next passes.
    let mut slots: Vec<(DesiredConnectionSpec, Option<ReconciliationAction>)> = Vec::new();
    for spec in desired {
        let key = (spec.username.clone(), spec.protocol);
        let action = canonical.remove(&key).map(|existing| compare(existing, &spec));
        slots.push((spec, action));
    }

    // Pass 2: renames, matched by connection name.
    for (spec, action) in slots.iter_mut().filter(|(_, a)| a.is_none()) {
        let renamed = canonical
            .iter()
            .find(|(_, existing)| existing.name == spec.name)
            .map(|(key, _)| key.clone());
        if let Some(key) = renamed {
            if let Some(existing) = canonical.remove(&key) {
                *action = Some(compare(existing, spec));
            }
        }
    }

    // Pass 3: creates.
    plan.actions = slots
        .into_iter()
        .map(|(spec, action)| action.unwrap_or(ReconciliationAction::Create(spec)))
        .collect();

    let mut orphans: Vec<ActualConnection> = canonical.into_values().collect();
    orphans.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
    if options.pull_orphans_into_notes {
        for orphan in orphans.iter() {
            let held = plan
                .skipped
                .iter()
                .any(|s| s.username.as_deref() == Some(orphan.username.as_str()));
            if held {
                plan.warnings.push(format!(
                    "not pulling {} into notes while a directive for {} is broken",
                    orphan.name, orphan.username,
                ));
                continue;
            }
            plan.actions
                .push(ReconciliationAction::PullIntoNotes(orphan.clone()));
        }
    }
    plan.orphans = orphans;

    plan.status = summarize(&plan.actions);
    plan.wake = wake_precondition(input.power, &plan.actions);
    plan
}

// One spec per (username, protocol) across all of a machine's records. The first one wins.
fn dedupe_desired(
    desired: &[DesiredConnectionSpec],
    warnings: &mut Vec<String>,
) -> Vec<DesiredConnectionSpec> {
    let mut seen = BTreeSet::new();
    let mut kept = Vec::new();
    for spec in desired {
        if seen.insert((spec.username.clone(), spec.protocol)) {
            kept.push(spec.clone());
        } else {
            warnings.push(format!(
                "line {}: {} over {} is already declared; ignoring this one",
                spec.line, spec.username, spec.protocol,
            ));
        }
    }
    kept
}

// Groups actual connections by key. Returns the newest connection per key, plus all the others.
// Connections without a creation time count as oldest; ties go to the higher ID.
fn pick_canonical(
    actual: &[ActualConnection],
) -> (HashMap<Key, ActualConnection>, Vec<ActualConnection>) {
    let mut groups: HashMap<Key, Vec<ActualConnection>> = HashMap::new();
    for connection in actual {
        groups
            .entry((connection.username.clone(), connection.protocol))
            .or_default()
            .push(connection.clone());
    }

    let mut canonical = HashMap::new();
    let mut duplicates = Vec::new();
    for (key, mut group) in groups {
        group.sort_by(|a, b| {
            b.created
                .cmp(&a.created)
                .then_with(|| b.id.cmp(&a.id))
        });
        let mut group = group.into_iter();
        if let Some(newest) = group.next() {
            canonical.insert(key, newest);
        }
        duplicates.extend(group);
    }
    duplicates.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
    (canonical, duplicates)
}

fn compare(existing: ActualConnection, spec: &DesiredConnectionSpec) -> ReconciliationAction {
    let diffs = field_diffs(&existing, spec);
    if diffs.contains(&Field::Protocol) {
        ReconciliationAction::Recreate {
            existing,
            diffs,
            spec: spec.clone(),
        }
    } else if diffs.is_empty() {
        ReconciliationAction::NoOp { existing }
    } else {
        ReconciliationAction::Update {
            existing,
            diffs,
            spec: spec.clone(),
        }
    }
}

/// Lists the fields in which `existing` differs from `spec`.
///
/// Secrets are compared by digest, never by ciphertext.
pub fn field_diffs(existing: &ActualConnection, spec: &DesiredConnectionSpec) -> BTreeSet<Field> {
    let mut diffs = BTreeSet::new();
    if existing.name != spec.name {
        diffs.insert(Field::Name);
    }
    if existing.host != spec.host_string() {
        diffs.insert(Field::Host);
    }
    if existing.port != spec.port {
        diffs.insert(Field::Port);
    }
    if existing.username != spec.username {
        diffs.insert(Field::Username);
    }
    if !existing.secret_digest.eq_ignore_ascii_case(&spec.secret_digest) {
        diffs.insert(Field::Secret);
    }
    if existing.protocol != spec.protocol {
        diffs.insert(Field::Protocol);
    }
    if existing.wake_enabled != spec.effective_wake() {
        diffs.insert(Field::WakeEnabled);
    }
    diffs
}

/// Folds per-connection statuses into a machine status. OK contributions never make a machine
/// [MachineStatus::Mixed]; two or more different non-OK kinds do.
pub fn summarize(actions: &[ReconciliationAction]) -> MachineStatus {
    let kinds: BTreeSet<ConnectionStatus> = actions
        .iter()
        .filter_map(ReconciliationAction::status)
        .filter(|s| *s != ConnectionStatus::Ok)
        .collect();
    let mut kinds = kinds.into_iter();
    match (kinds.next(), kinds.next()) {
        (None, _) => MachineStatus::Ok,
        (Some(kind), None) => kind.into(),
        (Some(_), Some(_)) => MachineStatus::Mixed,
    }
}

// A powered-off machine is woken before its connections are touched, if any of them has
// wake-on-LAN in effect.
fn wake_precondition(power: PowerState, actions: &[ReconciliationAction]) -> Option<MacAddress> {
    if !power.is_off() {
        return None;
    }
    actions
        .iter()
        .filter(|a| a.is_mutating())
        .filter_map(ReconciliationAction::spec)
        .find(|spec| spec.effective_wake())
        .and_then(|spec| spec.wake_mac)
}
