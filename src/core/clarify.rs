//! Questions a plan cannot answer on its own.
//!
//! Blocking on an operator is the front end's business. This module only turns a [MachinePlan]
//! into a list of [ClarificationRequest]s and folds the operator's [Answer]s back into the plan.

use crate::core::machine::{ActualConnection, MachineId};
use crate::core::plan::{diff_machine, MachinePlan, ReconciliationAction};
use crate::core::spec::UNRESOLVED_IP;
use serde::Serialize;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Something the operator has to decide.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClarificationRequest {
    /// The machine's address could not be found. Answer with [Answer::Address] or
    /// [Answer::Ignore].
    Address { machine: MachineId, machine_name: String },

    /// A connection belongs to the machine but matches no directive. Answer with
    /// [Answer::PullIntoNotes], [Answer::Delete], or [Answer::Ignore].
    Orphan {
        machine: MachineId,
        connection: ActualConnection,
    },

    /// An older copy of a connection. Answer with [Answer::Delete] or [Answer::Ignore].
    Duplicate {
        machine: MachineId,
        connection: ActualConnection,
    },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Answer {
    Address(Ipv4Addr),
    PullIntoNotes,
    Delete,
    Ignore,
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum AnswerError {
    #[error("that answer does not apply to this question")]
    NotApplicable,

    #[error("the question is not about this plan")]
    Stale,
}

/// Lists the questions for `plan`, in a stable order: address first, then orphans, then
/// duplicates. Orphans that already have an action planned are not asked about.
pub fn clarifications(plan: &MachinePlan) -> Vec<ClarificationRequest> {
    let mut requests = Vec::new();
    if plan.pending.is_some() {
        requests.push(ClarificationRequest::Address {
            machine: plan.machine.clone(),
            machine_name: plan.machine_name.clone(),
        });
    }
    for orphan in plan.orphans.iter().filter(|o| !plan.handles(o)) {
        requests.push(ClarificationRequest::Orphan {
            machine: plan.machine.clone(),
            connection: orphan.clone(),
        });
    }
    for duplicate in plan.duplicates.iter().filter(|d| !plan.handles(d)) {
        requests.push(ClarificationRequest::Duplicate {
            machine: plan.machine.clone(),
            connection: duplicate.clone(),
        });
    }
    requests
}

impl MachinePlan {
    // Returns `true` if an orphan-handling action already covers `connection`.
    fn handles(&self, connection: &ActualConnection) -> bool {
        self.actions.iter().any(|action| match action {
            ReconciliationAction::PullIntoNotes(c) | ReconciliationAction::Delete(c) => {
                c.id == connection.id
            }
            _ => false,
        })
    }

    /// Applies the operator's answer to one of this plan's questions.
    ///
    /// An address answer replans the machine as if the address had been resolved: every pending
    /// connection is pointed at it, and `{ip}` in connection names is filled in. Untagged broker
    /// connections held as candidates are matched against the filled-in names.
    pub fn answer(
        &mut self,
        request: &ClarificationRequest,
        answer: Answer,
    ) -> Result<(), AnswerError> {
        match request {
            ClarificationRequest::Address { machine, .. } => {
                self.check(machine)?;
                let address = match answer {
                    Answer::Address(address) => address,
                    Answer::Ignore => return Ok(()),
                    _ => return Err(AnswerError::NotApplicable),
                };
                let Some(mut input) = self.pending.take() else {
                    return Err(AnswerError::Stale);
                };
                input.location_pending = false;
                for spec in input.desired.iter_mut() {
                    spec.host = Some(address);
                    spec.name = spec.name.replace(UNRESOLVED_IP, &address.to_string());
                }
                let names: Vec<&str> = input.desired.iter().map(|s| s.name.as_str()).collect();
                let machine = input.machine.clone();
                input.actual.retain(|c| c.belongs_to(&machine, &names));
                let options = self.options;
                *self = diff_machine(input, &options);
                Ok(())
            }
            ClarificationRequest::Orphan {
                machine,
                connection,
            } => {
                self.check(machine)?;
                if !self.orphans.iter().any(|o| o.id == connection.id) {
                    return Err(AnswerError::Stale);
                }
                let action = match answer {
                    Answer::PullIntoNotes => ReconciliationAction::PullIntoNotes(connection.clone()),
                    Answer::Delete => ReconciliationAction::Delete(connection.clone()),
                    Answer::Ignore => return Ok(()),
                    Answer::Address(_) => return Err(AnswerError::NotApplicable),
                };
                self.replace_orphan_action(connection, action);
                Ok(())
            }
            ClarificationRequest::Duplicate {
                machine,
                connection,
            } => {
                self.check(machine)?;
                if !self.duplicates.iter().any(|d| d.id == connection.id) {
                    return Err(AnswerError::Stale);
                }
                match answer {
                    Answer::Delete => {
                        self.replace_orphan_action(
                            connection,
                            ReconciliationAction::Delete(connection.clone()),
                        );
                        Ok(())
                    }
                    Answer::Ignore => Ok(()),
                    _ => Err(AnswerError::NotApplicable),
                }
            }
        }
    }

    fn check(&self, machine: &MachineId) -> Result<(), AnswerError> {
        match &self.machine == machine {
            true => Ok(()),
            false => Err(AnswerError::Stale),
        }
    }

    // At most one orphan-handling action per connection; a later answer replaces an earlier one.
    fn replace_orphan_action(&mut self, connection: &ActualConnection, action: ReconciliationAction) {
        self.actions.retain(|a| match a {
            ReconciliationAction::PullIntoNotes(c) | ReconciliationAction::Delete(c) => {
                c.id != connection.id
            }
            _ => true,
        });
        self.actions.push(action);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fixtures::{actual, desired};
    use crate::core::machine::{ConnectionId, PowerState};
    use crate::core::plan::{DiffInput, DiffOptions, MachineStatus};
    use crate::core::spec::Protocol;
    use pretty_assertions::assert_eq;

    fn input() -> DiffInput {
        DiffInput {
            machine: MachineId::new("pve1", 101),
            machine_name: "web01".to_string(),
            power: PowerState::Running,
            location_pending: false,
            desired: vec![],
            actual: vec![],
            skipped: vec![],
        }
    }

    mod clarifications {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn converged_plan_asks_nothing() {
            let mut input = input();
            input.desired = vec![desired("admin", Protocol::Rdp)];
            input.actual = vec![actual("c1", "admin", Protocol::Rdp)];
            let plan = diff_machine(input, &DiffOptions::default());

            assert_eq!(Vec::<ClarificationRequest>::new(), clarifications(&plan));
        }

        #[test]
        fn asks_about_address_orphans_and_duplicates_in_order() {
            let mut input = input();
            input.actual = vec![
                actual("c1", "admin", Protocol::Rdp).created_at(10),
                actual("c2", "admin", Protocol::Rdp).created_at(20),
            ];
            let plan = diff_machine(input, &DiffOptions::default());

            let requests = clarifications(&plan);

            assert_eq!(2, requests.len());
            assert!(matches!(
                &requests[0],
                ClarificationRequest::Orphan { connection, .. } if connection.id.0 == "c2",
            ));
            assert!(matches!(
                &requests[1],
                ClarificationRequest::Duplicate { connection, .. } if connection.id.0 == "c1",
            ));
        }

        #[test]
        fn pulled_orphans_are_not_asked_about() {
            let mut input = input();
            input.actual = vec![actual("c1", "admin", Protocol::Rdp)];
            let plan = diff_machine(
                input,
                &DiffOptions {
                    pull_orphans_into_notes: true,
                },
            );

            assert!(clarifications(&plan).is_empty());
        }
    }

    mod answer {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn address_replans_pending_machine() {
            let mut input = input();
            input.location_pending = true;
            let mut spec = desired("admin", Protocol::Rdp);
            spec.host = None;
            spec.name = format!("web01-{UNRESOLVED_IP}");
            input.desired = vec![spec];
            let mut plan = diff_machine(input, &DiffOptions::default());
            assert_eq!(MachineStatus::LocationPending, plan.status);
            let request = clarifications(&plan).remove(0);

            plan.answer(&request, Answer::Address(Ipv4Addr::new(10, 0, 0, 42)))
                .unwrap();

            assert_eq!(MachineStatus::Missing, plan.status);
            let spec = plan.actions[0].spec().unwrap();
            assert_eq!("web01-10.0.0.42", spec.name);
            assert_eq!(Some(Ipv4Addr::new(10, 0, 0, 42)), spec.host);
            assert!(clarifications(&plan).is_empty());
        }

        #[test]
        fn address_matches_untagged_connection_by_filled_in_name() {
            let address = Ipv4Addr::new(10, 0, 0, 42);
            let mut input = input();
            input.location_pending = true;
            let mut spec = desired("admin", Protocol::Rdp);
            spec.host = None;
            spec.name = format!("web01-{UNRESOLVED_IP}");
            input.desired = vec![spec];
            let mut legacy = actual("c1", "admin", Protocol::Rdp);
            legacy.name = "web01-10.0.0.42".to_string();
            legacy.host = address.to_string();
            legacy.source_tag = None;
            let mut unrelated = actual("c2", "ops", Protocol::Ssh);
            unrelated.name = "db01-ops-ssh".to_string();
            unrelated.source_tag = None;
            input.actual = vec![legacy, unrelated];
            let mut plan = diff_machine(input, &DiffOptions::default());
            let request = clarifications(&plan).remove(0);

            plan.answer(&request, Answer::Address(address)).unwrap();

            assert_eq!(MachineStatus::Ok, plan.status);
            assert!(matches!(
                plan.actions.as_slice(),
                [ReconciliationAction::NoOp { .. }],
            ));
            assert!(plan.orphans.is_empty());
            assert!(clarifications(&plan).is_empty());
        }

        #[test]
        fn orphan_delete_and_pull_replace_each_other() {
            let mut input = input();
            input.actual = vec![actual("c1", "admin", Protocol::Rdp)];
            let mut plan = diff_machine(input, &DiffOptions::default());
            let request = clarifications(&plan).remove(0);

            plan.answer(&request, Answer::PullIntoNotes).unwrap();
            plan.answer(&request, Answer::Delete).unwrap();

            assert_eq!(1, plan.actions.len());
            assert!(matches!(
                &plan.actions[0],
                ReconciliationAction::Delete(c) if c.id == ConnectionId("c1".to_string()),
            ));
        }

        #[test]
        fn ignore_changes_nothing() {
            let mut input = input();
            input.actual = vec![actual("c1", "admin", Protocol::Rdp)];
            let mut plan = diff_machine(input, &DiffOptions::default());
            let before = plan.clone();
            let request = clarifications(&plan).remove(0);

            plan.answer(&request, Answer::Ignore).unwrap();

            assert_eq!(before, plan);
        }

        #[test]
        fn rejects_mismatched_answers() {
            let mut input = input();
            input.actual = vec![
                actual("c1", "admin", Protocol::Rdp).created_at(10),
                actual("c2", "admin", Protocol::Rdp).created_at(20),
            ];
            let mut plan = diff_machine(input, &DiffOptions::default());
            let requests = clarifications(&plan);

            assert_eq!(
                Err(AnswerError::NotApplicable),
                plan.answer(&requests[1], Answer::PullIntoNotes),
            );
            assert_eq!(
                Err(AnswerError::NotApplicable),
                plan.answer(&requests[0], Answer::Address(Ipv4Addr::LOCALHOST)),
            );
        }

        #[test]
        fn rejects_questions_about_other_machines() {
            let mut input = input();
            input.actual = vec![actual("c1", "admin", Protocol::Rdp)];
            let mut plan = diff_machine(input, &DiffOptions::default());
            let request = ClarificationRequest::Orphan {
                machine: MachineId::new("pve2", 101),
                connection: plan.orphans[0].clone(),
            };

            assert_eq!(Err(AnswerError::Stale), plan.answer(&request, Answer::Delete));
        }
    }
}
