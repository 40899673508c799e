//! The pure half of a sync pass: directive parsing, spec building, and diffing.

pub mod clarify;
pub mod directive;
pub mod machine;
pub mod plan;
pub mod spec;

#[doc(inline)]
pub use directive::{parse_annotation, Annotation, RawDirectiveRecord};

#[doc(inline)]
pub use machine::{ActualConnection, MachineId, MachineRecord};

#[doc(inline)]
pub use plan::{diff_machine, MachinePlan, ReconciliationAction, ReconciliationPlan};

#[doc(inline)]
pub use spec::{build_specs, DesiredConnectionSpec, Protocol};
