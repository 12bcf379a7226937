//! Service layer: the state machine, terminal accounting, step templates,
//! and background maintenance.

pub mod cost;
pub mod lifecycle;
pub mod sweeper;
pub mod templates;

pub use cost::{ConsumptionEntry, CostService, MeteringEvent, MeteringPublisher};
pub use lifecycle::{JobOutcome, JobOutcomeEvent, LifecycleService, OutcomePublisher};
pub use sweeper::Sweeper;
pub use templates::{to_step_details, StepTemplate, StepTemplateRegistry, YamlTemplateRegistry};
