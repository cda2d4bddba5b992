//! Reconciliation core: diff, validation, subscription resolution,
//! throttling and the run orchestrator.

pub mod compare;
pub mod orchestrator;
pub mod report;
pub mod resolver;
pub mod throttle;
pub mod validate;

pub use compare::diff;
pub use orchestrator::{Collaborators, SyncOrchestrator};
pub use report::{Outcome, RecordAction, RecordOutcome, RunOperation, RunReport, RunStatus};
pub use resolver::{AdditionPlan, RemovalPlan, SubscriptionResolver};
pub use throttle::{Throttle, ThrottlePermit};
pub use validate::{EntryRejection, EntryValidator};
