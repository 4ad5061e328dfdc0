pub mod application;
pub mod history;
pub mod plan;
pub mod resource;
pub mod status;
pub mod sync_result;

pub use application::{Application, Destination, IgnoreRule, SourceRef, SyncOption, SyncPolicy};
pub use history::{HistoryEntry, Initiator, SyncSummary};
pub use plan::{Action, DiffEntry, FieldDrift, SyncPlan};
pub use resource::{DesiredResource, LabelSelector, LiveObject, ObservedResource, ResourceKey, ResourceKind};
pub use status::{ApplicationState, ApplicationStatus, PlanRecord, SourceFailure};
pub use sync_result::{Outcome, ResourceResult, SyncResult};
