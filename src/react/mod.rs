//! 规划与反思层：计划结构、PlanGenerator、PlanTracker、SelfReflector、CompletionVerifier、进度事件

pub mod events;
pub mod plan;
pub mod planner;
pub mod reflector;
pub mod tracker;
pub mod verifier;

pub use events::{ProgressEvent, ProgressKind, ProgressStreamer, SubscriptionId};
pub use plan::{ExecutionPlan, PlanStatus, PlanStep, StepStatus};
pub use planner::{extract_json_object, PlanGenerator};
pub use reflector::{NextAction, Reflection, SelfReflector};
pub use tracker::{PlanProgress, PlanTracker, TrackerError};
pub use verifier::{verify_plan_complete, CompletionReport};
