//! Workflow step-composition engine.
//!
//! Leaf [`Step`]s wrap a function, agent or team. Composites nest freely:
//! - [`Steps`]: runs children in order, chaining outputs
//! - [`Condition`]: runs children only when an evaluator holds
//! - [`Loop`]: repeats children until an end condition, a stop, or the bound
//! - [`Parallel`]: runs children concurrently via `tokio::JoinSet`
//! - [`Router`]: picks children at runtime
//!
//! [`Workflow`] drives the top-level list.

pub mod condition;
pub mod events;
pub mod executable;
pub mod loops;
pub mod parallel;
pub mod router;
pub mod runner;
pub mod step;
pub mod steps;
pub mod types;

pub use condition::{Condition, ConditionBuilder, Evaluator};
pub use events::{EventMeta, OnStreamItem, StepIndex, StreamItem, WorkflowEvent};
pub use executable::{
    AsyncStepFn, BoxFuture, Executable, RunContext, StepLike, StepResult, StreamContext,
    SyncStepFn, chain_step_input, prepare_step, prepare_steps,
};
pub use loops::{EndCondition, Loop, LoopBuilder};
pub use parallel::{Parallel, ParallelBuilder};
pub use router::{Router, RouterBuilder, Selection};
pub use runner::{RunStatus, Workflow, WorkflowBuilder, WorkflowInput, WorkflowRunResponse};
pub use step::{Step, StepBuilder};
pub use steps::{Steps, StepsBuilder};
pub use types::{Artifact, StepInput, StepMetrics, StepOutput, WorkflowMetrics};
