pub mod agent;
pub mod config;
pub mod error;
pub mod workflow;

pub use agent::{Agent, AgentRequest, AgentResponse, OnExecutorEvent};
pub use config::{EngineConfig, FlowbitConfig, WorkflowConfig};
pub use error::Error;
pub use workflow::{
    Artifact, Condition, EndCondition, Evaluator, EventMeta, Executable, Loop, OnStreamItem,
    Parallel, RunContext, RunStatus, Router, Selection, Step, StepIndex, StepInput, StepLike,
    StepMetrics, StepOutput, StepResult, Steps, StreamContext, StreamItem, Workflow,
    WorkflowEvent, WorkflowInput, WorkflowMetrics, WorkflowRunResponse, chain_step_input,
};
