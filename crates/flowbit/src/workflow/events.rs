use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::executable::RunContext;
use super::types::StepOutput;

/// Position of a step in the workflow tree: `[2, 1]` is the second child of
/// the third top-level step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepIndex(Vec<usize>);

impl StepIndex {
    pub fn root(index: usize) -> Self {
        Self(vec![index])
    }

    /// Index of this step's `index`-th child.
    pub fn child(&self, index: usize) -> Self {
        let mut path = self.0.clone();
        path.push(index);
        Self(path)
    }

    pub fn path(&self) -> &[usize] {
        &self.0
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

impl From<Vec<usize>> for StepIndex {
    fn from(path: Vec<usize>) -> Self {
        Self(path)
    }
}

impl fmt::Display for StepIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|i| i.to_string()).collect();
        write!(f, "{}", parts.join("."))
    }
}

/// Fields stamped onto every lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<StepIndex>,
    pub created_at: DateTime<Utc>,
}

impl EventMeta {
    pub(crate) fn new(run: &RunContext, step_name: Option<&str>, step_index: Option<&StepIndex>) -> Self {
        Self {
            run_id: run.run_id.clone(),
            workflow_name: run.workflow_name.clone(),
            workflow_id: run.workflow_id.clone(),
            session_id: run.session_id.clone(),
            step_name: step_name.map(str::to_string),
            step_index: step_index.cloned(),
            created_at: Utc::now(),
        }
    }
}

/// Lifecycle events emitted while a workflow streams.
///
/// Composite and step lifecycle events are only emitted when the stream was
/// started with `stream_intermediate_steps`. Workflow-level events, executor
/// events and outputs are always delivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    WorkflowStarted {
        #[serde(flatten)]
        meta: EventMeta,
    },
    WorkflowCompleted {
        #[serde(flatten)]
        meta: EventMeta,
        content: Value,
    },
    WorkflowError {
        #[serde(flatten)]
        meta: EventMeta,
        error: String,
    },

    StepStarted {
        #[serde(flatten)]
        meta: EventMeta,
    },
    StepCompleted {
        #[serde(flatten)]
        meta: EventMeta,
        content: Value,
        success: bool,
    },
    /// An event raised by the agent or team behind a step (content delta,
    /// tool call), forwarded verbatim.
    ExecutorEvent {
        #[serde(flatten)]
        meta: EventMeta,
        payload: Value,
    },

    StepsExecutionStarted {
        #[serde(flatten)]
        meta: EventMeta,
        steps_count: usize,
    },
    StepsExecutionCompleted {
        #[serde(flatten)]
        meta: EventMeta,
        steps_count: usize,
        executed_steps: usize,
        step_results: Vec<StepOutput>,
    },

    ConditionExecutionStarted {
        #[serde(flatten)]
        meta: EventMeta,
        condition_result: bool,
    },
    ConditionExecutionCompleted {
        #[serde(flatten)]
        meta: EventMeta,
        condition_result: bool,
        executed_steps: usize,
        step_results: Vec<StepOutput>,
    },

    LoopExecutionStarted {
        #[serde(flatten)]
        meta: EventMeta,
        max_iterations: usize,
    },
    LoopIterationStarted {
        #[serde(flatten)]
        meta: EventMeta,
        iteration: usize,
        max_iterations: usize,
    },
    LoopIterationCompleted {
        #[serde(flatten)]
        meta: EventMeta,
        iteration: usize,
        max_iterations: usize,
        iteration_results: Vec<StepOutput>,
        should_continue: bool,
    },
    LoopExecutionCompleted {
        #[serde(flatten)]
        meta: EventMeta,
        total_iterations: usize,
        max_iterations: usize,
        all_results: Vec<StepOutput>,
    },

    ParallelExecutionStarted {
        #[serde(flatten)]
        meta: EventMeta,
        parallel_step_count: usize,
    },
    ParallelExecutionCompleted {
        #[serde(flatten)]
        meta: EventMeta,
        parallel_step_count: usize,
        step_results: Vec<StepOutput>,
    },

    RouterExecutionStarted {
        #[serde(flatten)]
        meta: EventMeta,
        selected_steps: Vec<String>,
    },
    RouterExecutionCompleted {
        #[serde(flatten)]
        meta: EventMeta,
        selected_steps: Vec<String>,
        executed_steps: usize,
        step_results: Vec<StepOutput>,
    },
}

impl WorkflowEvent {
    pub fn meta(&self) -> &EventMeta {
        match self {
            Self::WorkflowStarted { meta }
            | Self::WorkflowCompleted { meta, .. }
            | Self::WorkflowError { meta, .. }
            | Self::StepStarted { meta }
            | Self::StepCompleted { meta, .. }
            | Self::ExecutorEvent { meta, .. }
            | Self::StepsExecutionStarted { meta, .. }
            | Self::StepsExecutionCompleted { meta, .. }
            | Self::ConditionExecutionStarted { meta, .. }
            | Self::ConditionExecutionCompleted { meta, .. }
            | Self::LoopExecutionStarted { meta, .. }
            | Self::LoopIterationStarted { meta, .. }
            | Self::LoopIterationCompleted { meta, .. }
            | Self::LoopExecutionCompleted { meta, .. }
            | Self::ParallelExecutionStarted { meta, .. }
            | Self::ParallelExecutionCompleted { meta, .. }
            | Self::RouterExecutionStarted { meta, .. }
            | Self::RouterExecutionCompleted { meta, .. } => meta,
        }
    }

    /// The serialized `event` tag, e.g. `"loop_iteration_started"`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "workflow_started",
            Self::WorkflowCompleted { .. } => "workflow_completed",
            Self::WorkflowError { .. } => "workflow_error",
            Self::StepStarted { .. } => "step_started",
            Self::StepCompleted { .. } => "step_completed",
            Self::ExecutorEvent { .. } => "executor_event",
            Self::StepsExecutionStarted { .. } => "steps_execution_started",
            Self::StepsExecutionCompleted { .. } => "steps_execution_completed",
            Self::ConditionExecutionStarted { .. } => "condition_execution_started",
            Self::ConditionExecutionCompleted { .. } => "condition_execution_completed",
            Self::LoopExecutionStarted { .. } => "loop_execution_started",
            Self::LoopIterationStarted { .. } => "loop_iteration_started",
            Self::LoopIterationCompleted { .. } => "loop_iteration_completed",
            Self::LoopExecutionCompleted { .. } => "loop_execution_completed",
            Self::ParallelExecutionStarted { .. } => "parallel_execution_started",
            Self::ParallelExecutionCompleted { .. } => "parallel_execution_completed",
            Self::RouterExecutionStarted { .. } => "router_execution_started",
            Self::RouterExecutionCompleted { .. } => "router_execution_completed",
        }
    }
}

/// One element of a workflow stream: a lifecycle event or a step output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum StreamItem {
    Event(WorkflowEvent),
    Output(StepOutput),
}

impl StreamItem {
    pub fn as_event(&self) -> Option<&WorkflowEvent> {
        match self {
            Self::Event(event) => Some(event),
            Self::Output(_) => None,
        }
    }

    pub fn as_output(&self) -> Option<&StepOutput> {
        match self {
            Self::Output(output) => Some(output),
            Self::Event(_) => None,
        }
    }
}

/// Callback receiving every stream item as it happens.
///
/// Called synchronously from the executing task; keep handlers fast.
pub type OnStreamItem = dyn Fn(StreamItem) + Send + Sync;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn step_index_child_extends_path() {
        let root = StepIndex::root(2);
        let child = root.child(1);
        assert_eq!(child.path(), &[2, 1]);
        assert_eq!(child.depth(), 2);
        assert_eq!(child.to_string(), "2.1");
        assert_eq!(root.path(), &[2]);
    }

    #[test]
    fn event_serializes_with_tag_and_flattened_meta() {
        let run = RunContext::default()
            .with_workflow("wf-1", "pipeline")
            .with_session("s-1", None);
        let event = WorkflowEvent::ConditionExecutionStarted {
            meta: EventMeta::new(&run, Some("gate"), Some(&StepIndex::from(vec![0, 2]))),
            condition_result: true,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "condition_execution_started");
        assert_eq!(value["condition_result"], true);
        assert_eq!(value["step_name"], "gate");
        assert_eq!(value["step_index"], json!([0, 2]));
        assert_eq!(value["workflow_name"], "pipeline");
        assert_eq!(value["session_id"], "s-1");
        assert_eq!(value["run_id"], json!(run.run_id));
        assert_eq!(event.kind(), "condition_execution_started");
    }

    #[test]
    fn kind_matches_serialized_tag() {
        let run = RunContext::default();
        let events = vec![
            WorkflowEvent::LoopIterationCompleted {
                meta: EventMeta::new(&run, Some("loop"), None),
                iteration: 1,
                max_iterations: 3,
                iteration_results: vec![],
                should_continue: true,
            },
            WorkflowEvent::RouterExecutionStarted {
                meta: EventMeta::new(&run, Some("router"), None),
                selected_steps: vec!["a".into()],
            },
            WorkflowEvent::WorkflowError {
                meta: EventMeta::new(&run, None, None),
                error: "boom".into(),
            },
        ];
        for event in events {
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(value["event"], event.kind());
        }
    }

    #[test]
    fn stream_item_accessors() {
        let item = StreamItem::Output(StepOutput::new("done"));
        assert!(item.as_event().is_none());
        assert_eq!(item.as_output().unwrap().content, json!("done"));

        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value["kind"], "output");
        assert_eq!(value["data"]["content"], "done");
    }
}
