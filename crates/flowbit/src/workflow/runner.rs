//! Top-level workflow driver.
//!
//! A [`Workflow`] owns the top-level steps, feeds each one a [`StepInput`]
//! chained from the outputs before it, and rolls the run up into a
//! [`WorkflowRunResponse`]. Streaming runs deliver [`StreamItem`]s through a
//! tokio channel.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info};

use crate::config::{EngineConfig, FlowbitConfig};
use crate::error::Error;

use super::events::{EventMeta, OnStreamItem, StepIndex, StreamItem, WorkflowEvent};
use super::executable::{
    Executable, RunContext, StepLike, StreamContext, chain_step_input, prepare_steps, step_label,
};
use super::types::{Artifact, StepInput, StepOutput, WorkflowMetrics};

/// What a caller hands to [`Workflow::run`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowInput {
    pub message: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub videos: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audio: Vec<Artifact>,
}

impl WorkflowInput {
    pub fn new(message: impl Into<Value>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_additional_data(mut self, data: Value) -> Self {
        self.additional_data = Some(data);
        self
    }

    pub fn with_images(mut self, images: Vec<Artifact>) -> Self {
        self.images = images;
        self
    }
}

impl From<&str> for WorkflowInput {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for WorkflowInput {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<Value> for WorkflowInput {
    fn from(message: Value) -> Self {
        Self::new(message)
    }
}

impl From<WorkflowInput> for StepInput {
    fn from(input: WorkflowInput) -> Self {
        StepInput {
            message: input.message,
            previous_step_content: Value::Null,
            previous_step_outputs: IndexMap::new(),
            additional_data: input.additional_data,
            images: input.images,
            videos: input.videos,
            audio: input.audio,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Error,
}

/// Result of one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRunResponse {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub status: RunStatus,
    pub content: Value,
    pub step_responses: Vec<StepOutput>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub videos: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audio: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_metrics: Option<WorkflowMetrics>,
    pub created_at: DateTime<Utc>,
}

/// A named list of top-level steps plus the identity stamped onto every run.
#[derive(Clone)]
pub struct Workflow {
    name: String,
    id: String,
    description: Option<String>,
    session_id: Option<String>,
    user_id: Option<String>,
    config: Arc<EngineConfig>,
    steps: Vec<Arc<dyn Executable>>,
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let steps: Vec<&str> = self.steps.iter().map(|s| s.name()).collect();
        f.debug_struct("Workflow")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("steps", &steps)
            .finish()
    }
}

/// Builder for [`Workflow`].
#[derive(Default)]
pub struct WorkflowBuilder {
    name: Option<String>,
    id: Option<String>,
    description: Option<String>,
    session_id: Option<String>,
    user_id: Option<String>,
    config: Option<EngineConfig>,
    steps: Vec<StepLike>,
}

/// Outputs of the top-level steps that ran before the run ended.
struct Progress {
    outputs: Vec<StepOutput>,
}

impl Workflow {
    pub fn builder() -> WorkflowBuilder {
        WorkflowBuilder::default()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    fn run_context(&self) -> RunContext {
        let mut run = RunContext::new(Arc::clone(&self.config)).with_workflow(&self.id, &self.name);
        run.session_id = self.session_id.clone();
        run.user_id = self.user_id.clone();
        run
    }

    /// Apply one top-level step's outputs. Returns `false` once a step
    /// requested stop.
    fn advance(
        &self,
        position: usize,
        outputs: Vec<StepOutput>,
        current: &mut StepInput,
        scoped: &mut IndexMap<String, StepOutput>,
        progress: &mut Progress,
    ) -> bool {
        let name = step_label(self.steps[position].as_ref(), position);
        let stop = outputs.iter().any(|o| o.stop);
        if let Some(last) = outputs.last() {
            scoped.insert(name.clone(), last.clone());
        }
        *current = chain_step_input(current, &outputs, scoped);
        progress.outputs.extend(outputs);
        if stop {
            info!(workflow = %self.name, step = %name, "step requested stop, ending run");
        }
        !stop
    }

    async fn execute_steps(&self, input: StepInput, run: &RunContext) -> Result<Progress, Error> {
        let mut current = input;
        let mut scoped = IndexMap::new();
        let mut progress = Progress { outputs: Vec::new() };
        for (i, step) in self.steps.iter().enumerate() {
            debug!(workflow = %self.name, step = %step.name(), position = i, "running top-level step");
            let outputs = step.execute(&current, run).await?.into_outputs();
            if !self.advance(i, outputs, &mut current, &mut scoped, &mut progress) {
                break;
            }
        }
        Ok(progress)
    }

    async fn stream_steps(&self, input: StepInput, stream: &StreamContext) -> Result<Progress, Error> {
        let mut current = input;
        let mut scoped = IndexMap::new();
        let mut progress = Progress { outputs: Vec::new() };
        for (i, step) in self.steps.iter().enumerate() {
            debug!(workflow = %self.name, step = %step.name(), position = i, "streaming top-level step");
            let outputs = stream_top_level(step.as_ref(), &current, stream, StepIndex::root(i)).await?;
            if !self.advance(i, outputs, &mut current, &mut scoped, &mut progress) {
                break;
            }
        }
        Ok(progress)
    }

    fn response(&self, run: &RunContext, status: RunStatus, content: Value, outputs: Vec<StepOutput>) -> WorkflowRunResponse {
        let mut images = Vec::new();
        let mut videos = Vec::new();
        let mut audio = Vec::new();
        for output in &outputs {
            images.extend(output.images.iter().cloned());
            videos.extend(output.videos.iter().cloned());
            audio.extend(output.audio.iter().cloned());
        }
        let metrics = WorkflowMetrics::from_outputs(&outputs);
        WorkflowRunResponse {
            run_id: run.run_id.clone(),
            workflow_id: run.workflow_id.clone(),
            workflow_name: run.workflow_name.clone(),
            session_id: run.session_id.clone(),
            status,
            content,
            step_responses: outputs,
            images,
            videos,
            audio,
            workflow_metrics: (!metrics.steps.is_empty()).then_some(metrics),
            created_at: Utc::now(),
        }
    }

    fn finish(&self, run: &RunContext, result: Result<Progress, Error>) -> WorkflowRunResponse {
        match result {
            Ok(progress) => {
                let content = progress
                    .outputs
                    .last()
                    .map(|o| o.content.clone())
                    .unwrap_or_else(|| Value::String("No steps executed".into()));
                debug!(workflow = %self.name, run_id = %run.run_id, steps = progress.outputs.len(), "workflow completed");
                self.response(run, RunStatus::Completed, content, progress.outputs)
            }
            Err(e) => {
                error!(workflow = %self.name, run_id = %run.run_id, error = %e, "workflow failed");
                let content = Value::String(format!("Workflow execution failed: {e}"));
                self.response(run, RunStatus::Error, content, Vec::new())
            }
        }
    }

    /// Run every top-level step to completion. Failures are reported through
    /// [`RunStatus::Error`], never as an `Err`.
    pub async fn run(&self, input: impl Into<WorkflowInput>) -> WorkflowRunResponse {
        let run = self.run_context();
        debug!(workflow = %self.name, run_id = %run.run_id, "workflow started");
        let input: WorkflowInput = input.into();
        let result = self.execute_steps(StepInput::from(input), &run).await;
        self.finish(&run, result)
    }

    /// Blocking entry point for callers without a tokio runtime.
    pub fn run_blocking(&self, input: impl Into<WorkflowInput>) -> Result<WorkflowRunResponse, Error> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Runtime(format!("failed to build tokio runtime: {e}")))?;
        Ok(runtime.block_on(self.run(input)))
    }

    /// Stream the run: `WorkflowStarted`, every step's events and outputs as
    /// they happen, then `WorkflowCompleted` or `WorkflowError`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn run_stream(&self, input: impl Into<WorkflowInput>) -> UnboundedReceiverStream<StreamItem> {
        let (tx, rx) = mpsc::unbounded_channel();
        let workflow = self.clone();
        let input: WorkflowInput = input.into();
        let input = StepInput::from(input);
        tokio::spawn(async move {
            let run = workflow.run_context();
            let sink: Arc<OnStreamItem> = Arc::new(move |item: StreamItem| {
                // Receiver dropped: nobody is listening any more.
                let _ = tx.send(item);
            });
            let stream = StreamContext::new(run.clone(), sink);

            stream.emit(StreamItem::Event(WorkflowEvent::WorkflowStarted {
                meta: EventMeta::new(&run, None, None),
            }));
            let result = workflow.stream_steps(input, &stream).await;
            let response = workflow.finish(&run, result);
            let event = match response.status {
                RunStatus::Completed => WorkflowEvent::WorkflowCompleted {
                    meta: EventMeta::new(&run, None, None),
                    content: response.content,
                },
                RunStatus::Error => WorkflowEvent::WorkflowError {
                    meta: EventMeta::new(&run, None, None),
                    error: response.content.as_str().unwrap_or_default().to_string(),
                },
            };
            stream.emit(StreamItem::Event(event));
        });
        UnboundedReceiverStream::new(rx)
    }
}

/// Stream one top-level step: everything goes straight to the caller, and
/// outputs are also kept for chaining.
async fn stream_top_level(
    step: &dyn Executable,
    input: &StepInput,
    stream: &StreamContext,
    index: StepIndex,
) -> Result<Vec<StepOutput>, Error> {
    let captured: Arc<Mutex<Vec<StepOutput>>> = Arc::new(Mutex::new(Vec::new()));
    let buffer = Arc::clone(&captured);
    let parent = stream.clone();
    let sink: Arc<OnStreamItem> = Arc::new(move |item: StreamItem| {
        if let StreamItem::Output(output) = &item {
            buffer
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(output.clone());
        }
        parent.emit(item);
    });
    step.execute_stream(input, &stream.with_sink(sink), index).await?;
    let outputs = std::mem::take(&mut *captured.lock().unwrap_or_else(|e| e.into_inner()));
    Ok(outputs)
}

impl WorkflowBuilder {
    /// Start from a loaded config: engine defaults plus workflow identity.
    pub fn from_config(config: &FlowbitConfig) -> Self {
        let mut builder = Self {
            config: Some(config.engine.clone()),
            ..Default::default()
        };
        if let Some(workflow) = &config.workflow {
            builder.name = workflow.name.clone();
            builder.id = workflow.id.clone();
            builder.session_id = workflow.session_id.clone();
            builder.user_id = workflow.user_id.clone();
        }
        builder
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn step(mut self, step: impl Into<StepLike>) -> Self {
        self.steps.push(step.into());
        self
    }

    pub fn steps(mut self, steps: impl IntoIterator<Item = StepLike>) -> Self {
        self.steps.extend(steps);
        self
    }

    /// Build the [`Workflow`]. Requires at least one step.
    pub fn build(self) -> Result<Workflow, Error> {
        if self.steps.is_empty() {
            return Err(Error::Config("Workflow requires at least one step".into()));
        }
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let name = self.name.unwrap_or_else(|| "workflow".into());
        if name.trim().is_empty() {
            return Err(Error::Config("Workflow name must not be empty".into()));
        }
        Ok(Workflow {
            name,
            id: self.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            description: self.description,
            session_id: self.session_id,
            user_id: self.user_id,
            config: Arc::new(config),
            steps: prepare_steps(self.steps)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::executable::tests::echo;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_stream::StreamExt;

    #[test]
    fn build_requires_steps() {
        let err = Workflow::builder().build().unwrap_err();
        assert!(err.to_string().contains("at least one step"));
    }

    #[test]
    fn build_validates_engine_config() {
        let err = Workflow::builder()
            .step(echo("a"))
            .config(EngineConfig {
                default_max_iterations: 0,
                ..Default::default()
            })
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn run_chains_top_level_steps() {
        let workflow = Workflow::builder()
            .name("chain")
            .session_id("s-1")
            .steps(vec![echo("a"), echo("b")])
            .build()
            .unwrap();
        let response = workflow.run("go").await;
        assert_eq!(response.status, RunStatus::Completed);
        assert_eq!(response.content, json!("b(a(-))"));
        assert_eq!(response.step_responses.len(), 2);
        assert_eq!(response.workflow_name.as_deref(), Some("chain"));
        assert_eq!(response.session_id.as_deref(), Some("s-1"));
        assert!(uuid::Uuid::parse_str(&response.run_id).is_ok());
        assert!(response.workflow_metrics.is_none());
    }

    #[tokio::test]
    async fn each_run_gets_a_fresh_run_id() {
        let workflow = Workflow::builder().step(echo("a")).build().unwrap();
        let first = workflow.run("x").await;
        let second = workflow.run("x").await;
        assert_ne!(first.run_id, second.run_id);
        assert_eq!(first.content, second.content);
    }

    #[tokio::test]
    async fn stop_ends_the_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let workflow = Workflow::builder()
            .step(StepLike::function("halt", |_| Ok(StepOutput::stop("halted"))))
            .step(StepLike::function("never", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(StepOutput::new("never"))
            }))
            .build()
            .unwrap();
        let response = workflow.run("x").await;
        assert_eq!(response.content, json!("halted"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn top_level_failure_becomes_error_status() {
        let workflow = Workflow::builder()
            .name("fragile")
            .config(EngineConfig {
                default_max_retries: 0,
                ..Default::default()
            })
            .step(StepLike::function("boom", |_| Err(Error::Step("kaput".into()))))
            .build()
            .unwrap();
        let response = workflow.run("x").await;
        assert_eq!(response.status, RunStatus::Error);
        assert_eq!(
            response.content,
            json!("Workflow execution failed: Step error: kaput")
        );
    }

    #[tokio::test]
    async fn metrics_are_rolled_up() {
        let workflow = Workflow::builder()
            .step(StepLike::function("measured", |_| {
                Ok(StepOutput::new("m").with_metrics(json!({"tokens": 4})))
            }))
            .step(echo("plain"))
            .build()
            .unwrap();
        let response = workflow.run("x").await;
        let metrics = response.workflow_metrics.unwrap();
        assert_eq!(metrics.total_steps, 2);
        assert_eq!(metrics.steps["measured"].metrics, Some(json!({"tokens": 4})));
    }

    #[tokio::test]
    async fn additional_data_reaches_steps() {
        let workflow = Workflow::builder()
            .step(StepLike::function("reader", |input| {
                Ok(StepOutput::new(
                    input
                        .additional_data
                        .as_ref()
                        .and_then(|d| d.get("user"))
                        .cloned()
                        .unwrap_or_default(),
                ))
            }))
            .build()
            .unwrap();
        let response = workflow
            .run(WorkflowInput::new("x").with_additional_data(json!({"user": "ada"})))
            .await;
        assert_eq!(response.content, json!("ada"));
    }

    #[tokio::test]
    async fn run_stream_brackets_items_with_workflow_events() {
        let workflow = Workflow::builder()
            .name("streamed")
            .steps(vec![echo("a"), echo("b")])
            .build()
            .unwrap();
        let items: Vec<StreamItem> = workflow.run_stream("go").collect().await;
        let kinds: Vec<String> = items
            .iter()
            .map(|item| match item {
                StreamItem::Event(e) => e.kind().to_string(),
                StreamItem::Output(o) => format!("output:{}", o.content_text()),
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                "workflow_started",
                "output:a(-)",
                "output:b(a(-))",
                "workflow_completed"
            ]
        );
        match items.last().and_then(StreamItem::as_event) {
            Some(WorkflowEvent::WorkflowCompleted { content, meta }) => {
                assert_eq!(content, &json!("b(a(-))"));
                assert_eq!(meta.workflow_name.as_deref(), Some("streamed"));
            }
            other => panic!("unexpected final item: {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_stream_reports_failure() {
        let workflow = Workflow::builder()
            .config(EngineConfig {
                default_max_retries: 0,
                ..Default::default()
            })
            .step(StepLike::function("boom", |_| Err(Error::Step("kaput".into()))))
            .build()
            .unwrap();
        let items: Vec<StreamItem> = workflow.run_stream("go").collect().await;
        match items.last().and_then(StreamItem::as_event) {
            Some(WorkflowEvent::WorkflowError { error, .. }) => {
                assert!(error.contains("kaput"));
            }
            other => panic!("unexpected final item: {other:?}"),
        }
    }

    #[test]
    fn run_blocking_drives_its_own_runtime() {
        let workflow = Workflow::builder().step(echo("a")).build().unwrap();
        let response = workflow.run_blocking("x").unwrap();
        assert_eq!(response.content, json!("a(-)"));
    }

    #[test]
    fn from_config_applies_identity_and_engine() {
        let config = FlowbitConfig::from_toml(
            r#"
[engine]
default_max_retries = 1

[workflow]
name = "configured"
id = "wf-7"
user_id = "u-1"
"#,
        )
        .unwrap();
        let workflow = WorkflowBuilder::from_config(&config)
            .step(echo("a"))
            .build()
            .unwrap();
        assert_eq!(workflow.name(), "configured");
        assert_eq!(workflow.id(), "wf-7");
        assert_eq!(workflow.config.default_max_retries, 1);
        assert_eq!(workflow.user_id.as_deref(), Some("u-1"));
    }
}
