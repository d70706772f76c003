use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use tracing::{debug, error, info};

use crate::agent::Agent;
use crate::config::EngineConfig;
use crate::error::Error;

use super::events::{EventMeta, OnStreamItem, StepIndex, StreamItem, WorkflowEvent};
use super::step::Step;
use super::types::{StepInput, StepOutput};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Synchronous step function. Runs on tokio's blocking pool.
pub type SyncStepFn = dyn Fn(&StepInput) -> Result<StepOutput, Error> + Send + Sync;

/// Asynchronous step function.
pub type AsyncStepFn = dyn Fn(StepInput) -> BoxFuture<'static, Result<StepOutput, Error>> + Send + Sync;

// ---------------------------------------------------------------------------
// Run and stream contexts
// ---------------------------------------------------------------------------

/// Identity and configuration shared by every step of one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub workflow_id: Option<String>,
    pub workflow_name: Option<String>,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub config: Arc<EngineConfig>,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new(Arc::new(EngineConfig::default()))
    }
}

impl RunContext {
    /// A fresh run with a new v4 run id.
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            workflow_id: None,
            workflow_name: None,
            session_id: None,
            user_id: None,
            config,
        }
    }

    pub fn with_workflow(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.workflow_id = Some(id.into());
        self.workflow_name = Some(name.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>, user_id: Option<String>) -> Self {
        self.session_id = Some(session_id.into());
        self.user_id = user_id;
        self
    }
}

/// Streaming counterpart of [`RunContext`]: where items go and how chatty to be.
#[derive(Clone)]
pub struct StreamContext {
    pub run: RunContext,
    /// Emit step and composite lifecycle events.
    pub stream_intermediate_steps: bool,
    sink: Arc<OnStreamItem>,
}

impl std::fmt::Debug for StreamContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamContext")
            .field("run", &self.run)
            .field("stream_intermediate_steps", &self.stream_intermediate_steps)
            .finish()
    }
}

impl StreamContext {
    pub fn new(run: RunContext, sink: Arc<OnStreamItem>) -> Self {
        let stream_intermediate_steps = run.config.stream_intermediate_steps;
        Self {
            run,
            stream_intermediate_steps,
            sink,
        }
    }

    pub fn with_intermediate_steps(mut self, enabled: bool) -> Self {
        self.stream_intermediate_steps = enabled;
        self
    }

    pub fn emit(&self, item: StreamItem) {
        (self.sink)(item);
    }

    /// Emit a lifecycle event if intermediate steps are being streamed.
    pub(crate) fn lifecycle(&self, event: WorkflowEvent) {
        if self.stream_intermediate_steps {
            self.emit(StreamItem::Event(event));
        }
    }

    pub(crate) fn meta(&self, step_name: &str, index: &StepIndex) -> EventMeta {
        EventMeta::new(&self.run, Some(step_name), Some(index))
    }

    pub(crate) fn with_sink(&self, sink: Arc<OnStreamItem>) -> Self {
        Self {
            run: self.run.clone(),
            stream_intermediate_steps: self.stream_intermediate_steps,
            sink,
        }
    }
}

// ---------------------------------------------------------------------------
// Executable
// ---------------------------------------------------------------------------

/// Anything that can run as a step: a leaf [`Step`] or a composite.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility, so steps
/// can be stored as `Arc<dyn Executable>` and nested freely.
pub trait Executable: Send + Sync {
    fn name(&self) -> &str;

    /// Run to completion.
    fn execute<'a>(
        &'a self,
        input: &'a StepInput,
        run: &'a RunContext,
    ) -> BoxFuture<'a, Result<StepResult, Error>>;

    /// Run while pushing events and outputs into `stream`. `index` is this
    /// step's position; children extend it.
    fn execute_stream<'a>(
        &'a self,
        input: &'a StepInput,
        stream: &'a StreamContext,
        index: StepIndex,
    ) -> BoxFuture<'a, Result<(), Error>>;
}

/// Result of executing one step.
#[derive(Debug, Clone)]
pub enum StepResult {
    /// Leaf steps and parallel aggregates.
    Single(StepOutput),
    /// Sequential composites; may be empty.
    Many(Vec<StepOutput>),
}

impl StepResult {
    pub fn into_outputs(self) -> Vec<StepOutput> {
        match self {
            Self::Single(output) => vec![output],
            Self::Many(outputs) => outputs,
        }
    }

    pub fn last(&self) -> Option<&StepOutput> {
        match self {
            Self::Single(output) => Some(output),
            Self::Many(outputs) => outputs.last(),
        }
    }

    pub fn requests_stop(&self) -> bool {
        match self {
            Self::Single(output) => output.stop,
            Self::Many(outputs) => outputs.iter().any(|o| o.stop),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Many(outputs) => outputs.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// StepLike
// ---------------------------------------------------------------------------

/// Anything a composite accepts as a child before normalization.
#[derive(Clone)]
pub enum StepLike {
    Function { name: String, f: Arc<SyncStepFn> },
    AsyncFunction { name: String, f: Arc<AsyncStepFn> },
    Agent(Arc<dyn Agent>),
    Team(Arc<dyn Agent>),
    Executable(Arc<dyn Executable>),
}

impl std::fmt::Debug for StepLike {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (kind, name) = match self {
            Self::Function { name, .. } => ("function", name.as_str()),
            Self::AsyncFunction { name, .. } => ("async_function", name.as_str()),
            Self::Agent(agent) => ("agent", agent.name()),
            Self::Team(team) => ("team", team.name()),
            Self::Executable(exec) => ("executable", exec.name()),
        };
        f.debug_struct("StepLike")
            .field("kind", &kind)
            .field("name", &name)
            .finish()
    }
}

impl StepLike {
    pub fn function(
        name: impl Into<String>,
        f: impl Fn(&StepInput) -> Result<StepOutput, Error> + Send + Sync + 'static,
    ) -> Self {
        Self::Function {
            name: name.into(),
            f: Arc::new(f),
        }
    }

    pub fn async_function<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(StepInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepOutput, Error>> + Send + 'static,
    {
        Self::AsyncFunction {
            name: name.into(),
            f: Arc::new(move |input: StepInput| -> BoxFuture<'static, Result<StepOutput, Error>> {
                Box::pin(f(input))
            }),
        }
    }

    pub fn agent(agent: Arc<dyn Agent>) -> Self {
        Self::Agent(agent)
    }

    pub fn team(team: Arc<dyn Agent>) -> Self {
        Self::Team(team)
    }

    pub fn executable(exec: impl Executable + 'static) -> Self {
        Self::Executable(Arc::new(exec))
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Function { name, .. } | Self::AsyncFunction { name, .. } => name,
            Self::Agent(agent) | Self::Team(agent) => agent.name(),
            Self::Executable(exec) => exec.name(),
        }
    }
}

impl From<Arc<dyn Executable>> for StepLike {
    fn from(exec: Arc<dyn Executable>) -> Self {
        Self::Executable(exec)
    }
}

impl From<Arc<dyn Agent>> for StepLike {
    fn from(agent: Arc<dyn Agent>) -> Self {
        Self::Agent(agent)
    }
}

/// Turn one [`StepLike`] into an executable. Functions, agents and teams are
/// wrapped in a [`Step`]; executables pass through untouched.
pub fn prepare_step(step: StepLike) -> Result<Arc<dyn Executable>, Error> {
    match step {
        StepLike::Executable(exec) => {
            if exec.name().trim().is_empty() {
                return Err(Error::InvalidStep("step requires a non-empty name".into()));
            }
            Ok(exec)
        }
        StepLike::Function { name, f } => {
            let step = Step::builder().name(name).function_arc(f).build()?;
            Ok(Arc::new(step))
        }
        StepLike::AsyncFunction { name, f } => {
            let step = Step::builder().name(name).async_function_arc(f).build()?;
            Ok(Arc::new(step))
        }
        StepLike::Agent(agent) => {
            let step = Step::builder().agent(agent).build()?;
            Ok(Arc::new(step))
        }
        StepLike::Team(team) => {
            let step = Step::builder().team(team).build()?;
            Ok(Arc::new(step))
        }
    }
}

pub fn prepare_steps(steps: Vec<StepLike>) -> Result<Vec<Arc<dyn Executable>>, Error> {
    steps.into_iter().map(prepare_step).collect()
}

// ---------------------------------------------------------------------------
// Chaining
// ---------------------------------------------------------------------------

/// Build the input for the next step from the current one and the outputs
/// of the step that just ran.
///
/// - `previous_step_content` is the last output's content (`null` if none)
/// - `previous_step_outputs` is `input`'s map overlaid with `scoped`
/// - media lists are extended with every output's media
pub fn chain_step_input(
    input: &StepInput,
    outputs: &[StepOutput],
    scoped: &IndexMap<String, StepOutput>,
) -> StepInput {
    let mut next = input.clone();
    next.previous_step_content = outputs
        .last()
        .map(|o| o.content.clone())
        .unwrap_or_default();
    for (name, output) in scoped {
        next.previous_step_outputs.insert(name.clone(), output.clone());
    }
    for output in outputs {
        next.images.extend(output.images.iter().cloned());
        next.videos.extend(output.videos.iter().cloned());
        next.audio.extend(output.audio.iter().cloned());
    }
    next
}

pub(crate) fn step_label(step: &dyn Executable, position: usize) -> String {
    let name = step.name();
    if name.is_empty() {
        format!("step_{position}")
    } else {
        name.to_string()
    }
}

// ---------------------------------------------------------------------------
// Shared sequential runner
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub(crate) struct SequenceOutcome {
    pub outputs: Vec<StepOutput>,
    /// Children that ran, including one that failed.
    pub executed: usize,
    /// A child requested stop.
    pub stopped: bool,
}

/// What happened to one child inside a sequence.
enum ChildOutcome {
    Completed(Vec<StepOutput>),
    Failed(StepOutput),
}

fn contain_child_error(
    owner: &str,
    child: &str,
    result: Result<Vec<StepOutput>, Error>,
) -> Result<ChildOutcome, Error> {
    match result {
        Ok(outputs) => Ok(ChildOutcome::Completed(outputs)),
        Err(e) if e.is_configuration() => Err(e),
        Err(e) => {
            error!(parent = %owner, step = %child, error = %e, "child step failed");
            Ok(ChildOutcome::Failed(StepOutput::failed(child, &e)))
        }
    }
}

/// Apply one child's outcome to the running sequence. Returns `false` when
/// the sequence must end.
fn advance(
    owner: &str,
    child: String,
    outcome: ChildOutcome,
    current: &mut StepInput,
    scoped: &mut IndexMap<String, StepOutput>,
    sequence: &mut SequenceOutcome,
) -> bool {
    sequence.executed += 1;
    let outputs = match outcome {
        ChildOutcome::Completed(outputs) => outputs,
        ChildOutcome::Failed(output) => {
            sequence.outputs.push(output);
            return false;
        }
    };
    let stop = outputs.iter().any(|o| o.stop);
    if let Some(last) = outputs.last() {
        scoped.insert(child.clone(), last.clone());
    }
    *current = chain_step_input(current, &outputs, scoped);
    sequence.outputs.extend(outputs);
    if stop {
        info!(parent = %owner, step = %child, "step requested stop, ending sequence");
        sequence.stopped = true;
        return false;
    }
    true
}

/// Run `steps` one after another, chaining each output into the next input.
/// A child error becomes a failed output and ends the sequence; configuration
/// errors propagate.
pub(crate) async fn run_sequence(
    owner: &str,
    steps: &[Arc<dyn Executable>],
    input: &StepInput,
    run: &RunContext,
) -> Result<SequenceOutcome, Error> {
    let mut current = input.clone();
    let mut scoped = IndexMap::new();
    let mut sequence = SequenceOutcome::default();

    for (i, step) in steps.iter().enumerate() {
        let child = step_label(step.as_ref(), i);
        debug!(parent = %owner, step = %child, position = i, "running child step");
        let result = step.execute(&current, run).await.map(StepResult::into_outputs);
        let outcome = contain_child_error(owner, &child, result)?;
        if !advance(owner, child, outcome, &mut current, &mut scoped, &mut sequence) {
            break;
        }
    }
    Ok(sequence)
}

/// Streaming twin of [`run_sequence`]. Child events are forwarded as they
/// happen; child outputs are collected, not emitted.
pub(crate) async fn stream_sequence(
    owner: &str,
    steps: &[Arc<dyn Executable>],
    input: &StepInput,
    stream: &StreamContext,
    index: &StepIndex,
) -> Result<SequenceOutcome, Error> {
    let mut current = input.clone();
    let mut scoped = IndexMap::new();
    let mut sequence = SequenceOutcome::default();

    for (i, step) in steps.iter().enumerate() {
        let child = step_label(step.as_ref(), i);
        debug!(parent = %owner, step = %child, position = i, "streaming child step");
        let result = stream_child(step.as_ref(), &current, stream, index.child(i)).await;
        let outcome = contain_child_error(owner, &child, result)?;
        if !advance(owner, child, outcome, &mut current, &mut scoped, &mut sequence) {
            break;
        }
    }
    Ok(sequence)
}

/// Stream one child, forwarding its events to the parent sink and capturing
/// its outputs.
pub(crate) async fn stream_child(
    child: &dyn Executable,
    input: &StepInput,
    stream: &StreamContext,
    index: StepIndex,
) -> Result<Vec<StepOutput>, Error> {
    let captured: Arc<Mutex<Vec<StepOutput>>> = Arc::new(Mutex::new(Vec::new()));
    let parent = Arc::clone(&stream.sink);
    let buffer = Arc::clone(&captured);
    let sink: Arc<OnStreamItem> = Arc::new(move |item: StreamItem| match item {
        StreamItem::Output(output) => buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(output),
        event => parent(event),
    });

    child
        .execute_stream(input, &stream.with_sink(sink), index)
        .await?;

    let outputs = std::mem::take(&mut *captured.lock().unwrap_or_else(|e| e.into_inner()));
    Ok(outputs)
}

/// Emit buffered outputs to the parent stream.
pub(crate) fn emit_outputs(stream: &StreamContext, outputs: &[StepOutput]) {
    for output in outputs {
        stream.emit(StreamItem::Output(output.clone()));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::workflow::types::Artifact;

    /// Collects every stream item for assertions.
    pub(crate) fn collecting_stream(intermediate: bool) -> (StreamContext, Arc<Mutex<Vec<StreamItem>>>) {
        let items = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&items);
        let stream = StreamContext::new(
            RunContext::default(),
            Arc::new(move |item: StreamItem| sink.lock().expect("items lock poisoned").push(item)),
        )
        .with_intermediate_steps(intermediate);
        (stream, items)
    }

    /// Event kinds and output contents, in emission order.
    pub(crate) fn trace(items: &Arc<Mutex<Vec<StreamItem>>>) -> Vec<String> {
        items
            .lock()
            .expect("items lock poisoned")
            .iter()
            .map(|item| match item {
                StreamItem::Event(event) => event.kind().to_string(),
                StreamItem::Output(output) => format!("output:{}", output.content_text()),
            })
            .collect()
    }

    pub(crate) fn echo(name: &str) -> StepLike {
        let label = name.to_string();
        StepLike::function(name, move |input| {
            Ok(StepOutput::new(format!(
                "{label}({})",
                input.previous_step_content.as_str().unwrap_or("-")
            )))
        })
    }

    #[test]
    fn chain_step_input_sets_content_and_overlays_map() {
        let mut input = StepInput::new("task");
        input
            .previous_step_outputs
            .insert("a".into(), StepOutput::new("old a"));
        input.images.push(Artifact::from_url("img-0", "http://x/0.png"));

        let outputs = vec![
            StepOutput::new("first"),
            StepOutput::new("second").with_images(vec![Artifact::from_url("img-1", "http://x/1.png")]),
        ];
        let mut scoped = IndexMap::new();
        scoped.insert("a".to_string(), StepOutput::new("new a"));
        scoped.insert("b".to_string(), StepOutput::new("b"));

        let next = chain_step_input(&input, &outputs, &scoped);
        assert_eq!(next.previous_step_content, json!("second"));
        assert_eq!(next.previous_step_outputs["a"].content, json!("new a"));
        assert_eq!(
            next.previous_step_outputs.keys().collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert_eq!(next.images.len(), 2);
        assert_eq!(next.message, json!("task"));
        // the source input is untouched
        assert_eq!(input.previous_step_outputs["a"].content, json!("old a"));
        assert_eq!(input.images.len(), 1);
    }

    #[test]
    fn chain_step_input_with_no_outputs_clears_content() {
        let mut input = StepInput::new("task");
        input.previous_step_content = json!("stale");
        let next = chain_step_input(&input, &[], &IndexMap::new());
        assert!(next.previous_step_content.is_null());
    }

    #[test]
    fn step_result_helpers() {
        let single = StepResult::Single(StepOutput::stop("x"));
        assert!(single.requests_stop());
        assert_eq!(single.len(), 1);

        let many = StepResult::Many(vec![StepOutput::new("a"), StepOutput::new("b")]);
        assert!(!many.requests_stop());
        assert_eq!(many.last().unwrap().content, json!("b"));
        assert_eq!(many.into_outputs().len(), 2);
        assert!(StepResult::Many(vec![]).is_empty());
    }

    #[test]
    fn prepare_step_rejects_unnamed_function() {
        let Err(err) = prepare_step(StepLike::function("", |_| Ok(StepOutput::new("x")))) else {
            panic!("unnamed function step must be rejected");
        };
        assert!(matches!(err, Error::InvalidStep(_)));
        assert!(err.to_string().starts_with("Invalid step type"));
    }

    #[test]
    fn prepare_step_is_idempotent_for_executables() {
        let first = prepare_step(echo("a")).unwrap();
        let again = prepare_step(StepLike::Executable(Arc::clone(&first))).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(again.name(), "a");
    }

    #[tokio::test]
    async fn run_sequence_chains_and_records_scoped_outputs() {
        let steps = prepare_steps(vec![echo("a"), echo("b")]).unwrap();
        let run = RunContext::default();
        let outcome = run_sequence("test", &steps, &StepInput::new("go"), &run)
            .await
            .unwrap();
        let contents: Vec<_> = outcome.outputs.iter().map(|o| o.content_text()).collect();
        assert_eq!(contents, vec!["a(-)", "b(a(-))"]);
        assert_eq!(outcome.executed, 2);
        assert!(!outcome.stopped);
    }

    #[tokio::test]
    async fn run_sequence_stops_on_stop_flag() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let steps = prepare_steps(vec![
            StepLike::function("halt", |_| Ok(StepOutput::stop("halt"))),
            StepLike::function("never", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(StepOutput::new("never"))
            }),
        ])
        .unwrap();
        let outcome = run_sequence("test", &steps, &StepInput::new("go"), &RunContext::default())
            .await
            .unwrap();
        assert!(outcome.stopped);
        assert_eq!(outcome.outputs.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn run_sequence_contains_child_errors() {
        let steps = prepare_steps(vec![
            echo("a"),
            StepLike::executable(
                Step::builder()
                    .name("broken")
                    .max_retries(0)
                    .function(|_| Err(Error::Step("boom".into())))
                    .build()
                    .unwrap(),
            ),
            echo("c"),
        ])
        .unwrap();
        let outcome = run_sequence("test", &steps, &StepInput::new("go"), &RunContext::default())
            .await
            .unwrap();
        assert_eq!(outcome.outputs.len(), 2);
        assert_eq!(outcome.executed, 2);
        let failed = &outcome.outputs[1];
        assert!(!failed.success);
        assert_eq!(failed.content, json!("Step broken failed: Step error: boom"));
    }

    #[tokio::test]
    async fn stream_child_captures_outputs_and_forwards_events() {
        let (stream, items) = collecting_stream(true);
        let step = prepare_step(echo("a")).unwrap();
        let outputs = stream_child(step.as_ref(), &StepInput::new("go"), &stream, StepIndex::root(0))
            .await
            .unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(trace(&items), vec!["step_started", "step_completed"]);
    }
}
