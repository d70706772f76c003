use std::future::Future;
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, error, warn};

use crate::agent::{Agent, AgentRequest, AgentResponse, OnExecutorEvent};
use crate::error::Error;

use super::events::{StepIndex, StreamItem, WorkflowEvent};
use super::executable::{
    AsyncStepFn, BoxFuture, Executable, RunContext, StepLike, StepResult, StreamContext,
    SyncStepFn,
};
use super::types::{StepInput, StepOutput, content_is_empty};

enum Executor {
    Function(Arc<SyncStepFn>),
    AsyncFunction(Arc<AsyncStepFn>),
    Agent(Arc<dyn Agent>),
    Team(Arc<dyn Agent>),
}

impl Executor {
    fn kind(&self) -> &'static str {
        match self {
            Self::Function(_) | Self::AsyncFunction(_) => "function",
            Self::Agent(_) => "agent",
            Self::Team(_) => "team",
        }
    }
}

/// A leaf step: one function, async function, agent or team, with a retry
/// policy.
pub struct Step {
    name: String,
    step_id: String,
    description: Option<String>,
    executor: Executor,
    executor_name: String,
    max_retries: Option<u32>,
    skip_on_failure: bool,
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("executor_type", &self.executor.kind())
            .field("executor_name", &self.executor_name)
            .field("max_retries", &self.max_retries)
            .field("skip_on_failure", &self.skip_on_failure)
            .finish()
    }
}

/// Builder for [`Step`].
#[derive(Default)]
pub struct StepBuilder {
    name: Option<String>,
    step_id: Option<String>,
    description: Option<String>,
    executors: Vec<Executor>,
    max_retries: Option<u32>,
    skip_on_failure: bool,
}

impl Step {
    pub fn builder() -> StepBuilder {
        StepBuilder::default()
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn executor_type(&self) -> &'static str {
        self.executor.kind()
    }

    fn max_retries(&self, run: &RunContext) -> u32 {
        self.max_retries.unwrap_or(run.config.default_max_retries)
    }

    /// Agents see the previous step's content when there is one, otherwise
    /// the original message.
    fn agent_request(&self, input: &StepInput, run: &RunContext) -> AgentRequest {
        let message = if content_is_empty(&input.previous_step_content) {
            input.message.clone()
        } else {
            input.previous_step_content.clone()
        };
        AgentRequest {
            message,
            images: input.images.clone(),
            videos: input.videos.clone(),
            audio: input.audio.clone(),
            session_id: run.session_id.clone(),
            user_id: run.user_id.clone(),
        }
    }

    fn agent_output(&self, response: AgentResponse) -> StepOutput {
        let metrics = response.metrics.map(|metrics| {
            json!({
                "step_name": self.name,
                "executor_type": self.executor.kind(),
                "executor_name": self.executor_name,
                "metrics": metrics,
            })
        });
        StepOutput {
            content: response.content,
            images: response.images,
            videos: response.videos,
            audio: response.audio,
            metrics,
            ..Default::default()
        }
    }

    async fn run_once(
        &self,
        input: &StepInput,
        run: &RunContext,
        on_event: Option<&OnExecutorEvent>,
    ) -> Result<StepOutput, Error> {
        match &self.executor {
            Executor::Function(f) => {
                let f = Arc::clone(f);
                let input = input.clone();
                tokio::task::spawn_blocking(move || f(&input))
                    .await
                    .map_err(|e| Error::Step(format!("step function panicked: {e}")))?
            }
            Executor::AsyncFunction(f) => f(input.clone()).await,
            Executor::Agent(agent) | Executor::Team(agent) => {
                let request = self.agent_request(input, run);
                let response = match on_event {
                    Some(on_event) => agent.run_stream(request, on_event).await?,
                    None => agent.run(request).await?,
                };
                Ok(self.agent_output(response))
            }
        }
    }

    fn stamp(&self, mut output: StepOutput) -> StepOutput {
        output.step_name = Some(self.name.clone());
        output.step_id = Some(self.step_id.clone());
        output.executor_type = Some(self.executor.kind().to_string());
        output.executor_name = Some(self.executor_name.clone());
        output
    }

    /// Run with retries. After the last failed attempt a step that skips on
    /// failure yields a failed output; otherwise the error is returned.
    async fn run_with_retries(
        &self,
        input: &StepInput,
        run: &RunContext,
        on_event: Option<&OnExecutorEvent>,
    ) -> Result<StepOutput, Error> {
        let max_retries = self.max_retries(run);
        let mut attempt = 0u32;
        loop {
            match self.run_once(input, run, on_event).await {
                Ok(output) => {
                    debug!(step = %self.name, attempt, success = output.success, "step finished");
                    return Ok(self.stamp(output));
                }
                Err(e) if e.is_configuration() => return Err(e),
                Err(e) if attempt < max_retries => {
                    attempt += 1;
                    warn!(step = %self.name, attempt, max_retries, error = %e, "step failed, retrying");
                }
                Err(e) if self.skip_on_failure => {
                    warn!(step = %self.name, error = %e, "step failed, skipping");
                    let output = StepOutput {
                        content: Value::String(format!("Step {} failed but skipped", self.name)),
                        success: false,
                        error: Some(e.to_string()),
                        ..Default::default()
                    };
                    return Ok(self.stamp(output));
                }
                Err(e) => {
                    error!(step = %self.name, attempts = attempt + 1, error = %e, "step failed");
                    return Err(e);
                }
            }
        }
    }
}

impl Executable for Step {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute<'a>(
        &'a self,
        input: &'a StepInput,
        run: &'a RunContext,
    ) -> BoxFuture<'a, Result<StepResult, Error>> {
        Box::pin(async move {
            debug!(step = %self.name, executor_type = self.executor.kind(), "executing step");
            let output = self.run_with_retries(input, run, None).await?;
            Ok(StepResult::Single(output))
        })
    }

    fn execute_stream<'a>(
        &'a self,
        input: &'a StepInput,
        stream: &'a StreamContext,
        index: StepIndex,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            debug!(step = %self.name, index = %index, "streaming step");
            stream.lifecycle(WorkflowEvent::StepStarted {
                meta: stream.meta(&self.name, &index),
            });

            // Executor callbacks are 'static, so the closure owns its context.
            let forwarder = {
                let stream = stream.clone();
                let name = self.name.clone();
                let index = index.clone();
                move |payload: Value| {
                    stream.emit(StreamItem::Event(WorkflowEvent::ExecutorEvent {
                        meta: stream.meta(&name, &index),
                        payload,
                    }));
                }
            };
            let forward: &OnExecutorEvent = &forwarder;
            let output = self
                .run_with_retries(input, &stream.run, Some(forward))
                .await?;

            let content = output.content.clone();
            let success = output.success;
            stream.emit(StreamItem::Output(output));
            stream.lifecycle(WorkflowEvent::StepCompleted {
                meta: stream.meta(&self.name, &index),
                content,
                success,
            });
            Ok(())
        })
    }
}

impl From<Step> for StepLike {
    fn from(step: Step) -> Self {
        StepLike::Executable(Arc::new(step))
    }
}

impl StepBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn step_id(mut self, id: impl Into<String>) -> Self {
        self.step_id = Some(id.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Run a synchronous function on tokio's blocking pool.
    pub fn function(
        self,
        f: impl Fn(&StepInput) -> Result<StepOutput, Error> + Send + Sync + 'static,
    ) -> Self {
        self.function_arc(Arc::new(f))
    }

    pub fn function_arc(mut self, f: Arc<SyncStepFn>) -> Self {
        self.executors.push(Executor::Function(f));
        self
    }

    pub fn async_function<F, Fut>(self, f: F) -> Self
    where
        F: Fn(StepInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepOutput, Error>> + Send + 'static,
    {
        self.async_function_arc(Arc::new(
            move |input: StepInput| -> BoxFuture<'static, Result<StepOutput, Error>> {
                Box::pin(f(input))
            },
        ))
    }

    pub fn async_function_arc(mut self, f: Arc<AsyncStepFn>) -> Self {
        self.executors.push(Executor::AsyncFunction(f));
        self
    }

    pub fn agent(mut self, agent: Arc<dyn Agent>) -> Self {
        self.executors.push(Executor::Agent(agent));
        self
    }

    pub fn team(mut self, team: Arc<dyn Agent>) -> Self {
        self.executors.push(Executor::Team(team));
        self
    }

    /// Extra attempts after a failure. Falls back to
    /// `engine.default_max_retries` when unset.
    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }

    /// Turn a final failure into a failed output instead of an error.
    pub fn skip_on_failure(mut self, skip: bool) -> Self {
        self.skip_on_failure = skip;
        self
    }

    /// Build the [`Step`]. Requires exactly one executor.
    pub fn build(mut self) -> Result<Step, Error> {
        if self.executors.len() != 1 {
            return Err(Error::InvalidStep(format!(
                "step {} must have exactly one executor, got {}",
                self.name.as_deref().unwrap_or("<unnamed>"),
                self.executors.len()
            )));
        }
        let executor = self.executors.remove(0);
        let executor_name = match &executor {
            Executor::Agent(agent) | Executor::Team(agent) => agent.name().to_string(),
            Executor::Function(_) | Executor::AsyncFunction(_) => {
                self.name.clone().unwrap_or_default()
            }
        };
        let name = self.name.unwrap_or_else(|| executor_name.clone());
        if name.trim().is_empty() {
            return Err(Error::InvalidStep(format!(
                "{} step requires a name",
                executor.kind()
            )));
        }
        let executor_name = if executor_name.is_empty() {
            name.clone()
        } else {
            executor_name
        };
        Ok(Step {
            step_id: self
                .step_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            description: self.description,
            name,
            executor,
            executor_name,
            max_retries: self.max_retries,
            skip_on_failure: self.skip_on_failure,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentResponse;
    use crate::config::EngineConfig;
    use crate::workflow::executable::tests::{collecting_stream, trace};
    use serde_json::json;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockAgent {
        name: String,
        requests: Mutex<Vec<AgentRequest>>,
    }

    impl MockAgent {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    impl Agent for MockAgent {
        fn name(&self) -> &str {
            &self.name
        }

        fn run(
            &self,
            request: AgentRequest,
        ) -> Pin<Box<dyn Future<Output = Result<AgentResponse, Error>> + Send + '_>> {
            Box::pin(async move {
                let text = format!("{} says: {}", self.name, request.message_text());
                self.requests.lock().expect("requests lock poisoned").push(request);
                Ok(AgentResponse::text(text).with_metrics(json!({"input_tokens": 7})))
            })
        }

        fn run_stream<'a>(
            &'a self,
            request: AgentRequest,
            on_event: &'a OnExecutorEvent,
        ) -> Pin<Box<dyn Future<Output = Result<AgentResponse, Error>> + Send + 'a>> {
            on_event(json!({"delta": "thinking"}));
            self.run(request)
        }
    }

    fn flaky(failures: usize, calls: Arc<AtomicUsize>) -> StepBuilder {
        Step::builder().name("flaky").function(move |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < failures {
                Err(Error::Step(format!("attempt {n} failed")))
            } else {
                Ok(StepOutput::new("recovered"))
            }
        })
    }

    #[test]
    fn build_requires_exactly_one_executor() {
        let err = Step::builder().name("empty").build().unwrap_err();
        assert!(matches!(err, Error::InvalidStep(_)));

        let err = Step::builder()
            .name("double")
            .function(|_| Ok(StepOutput::new("a")))
            .agent(MockAgent::new("writer"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("exactly one executor, got 2"));
    }

    #[test]
    fn function_step_requires_name() {
        let err = Step::builder()
            .function(|_| Ok(StepOutput::new("a")))
            .build()
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid step type: function step requires a name");
    }

    #[test]
    fn agent_step_is_named_after_agent() {
        let step = Step::builder().agent(MockAgent::new("writer")).build().unwrap();
        assert_eq!(step.name(), "writer");
        assert_eq!(step.executor_type(), "agent");
        assert!(!step.step_id().is_empty());
    }

    #[tokio::test]
    async fn function_output_is_stamped() {
        let step = Step::builder()
            .name("upper")
            .step_id("s-1")
            .function(|input| {
                Ok(StepOutput::new(
                    input.message_as_string().unwrap_or_default().to_uppercase(),
                ))
            })
            .build()
            .unwrap();
        let result = step
            .execute(&StepInput::new("hi"), &RunContext::default())
            .await
            .unwrap();
        let StepResult::Single(out) = result else {
            panic!("expected a single output");
        };
        assert_eq!(out.content, json!("HI"));
        assert_eq!(out.step_name.as_deref(), Some("upper"));
        assert_eq!(out.step_id.as_deref(), Some("s-1"));
        assert_eq!(out.executor_type.as_deref(), Some("function"));
        assert_eq!(out.executor_name.as_deref(), Some("upper"));
    }

    #[tokio::test]
    async fn async_function_step_runs() {
        let step = Step::builder()
            .name("later")
            .async_function(|input: StepInput| async move {
                tokio::task::yield_now().await;
                Ok::<_, Error>(StepOutput::new(format!(
                    "got {}",
                    input.message_as_string().unwrap_or_default()
                )))
            })
            .build()
            .unwrap();
        let out = step
            .execute(&StepInput::new("x"), &RunContext::default())
            .await
            .unwrap()
            .into_outputs();
        assert_eq!(out[0].content, json!("got x"));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let step = flaky(2, Arc::clone(&calls)).max_retries(2).build().unwrap();
        let out = step
            .execute(&StepInput::new("x"), &RunContext::default())
            .await
            .unwrap();
        assert_eq!(out.last().unwrap().content, json!("recovered"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_propagate_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let step = flaky(10, Arc::clone(&calls)).max_retries(1).build().unwrap();
        let err = step
            .execute(&StepInput::new("x"), &RunContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Step(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retries_default_to_engine_config() {
        let calls = Arc::new(AtomicUsize::new(0));
        let step = flaky(10, Arc::clone(&calls)).build().unwrap();
        let run = RunContext::new(Arc::new(EngineConfig {
            default_max_retries: 0,
            ..Default::default()
        }));
        assert!(step.execute(&StepInput::new("x"), &run).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn skip_on_failure_yields_failed_output() {
        let calls = Arc::new(AtomicUsize::new(0));
        let step = flaky(10, calls)
            .max_retries(0)
            .skip_on_failure(true)
            .build()
            .unwrap();
        let out = step
            .execute(&StepInput::new("x"), &RunContext::default())
            .await
            .unwrap()
            .into_outputs();
        assert!(!out[0].success);
        assert_eq!(out[0].content, json!("Step flaky failed but skipped"));
        assert_eq!(out[0].error.as_deref(), Some("Step error: attempt 0 failed"));
    }

    #[tokio::test]
    async fn panicking_function_is_an_error() {
        let step = Step::builder()
            .name("panics")
            .max_retries(0)
            .function(|_| panic!("bad input"))
            .build()
            .unwrap();
        let err = step
            .execute(&StepInput::new("x"), &RunContext::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("panicked"), "error: {err}");
    }

    #[tokio::test]
    async fn agent_receives_previous_content_and_session() {
        let agent = MockAgent::new("writer");
        let step = Step::builder().agent(agent.clone()).build().unwrap();
        let run = RunContext::default().with_session("s-9", Some("u-1".into()));

        let mut input = StepInput::new("original");
        input.previous_step_content = json!("draft");
        let out = step.execute(&input, &run).await.unwrap().into_outputs();
        assert_eq!(out[0].content, json!("writer says: draft"));
        assert_eq!(
            out[0].metrics,
            Some(json!({
                "step_name": "writer",
                "executor_type": "agent",
                "executor_name": "writer",
                "metrics": {"input_tokens": 7}
            }))
        );

        step.execute(&StepInput::new("original"), &run).await.unwrap();
        let requests = agent.requests.lock().unwrap();
        assert_eq!(requests[1].message, json!("original"));
        assert_eq!(requests[0].session_id.as_deref(), Some("s-9"));
        assert_eq!(requests[0].user_id.as_deref(), Some("u-1"));
    }

    #[tokio::test]
    async fn team_step_reports_team_executor() {
        let step = Step::builder().team(MockAgent::new("crew")).build().unwrap();
        let out = step
            .execute(&StepInput::new("go"), &RunContext::default())
            .await
            .unwrap()
            .into_outputs();
        assert_eq!(out[0].executor_type.as_deref(), Some("team"));
    }

    #[tokio::test]
    async fn stream_emits_lifecycle_executor_events_and_output() {
        let step = Step::builder().agent(MockAgent::new("writer")).build().unwrap();
        let (stream, items) = collecting_stream(true);
        step.execute_stream(&StepInput::new("go"), &stream, StepIndex::root(3))
            .await
            .unwrap();
        assert_eq!(
            trace(&items),
            vec![
                "step_started",
                "executor_event",
                "output:writer says: go",
                "step_completed"
            ]
        );
        let items = items.lock().unwrap();
        let meta = items[1].as_event().unwrap().meta();
        assert_eq!(meta.step_index, Some(StepIndex::root(3)));
        assert_eq!(meta.step_name.as_deref(), Some("writer"));
    }

    #[tokio::test]
    async fn stream_without_intermediate_steps_skips_lifecycle() {
        let step = Step::builder()
            .name("plain")
            .function(|_| Ok(StepOutput::new("done")))
            .build()
            .unwrap();
        let (stream, items) = collecting_stream(false);
        step.execute_stream(&StepInput::new("go"), &stream, StepIndex::root(0))
            .await
            .unwrap();
        assert_eq!(trace(&items), vec!["output:done"]);
    }
}
