use std::sync::Arc;

use tracing::debug;

use crate::error::Error;

use super::events::{StepIndex, WorkflowEvent};
use super::executable::{
    BoxFuture, Executable, RunContext, StepLike, StepResult, StreamContext, emit_outputs,
    prepare_steps, run_sequence, stream_sequence,
};
use super::types::StepInput;

/// A named sequential pipeline. Each child sees the previous child's output.
pub struct Steps {
    name: String,
    description: Option<String>,
    steps: Vec<Arc<dyn Executable>>,
}

impl std::fmt::Debug for Steps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Steps")
            .field("name", &self.name)
            .field("step_count", &self.steps.len())
            .finish()
    }
}

/// Builder for [`Steps`].
#[derive(Default)]
pub struct StepsBuilder {
    name: Option<String>,
    description: Option<String>,
    steps: Vec<StepLike>,
}

impl Steps {
    pub fn builder() -> StepsBuilder {
        StepsBuilder::default()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

impl Executable for Steps {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute<'a>(
        &'a self,
        input: &'a StepInput,
        run: &'a RunContext,
    ) -> BoxFuture<'a, Result<StepResult, Error>> {
        Box::pin(async move {
            debug!(steps = %self.name, count = self.steps.len(), "executing steps");
            let outcome = run_sequence(&self.name, &self.steps, input, run).await?;
            debug!(steps = %self.name, executed = outcome.executed, "steps finished");
            Ok(StepResult::Many(outcome.outputs))
        })
    }

    fn execute_stream<'a>(
        &'a self,
        input: &'a StepInput,
        stream: &'a StreamContext,
        index: StepIndex,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            stream.lifecycle(WorkflowEvent::StepsExecutionStarted {
                meta: stream.meta(&self.name, &index),
                steps_count: self.steps.len(),
            });
            let outcome = stream_sequence(&self.name, &self.steps, input, stream, &index).await?;
            stream.lifecycle(WorkflowEvent::StepsExecutionCompleted {
                meta: stream.meta(&self.name, &index),
                steps_count: self.steps.len(),
                executed_steps: outcome.executed,
                step_results: outcome.outputs.clone(),
            });
            emit_outputs(stream, &outcome.outputs);
            Ok(())
        })
    }
}

impl From<Steps> for StepLike {
    fn from(steps: Steps) -> Self {
        StepLike::Executable(Arc::new(steps))
    }
}

impl StepsBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
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

    pub fn build(self) -> Result<Steps, Error> {
        let name = self.name.unwrap_or_else(|| "steps".into());
        if name.trim().is_empty() {
            return Err(Error::Config("Steps name must not be empty".into()));
        }
        Ok(Steps {
            name,
            description: self.description,
            steps: prepare_steps(self.steps)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::executable::tests::{collecting_stream, echo, trace};
    use crate::workflow::types::StepOutput;
    use serde_json::json;

    #[tokio::test]
    async fn runs_children_in_order_with_chaining() {
        let steps = Steps::builder()
            .name("pipeline")
            .step(echo("a"))
            .step(echo("b"))
            .step(echo("c"))
            .build()
            .unwrap();
        let outputs = steps
            .execute(&StepInput::new("go"), &RunContext::default())
            .await
            .unwrap()
            .into_outputs();
        assert_eq!(outputs.len(), 3);
        assert_eq!(outputs[2].content, json!("c(b(a(-)))"));
    }

    #[tokio::test]
    async fn later_children_see_earlier_outputs_by_name() {
        let steps = Steps::builder()
            .step(echo("first"))
            .step(StepLike::function("reader", |input| {
                Ok(StepOutput::new(
                    input.step_content("first").unwrap_or_default(),
                ))
            }))
            .build()
            .unwrap();
        let outputs = steps
            .execute(&StepInput::new("go"), &RunContext::default())
            .await
            .unwrap()
            .into_outputs();
        assert_eq!(outputs[1].content, json!("first(-)"));
    }

    #[test]
    fn rejects_blank_name() {
        let err = Steps::builder().name(" ").build().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn stream_emits_started_children_completed_then_outputs() {
        let steps = Steps::builder()
            .name("pipeline")
            .steps(vec![echo("a"), echo("b")])
            .build()
            .unwrap();
        let (stream, items) = collecting_stream(true);
        steps
            .execute_stream(&StepInput::new("go"), &stream, StepIndex::root(0))
            .await
            .unwrap();
        assert_eq!(
            trace(&items),
            vec![
                "steps_execution_started",
                "step_started",
                "step_completed",
                "step_started",
                "step_completed",
                "steps_execution_completed",
                "output:a(-)",
                "output:b(a(-))",
            ]
        );
        let items = items.lock().unwrap();
        let child_meta = items[3].as_event().unwrap().meta();
        assert_eq!(child_meta.step_index, Some(StepIndex::from(vec![0, 1])));
    }
}
