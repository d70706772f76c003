use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Error;

use super::events::{StepIndex, WorkflowEvent};
use super::executable::{
    BoxFuture, Executable, RunContext, StepLike, StepResult, StreamContext, emit_outputs,
    prepare_steps, run_sequence, stream_sequence,
};
use super::types::StepInput;

type SyncPredicate = dyn Fn(&StepInput) -> bool + Send + Sync;
type AsyncPredicate = dyn Fn(StepInput) -> BoxFuture<'static, Result<bool, Error>> + Send + Sync;
type ValuePredicate = dyn Fn(&StepInput) -> Value + Send + Sync;

/// Decides whether a [`Condition`]'s steps run.
#[derive(Clone)]
pub enum Evaluator {
    Literal(bool),
    Sync(Arc<SyncPredicate>),
    /// Errors propagate to the caller.
    Async(Arc<AsyncPredicate>),
    /// Loosely typed predicate. Anything other than a JSON boolean counts as
    /// false.
    Value(Arc<ValuePredicate>),
}

impl std::fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Literal(b) => f.debug_tuple("Literal").field(b).finish(),
            Self::Sync(_) => f.write_str("Sync(..)"),
            Self::Async(_) => f.write_str("Async(..)"),
            Self::Value(_) => f.write_str("Value(..)"),
        }
    }
}

impl From<bool> for Evaluator {
    fn from(value: bool) -> Self {
        Self::Literal(value)
    }
}

impl Evaluator {
    pub fn sync(f: impl Fn(&StepInput) -> bool + Send + Sync + 'static) -> Self {
        Self::Sync(Arc::new(f))
    }

    pub fn async_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(StepInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, Error>> + Send + 'static,
    {
        Self::Async(Arc::new(
            move |input: StepInput| -> BoxFuture<'static, Result<bool, Error>> {
                Box::pin(f(input))
            },
        ))
    }

    pub fn value(f: impl Fn(&StepInput) -> Value + Send + Sync + 'static) -> Self {
        Self::Value(Arc::new(f))
    }

    async fn evaluate(&self, condition: &str, input: &StepInput) -> Result<bool, Error> {
        match self {
            Self::Literal(b) => Ok(*b),
            Self::Sync(f) => Ok(f(input)),
            Self::Async(f) => f(input.clone()).await,
            Self::Value(f) => match f(input) {
                Value::Bool(b) => Ok(b),
                other => {
                    warn!(
                        condition = %condition,
                        value = %other,
                        "evaluator returned a non-boolean value, treating as false"
                    );
                    Ok(false)
                }
            },
        }
    }
}

/// Runs its steps sequentially only when the evaluator says so.
pub struct Condition {
    name: String,
    description: Option<String>,
    evaluator: Evaluator,
    steps: Vec<Arc<dyn Executable>>,
}

impl std::fmt::Debug for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Condition")
            .field("name", &self.name)
            .field("evaluator", &self.evaluator)
            .field("step_count", &self.steps.len())
            .finish()
    }
}

/// Builder for [`Condition`].
#[derive(Default)]
pub struct ConditionBuilder {
    name: Option<String>,
    description: Option<String>,
    evaluator: Option<Evaluator>,
    steps: Vec<StepLike>,
}

impl Condition {
    pub fn builder() -> ConditionBuilder {
        ConditionBuilder::default()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

impl Executable for Condition {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute<'a>(
        &'a self,
        input: &'a StepInput,
        run: &'a RunContext,
    ) -> BoxFuture<'a, Result<StepResult, Error>> {
        Box::pin(async move {
            let passed = self.evaluator.evaluate(&self.name, input).await?;
            debug!(condition = %self.name, result = passed, "condition evaluated");
            if !passed {
                return Ok(StepResult::Many(Vec::new()));
            }
            let outcome = run_sequence(&self.name, &self.steps, input, run).await?;
            debug!(condition = %self.name, executed = outcome.executed, "condition finished");
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
            let passed = self.evaluator.evaluate(&self.name, input).await?;
            debug!(condition = %self.name, result = passed, "condition evaluated");
            stream.lifecycle(WorkflowEvent::ConditionExecutionStarted {
                meta: stream.meta(&self.name, &index),
                condition_result: passed,
            });

            let (outputs, executed) = if passed {
                let outcome =
                    stream_sequence(&self.name, &self.steps, input, stream, &index).await?;
                (outcome.outputs, outcome.executed)
            } else {
                (Vec::new(), 0)
            };

            stream.lifecycle(WorkflowEvent::ConditionExecutionCompleted {
                meta: stream.meta(&self.name, &index),
                condition_result: passed,
                executed_steps: executed,
                step_results: outputs.clone(),
            });
            emit_outputs(stream, &outputs);
            Ok(())
        })
    }
}

impl From<Condition> for StepLike {
    fn from(condition: Condition) -> Self {
        StepLike::Executable(Arc::new(condition))
    }
}

impl ConditionBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn evaluator(mut self, evaluator: impl Into<Evaluator>) -> Self {
        self.evaluator = Some(evaluator.into());
        self
    }

    /// Shorthand for a synchronous predicate.
    pub fn when(self, f: impl Fn(&StepInput) -> bool + Send + Sync + 'static) -> Self {
        self.evaluator(Evaluator::sync(f))
    }

    pub fn step(mut self, step: impl Into<StepLike>) -> Self {
        self.steps.push(step.into());
        self
    }

    pub fn steps(mut self, steps: impl IntoIterator<Item = StepLike>) -> Self {
        self.steps.extend(steps);
        self
    }

    /// Build the [`Condition`]. Requires an evaluator.
    pub fn build(self) -> Result<Condition, Error> {
        let evaluator = self
            .evaluator
            .ok_or_else(|| Error::Config("Condition requires an evaluator".into()))?;
        let name = self.name.unwrap_or_else(|| "condition".into());
        if name.trim().is_empty() {
            return Err(Error::Config("Condition name must not be empty".into()));
        }
        Ok(Condition {
            name,
            description: self.description,
            evaluator,
            steps: prepare_steps(self.steps)?,
        })
    }
}
