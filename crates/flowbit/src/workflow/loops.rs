use std::future::Future;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::error::Error;

use super::events::{StepIndex, WorkflowEvent};
use super::executable::{
    BoxFuture, Executable, RunContext, SequenceOutcome, StepLike, StepResult, StreamContext,
    chain_step_input, emit_outputs, prepare_steps, run_sequence, stream_sequence,
};
use super::types::{StepInput, StepOutput};

type SyncEnd = dyn Fn(&[StepOutput]) -> bool + Send + Sync;
type FallibleEnd = dyn Fn(&[StepOutput]) -> Result<bool, Error> + Send + Sync;
type AsyncEnd = dyn Fn(Vec<StepOutput>) -> BoxFuture<'static, Result<bool, Error>> + Send + Sync;

/// Termination check for a [`Loop`]. Receives the outputs of the iteration
/// that just completed; `true` ends the loop.
#[derive(Clone)]
pub enum EndCondition {
    Sync(Arc<SyncEnd>),
    Fallible(Arc<FallibleEnd>),
    Async(Arc<AsyncEnd>),
}

impl EndCondition {
    async fn evaluate(&self, outputs: &[StepOutput]) -> Result<bool, Error> {
        match self {
            Self::Sync(f) => Ok(f(outputs)),
            Self::Fallible(f) => f(outputs),
            Self::Async(f) => f(outputs.to_vec()).await,
        }
    }
}

/// Repeats its steps until the end condition holds, a step requests stop, or
/// `max_iterations` is reached.
pub struct Loop {
    name: String,
    description: Option<String>,
    steps: Vec<Arc<dyn Executable>>,
    max_iterations: Option<usize>,
    end_condition: Option<EndCondition>,
}

impl std::fmt::Debug for Loop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loop")
            .field("name", &self.name)
            .field("step_count", &self.steps.len())
            .field("max_iterations", &self.max_iterations)
            .field("has_end_condition", &self.end_condition.is_some())
            .finish()
    }
}

/// Builder for [`Loop`].
#[derive(Default)]
pub struct LoopBuilder {
    name: Option<String>,
    description: Option<String>,
    steps: Vec<StepLike>,
    max_iterations: Option<usize>,
    end_condition: Option<EndCondition>,
}

/// Whether another iteration should run after the one that produced `outcome`.
async fn should_continue(
    name: &str,
    iteration: usize,
    end_condition: Option<&EndCondition>,
    outcome: &SequenceOutcome,
) -> bool {
    let mut keep_going = true;
    if outcome.stopped {
        info!(loop_name = %name, iteration, "step requested stop, ending loop");
        keep_going = false;
    }
    if let Some(end) = end_condition {
        match end.evaluate(&outcome.outputs).await {
            Ok(true) => {
                debug!(loop_name = %name, iteration, "end condition met");
                keep_going = false;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(loop_name = %name, iteration, error = %e, "end condition failed, continuing");
            }
        }
    }
    keep_going
}

impl Loop {
    pub fn builder() -> LoopBuilder {
        LoopBuilder::default()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    fn max_iterations(&self, run: &RunContext) -> usize {
        self.max_iterations
            .unwrap_or(run.config.default_max_iterations)
            .max(1)
    }
}

impl Executable for Loop {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute<'a>(
        &'a self,
        input: &'a StepInput,
        run: &'a RunContext,
    ) -> BoxFuture<'a, Result<StepResult, Error>> {
        Box::pin(async move {
            let max_iterations = self.max_iterations(run);
            let mut all_outputs = Vec::new();
            let mut current = input.clone();

            for iteration in 1..=max_iterations {
                debug!(loop_name = %self.name, iteration, max_iterations, "loop iteration");
                let outcome = run_sequence(&self.name, &self.steps, &current, run).await?;
                let keep_going =
                    should_continue(&self.name, iteration, self.end_condition.as_ref(), &outcome)
                        .await;
                current = chain_step_input(input, &outcome.outputs, &IndexMap::new());
                all_outputs.extend(outcome.outputs);
                if !keep_going {
                    break;
                }
            }
            Ok(StepResult::Many(all_outputs))
        })
    }

    fn execute_stream<'a>(
        &'a self,
        input: &'a StepInput,
        stream: &'a StreamContext,
        index: StepIndex,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let max_iterations = self.max_iterations(&stream.run);
            stream.lifecycle(WorkflowEvent::LoopExecutionStarted {
                meta: stream.meta(&self.name, &index),
                max_iterations,
            });

            let mut all_outputs = Vec::new();
            let mut current = input.clone();
            let mut total_iterations = 0;

            for iteration in 1..=max_iterations {
                stream.lifecycle(WorkflowEvent::LoopIterationStarted {
                    meta: stream.meta(&self.name, &index),
                    iteration,
                    max_iterations,
                });
                let outcome =
                    stream_sequence(&self.name, &self.steps, &current, stream, &index).await?;
                total_iterations = iteration;
                let keep_going =
                    should_continue(&self.name, iteration, self.end_condition.as_ref(), &outcome)
                        .await;
                stream.lifecycle(WorkflowEvent::LoopIterationCompleted {
                    meta: stream.meta(&self.name, &index),
                    iteration,
                    max_iterations,
                    iteration_results: outcome.outputs.clone(),
                    should_continue: keep_going && iteration < max_iterations,
                });
                current = chain_step_input(input, &outcome.outputs, &IndexMap::new());
                all_outputs.extend(outcome.outputs);
                if !keep_going {
                    break;
                }
            }

            stream.lifecycle(WorkflowEvent::LoopExecutionCompleted {
                meta: stream.meta(&self.name, &index),
                total_iterations,
                max_iterations,
                all_results: all_outputs.clone(),
            });
            emit_outputs(stream, &all_outputs);
            Ok(())
        })
    }
}

impl From<Loop> for StepLike {
    fn from(lp: Loop) -> Self {
        StepLike::Executable(Arc::new(lp))
    }
}

impl LoopBuilder {
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

    /// Hard bound on iterations (must be >= 1). Falls back to
    /// `engine.default_max_iterations` when unset.
    pub fn max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = Some(n);
        self
    }

    /// End the loop once `f` returns `true` for an iteration's outputs.
    pub fn end_condition(
        mut self,
        f: impl Fn(&[StepOutput]) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.end_condition = Some(EndCondition::Sync(Arc::new(f)));
        self
    }

    /// Like [`end_condition`](Self::end_condition), but an `Err` is logged
    /// and the loop keeps going.
    pub fn try_end_condition(
        mut self,
        f: impl Fn(&[StepOutput]) -> Result<bool, Error> + Send + Sync + 'static,
    ) -> Self {
        self.end_condition = Some(EndCondition::Fallible(Arc::new(f)));
        self
    }

    pub fn async_end_condition<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Vec<StepOutput>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, Error>> + Send + 'static,
    {
        self.end_condition = Some(EndCondition::Async(Arc::new(
            move |outputs: Vec<StepOutput>| -> BoxFuture<'static, Result<bool, Error>> {
                Box::pin(f(outputs))
            },
        )));
        self
    }

    /// Build the [`Loop`]. Requires at least one step.
    pub fn build(self) -> Result<Loop, Error> {
        if self.steps.is_empty() {
            return Err(Error::Config("Loop requires at least one step".into()));
        }
        if self.max_iterations == Some(0) {
            return Err(Error::Config("Loop max_iterations must be at least 1".into()));
        }
        let name = self.name.unwrap_or_else(|| "loop".into());
        if name.trim().is_empty() {
            return Err(Error::Config("Loop name must not be empty".into()));
        }
        Ok(Loop {
            name,
            description: self.description,
            steps: prepare_steps(self.steps)?,
            max_iterations: self.max_iterations,
            end_condition: self.end_condition,
        })
    }
}
