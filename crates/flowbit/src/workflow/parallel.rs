use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::{self, JoinSet};
use tracing::{debug, error};

use crate::error::Error;

use super::events::{StepIndex, StreamItem, WorkflowEvent};
use super::executable::{
    BoxFuture, Executable, RunContext, StepLike, StepResult, StreamContext, prepare_steps,
    step_label, stream_child,
};
use super::types::{StepInput, StepMetrics, StepOutput, content_text};

/// Runs every child concurrently against the same input and folds their
/// outputs into one aggregate.
pub struct Parallel {
    name: String,
    description: Option<String>,
    steps: Vec<Arc<dyn Executable>>,
    max_concurrency: Option<usize>,
}

impl std::fmt::Debug for Parallel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parallel")
            .field("name", &self.name)
            .field("step_count", &self.steps.len())
            .field("max_concurrency", &self.max_concurrency)
            .finish()
    }
}

/// Builder for [`Parallel`].
#[derive(Default)]
pub struct ParallelBuilder {
    name: Option<String>,
    description: Option<String>,
    steps: Vec<StepLike>,
    max_concurrency: Option<usize>,
}

impl Parallel {
    pub fn builder() -> ParallelBuilder {
        ParallelBuilder::default()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    fn permits(&self, run: &RunContext) -> usize {
        self.max_concurrency
            .or(run.config.parallel_max_concurrency)
            .unwrap_or(self.steps.len())
            .max(1)
    }

    /// Spawn one task per child and collect their outputs in declaration
    /// order. Failed and panicked children become failed outputs in their own
    /// slot; configuration errors are returned once every child finished.
    async fn fan_out<F, Fut>(&self, run: &RunContext, spawn_child: F) -> Result<Vec<StepOutput>, Error>
    where
        F: Fn(usize, Arc<dyn Executable>) -> Fut,
        Fut: Future<Output = Result<Vec<StepOutput>, Error>> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.permits(run)));
        let mut set = JoinSet::new();
        let mut task_slots: HashMap<task::Id, usize> = HashMap::new();

        for (idx, step) in self.steps.iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let child = spawn_child(idx, Arc::clone(step));
            let handle = set.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => child.await,
                    Err(e) => Err(Error::Runtime(format!("parallel semaphore closed: {e}"))),
                };
                (idx, result)
            });
            task_slots.insert(handle.id(), idx);
        }

        let mut slots: Vec<Option<Vec<StepOutput>>> = vec![None; self.steps.len()];
        let mut config_error: Option<Error> = None;

        while let Some(joined) = set.join_next().await {
            let (idx, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    let Some(&idx) = task_slots.get(&e.id()) else {
                        error!(parallel = %self.name, error = %e, "unknown parallel task failed");
                        continue;
                    };
                    let child = step_label(self.steps[idx].as_ref(), idx);
                    error!(parallel = %self.name, step = %child, error = %e, "parallel task panicked");
                    let err = Error::Step(format!("parallel task panicked: {e}"));
                    slots[idx] = Some(vec![StepOutput::failed(&child, &err)]);
                    continue;
                }
            };
            let child = step_label(self.steps[idx].as_ref(), idx);
            match result {
                Ok(outputs) => slots[idx] = Some(outputs),
                Err(e) if e.is_configuration() => {
                    error!(parallel = %self.name, step = %child, error = %e, "invalid parallel child");
                    config_error.get_or_insert(e);
                    slots[idx] = Some(Vec::new());
                }
                Err(e) => {
                    error!(parallel = %self.name, step = %child, error = %e, "parallel child failed");
                    slots[idx] = Some(vec![StepOutput::failed(&child, &e)]);
                }
            }
        }

        if let Some(e) = config_error {
            return Err(e);
        }

        let outputs = slots
            .into_iter()
            .enumerate()
            .flat_map(|(idx, slot)| {
                slot.unwrap_or_else(|| {
                    let child = step_label(self.steps[idx].as_ref(), idx);
                    let err = Error::Step("parallel task did not report a result".into());
                    vec![StepOutput::failed(&child, &err)]
                })
            })
            .collect();
        Ok(outputs)
    }

    /// Fold child outputs into one aggregate output. `outputs` is the
    /// flattened list, so a composite child contributes one entry per output.
    fn aggregate(&self, outputs: Vec<StepOutput>) -> StepOutput {
        let mut children: IndexMap<String, StepOutput> = IndexMap::new();
        for (i, output) in outputs.iter().enumerate() {
            let name = output.step_name.clone().unwrap_or_else(|| format!("step_{i}"));
            children.insert(unique_key(&children, name), output.clone());
        }
        let metrics = self.metrics(&children);

        let mut aggregate = match outputs.len() {
            0 => StepOutput::new("No parallel steps executed"),
            1 => outputs.into_iter().next().unwrap_or_default(),
            _ => {
                let mut sections = vec!["## Parallel Execution Results".to_string()];
                let mut aggregate = StepOutput::default();
                for (i, child) in outputs.iter().enumerate() {
                    let name = child.step_name.clone().unwrap_or_else(|| format!("step_{i}"));
                    let icon = if child.success { "✅" } else { "❌" };
                    let body = content_text(&child.content);
                    let body = if body.trim().is_empty() {
                        "*(No content)*".to_string()
                    } else {
                        body
                    };
                    sections.push(format!("### {icon} {name}\n{body}"));
                    aggregate.images.extend(child.images.iter().cloned());
                    aggregate.videos.extend(child.videos.iter().cloned());
                    aggregate.audio.extend(child.audio.iter().cloned());
                }
                let failed: Vec<&str> = outputs
                    .iter()
                    .filter(|o| !o.success)
                    .filter_map(|o| o.step_name.as_deref())
                    .collect();
                aggregate.success = outputs.iter().all(|o| o.success);
                if !aggregate.success {
                    aggregate.error = Some(format!("parallel steps failed: {}", failed.join(", ")));
                }
                aggregate.stop = outputs.iter().any(|o| o.stop);
                aggregate.content = Value::String(sections.join("\n\n"));
                aggregate
            }
        };

        aggregate.step_name = Some(self.name.clone());
        aggregate.executor_type = Some("parallel".into());
        aggregate.executor_name = Some(self.name.clone());
        aggregate.metrics = Some(metrics);
        if !children.is_empty() {
            aggregate.parallel_step_outputs = Some(children);
        }
        aggregate
    }

    fn metrics(&self, children: &IndexMap<String, StepOutput>) -> Value {
        let parallel_steps = children
            .iter()
            .map(|(name, child)| (name.clone(), StepMetrics::from_output(child, name)))
            .collect();
        let metrics = StepMetrics {
            step_name: self.name.clone(),
            executor_type: Some("parallel".into()),
            executor_name: Some(self.name.clone()),
            metrics: None,
            parallel_steps: Some(parallel_steps),
        };
        serde_json::to_value(metrics).unwrap_or(Value::Null)
    }
}

/// `name`, or `name_2`, `name_3`, ... when an earlier output already took it.
fn unique_key(taken: &IndexMap<String, StepOutput>, name: String) -> String {
    if !taken.contains_key(&name) {
        return name;
    }
    let mut n = 2;
    loop {
        let key = format!("{name}_{n}");
        if !taken.contains_key(&key) {
            return key;
        }
        n += 1;
    }
}

impl Executable for Parallel {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute<'a>(
        &'a self,
        input: &'a StepInput,
        run: &'a RunContext,
    ) -> BoxFuture<'a, Result<StepResult, Error>> {
        Box::pin(async move {
            debug!(parallel = %self.name, count = self.steps.len(), "executing parallel steps");
            let outputs = self
                .fan_out(run, |_, step| {
                    let input = input.clone();
                    let run = run.clone();
                    async move {
                        step.execute(&input, &run)
                            .await
                            .map(StepResult::into_outputs)
                    }
                })
                .await?;
            debug!(parallel = %self.name, outputs = outputs.len(), "parallel steps finished");
            Ok(StepResult::Single(self.aggregate(outputs)))
        })
    }

    fn execute_stream<'a>(
        &'a self,
        input: &'a StepInput,
        stream: &'a StreamContext,
        index: StepIndex,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            stream.lifecycle(WorkflowEvent::ParallelExecutionStarted {
                meta: stream.meta(&self.name, &index),
                parallel_step_count: self.steps.len(),
            });

            let outputs = self
                .fan_out(&stream.run, |idx, step| {
                    let input = input.clone();
                    let stream = stream.clone();
                    let child_index = index.child(idx);
                    async move { stream_child(step.as_ref(), &input, &stream, child_index).await }
                })
                .await?;
            let aggregate = self.aggregate(outputs);

            stream.emit(StreamItem::Output(aggregate.clone()));
            stream.lifecycle(WorkflowEvent::ParallelExecutionCompleted {
                meta: stream.meta(&self.name, &index),
                parallel_step_count: self.steps.len(),
                step_results: vec![aggregate],
            });
            Ok(())
        })
    }
}

impl From<Parallel> for StepLike {
    fn from(parallel: Parallel) -> Self {
        StepLike::Executable(Arc::new(parallel))
    }
}

impl ParallelBuilder {
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

    /// Cap on concurrently running children. Falls back to
    /// `engine.parallel_max_concurrency`, then to one task per child.
    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = Some(n);
        self
    }

    pub fn build(self) -> Result<Parallel, Error> {
        if self.max_concurrency == Some(0) {
            return Err(Error::Config(
                "Parallel max_concurrency must be at least 1".into(),
            ));
        }
        let name = self.name.unwrap_or_else(|| "parallel".into());
        if name.trim().is_empty() {
            return Err(Error::Config("Parallel name must not be empty".into()));
        }
        Ok(Parallel {
            name,
            description: self.description,
            steps: prepare_steps(self.steps)?,
            max_concurrency: self.max_concurrency,
        })
    }
}
