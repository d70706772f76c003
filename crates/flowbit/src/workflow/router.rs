use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::Error;

use super::events::{StepIndex, WorkflowEvent};
use super::executable::{
    BoxFuture, Executable, RunContext, StepLike, StepResult, StreamContext, emit_outputs,
    prepare_step, prepare_steps, run_sequence, stream_sequence,
};
use super::types::StepInput;

/// What a router's selector picked.
#[derive(Debug, Clone)]
pub enum Selection {
    Step(StepLike),
    Steps(Vec<StepLike>),
    /// Names looked up among the router's choices. Unknown names are skipped.
    Named(Vec<String>),
    Nothing,
}

impl From<StepLike> for Selection {
    fn from(step: StepLike) -> Self {
        Self::Step(step)
    }
}

impl From<Vec<StepLike>> for Selection {
    fn from(steps: Vec<StepLike>) -> Self {
        Self::Steps(steps)
    }
}

impl From<&str> for Selection {
    fn from(name: &str) -> Self {
        Self::Named(vec![name.to_string()])
    }
}

type SyncSelector = dyn Fn(&StepInput) -> Selection + Send + Sync;
type AsyncSelector = dyn Fn(StepInput) -> BoxFuture<'static, Result<Selection, Error>> + Send + Sync;

#[derive(Clone)]
enum Selector {
    Sync(Arc<SyncSelector>),
    Async(Arc<AsyncSelector>),
}

impl Selector {
    async fn select(&self, input: &StepInput) -> Result<Selection, Error> {
        match self {
            Self::Sync(f) => Ok(f(input)),
            Self::Async(f) => f(input.clone()).await,
        }
    }
}

/// Picks which steps to run at runtime, then runs them sequentially.
pub struct Router {
    name: String,
    description: Option<String>,
    selector: Selector,
    choices: Vec<Arc<dyn Executable>>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let choices: Vec<&str> = self.choices.iter().map(|c| c.name()).collect();
        f.debug_struct("Router")
            .field("name", &self.name)
            .field("choices", &choices)
            .finish()
    }
}

/// Builder for [`Router`].
#[derive(Default)]
pub struct RouterBuilder {
    name: Option<String>,
    description: Option<String>,
    selector: Option<Selector>,
    choices: Vec<StepLike>,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::default()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn choices(&self) -> impl Iterator<Item = &str> {
        self.choices.iter().map(|c| c.name())
    }

    /// Run the selector and normalize whatever it returned.
    async fn route(&self, input: &StepInput) -> Result<Vec<Arc<dyn Executable>>, Error> {
        let selected = match self.selector.select(input).await? {
            Selection::Nothing => Vec::new(),
            Selection::Step(step) => vec![prepare_step(step)?],
            Selection::Steps(steps) => prepare_steps(steps)?,
            Selection::Named(names) => names
                .iter()
                .filter_map(|name| {
                    let found = self.choices.iter().find(|c| c.name() == name.as_str());
                    if found.is_none() {
                        warn!(router = %self.name, step = %name, "selected step is not a router choice, skipping");
                    }
                    found.cloned()
                })
                .collect(),
        };
        let names: Vec<&str> = selected.iter().map(|s| s.name()).collect();
        debug!(router = %self.name, selected = ?names, "router selected steps");
        Ok(selected)
    }
}

impl Executable for Router {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute<'a>(
        &'a self,
        input: &'a StepInput,
        run: &'a RunContext,
    ) -> BoxFuture<'a, Result<StepResult, Error>> {
        Box::pin(async move {
            let selected = self.route(input).await?;
            if selected.is_empty() {
                return Ok(StepResult::Many(Vec::new()));
            }
            let outcome = run_sequence(&self.name, &selected, input, run).await?;
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
            let selected = self.route(input).await?;
            let selected_steps: Vec<String> = selected.iter().map(|s| s.name().to_string()).collect();
            stream.lifecycle(WorkflowEvent::RouterExecutionStarted {
                meta: stream.meta(&self.name, &index),
                selected_steps: selected_steps.clone(),
            });

            let outcome = stream_sequence(&self.name, &selected, input, stream, &index).await?;

            stream.lifecycle(WorkflowEvent::RouterExecutionCompleted {
                meta: stream.meta(&self.name, &index),
                selected_steps,
                executed_steps: outcome.executed,
                step_results: outcome.outputs.clone(),
            });
            emit_outputs(stream, &outcome.outputs);
            Ok(())
        })
    }
}

impl From<Router> for StepLike {
    fn from(router: Router) -> Self {
        StepLike::Executable(Arc::new(router))
    }
}

impl RouterBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn selector(mut self, f: impl Fn(&StepInput) -> Selection + Send + Sync + 'static) -> Self {
        self.selector = Some(Selector::Sync(Arc::new(f)));
        self
    }

    pub fn async_selector<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(StepInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Selection, Error>> + Send + 'static,
    {
        self.selector = Some(Selector::Async(Arc::new(
            move |input: StepInput| -> BoxFuture<'static, Result<Selection, Error>> {
                Box::pin(f(input))
            },
        )));
        self
    }

    pub fn choice(mut self, step: impl Into<StepLike>) -> Self {
        self.choices.push(step.into());
        self
    }

    pub fn choices(mut self, steps: impl IntoIterator<Item = StepLike>) -> Self {
        self.choices.extend(steps);
        self
    }

    /// Build the [`Router`]. Requires a selector.
    pub fn build(self) -> Result<Router, Error> {
        let selector = self
            .selector
            .ok_or_else(|| Error::Config("Router requires a selector".into()))?;
        let name = self.name.unwrap_or_else(|| "router".into());
        if name.trim().is_empty() {
            return Err(Error::Config("Router name must not be empty".into()));
        }
        Ok(Router {
            name,
            description: self.description,
            selector,
            choices: prepare_steps(self.choices)?,
        })
    }
}
