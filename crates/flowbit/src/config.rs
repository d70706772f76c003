use serde::{Deserialize, Serialize};

use crate::Error;

/// Top-level configuration loaded from `flowbit.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlowbitConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    /// Identity stamped onto runs and streamed events.
    pub workflow: Option<WorkflowConfig>,
}

/// Engine-wide defaults applied when a component does not set its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Extra attempts for a failing step before giving up (default: 3).
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// Iteration bound for loops without an explicit `max_iterations` (default: 3).
    #[serde(default = "default_max_iterations")]
    pub default_max_iterations: usize,
    /// Upper bound on concurrently running parallel branches. `None` runs
    /// every branch at once.
    #[serde(default)]
    pub parallel_max_concurrency: Option<usize>,
    /// Emit composite lifecycle events when streaming (default: false).
    #[serde(default)]
    pub stream_intermediate_steps: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_retries: default_max_retries(),
            default_max_iterations: default_max_iterations(),
            parallel_max_concurrency: None,
            stream_intermediate_steps: false,
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_iterations() -> usize {
    3
}

/// Workflow identity settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkflowConfig {
    pub name: Option<String>,
    pub id: Option<String>,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
}

impl FlowbitConfig {
    /// Parse a TOML string into a `FlowbitConfig`.
    pub fn from_toml(content: &str) -> Result<Self, Error> {
        let config: Self = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML config file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    fn validate(&self) -> Result<(), Error> {
        self.engine.validate()?;
        if let Some(workflow) = &self.workflow {
            if workflow.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
                return Err(Error::Config("workflow.name must not be empty".into()));
            }
        }
        Ok(())
    }
}

impl EngineConfig {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.default_max_iterations == 0 {
            return Err(Error::Config(
                "engine.default_max_iterations must be at least 1".into(),
            ));
        }
        if self.parallel_max_concurrency == Some(0) {
            return Err(Error::Config(
                "engine.parallel_max_concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
