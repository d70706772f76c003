use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// A media artifact (image, video or audio) produced or consumed by a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Base64-encoded payload for inline artifacts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl Artifact {
    pub fn from_url(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: Some(url.into()),
            mime_type: None,
            content: None,
        }
    }

    pub fn inline(
        id: impl Into<String>,
        mime_type: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            url: None,
            mime_type: Some(mime_type.into()),
            content: Some(content.into()),
        }
    }
}

/// `true` for `null` and for the empty string.
pub(crate) fn content_is_empty(content: &Value) -> bool {
    match content {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Render content as text: strings verbatim, `null` as empty, anything else as JSON.
pub(crate) fn content_text(content: &Value) -> String {
    match content {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// StepInput
// ---------------------------------------------------------------------------

/// Everything a step can see when it runs.
///
/// Executables only ever borrow a `StepInput`. The input for the next step is
/// a fresh value built by [`chain_step_input`](super::executable::chain_step_input).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepInput {
    /// The original task. Unchanged for the whole run.
    pub message: Value,
    /// Content of the step that ran immediately before, `null` when none.
    #[serde(default)]
    pub previous_step_content: Value,
    /// Outputs of the steps that ran so far, in execution order.
    #[serde(default)]
    pub previous_step_outputs: IndexMap<String, StepOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub videos: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audio: Vec<Artifact>,
}

impl StepInput {
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

    /// The original message as text. Structured messages are pretty-printed.
    pub fn message_as_string(&self) -> Option<String> {
        match &self.message {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string())),
        }
    }

    pub fn step_output(&self, name: &str) -> Option<&StepOutput> {
        self.previous_step_outputs.get(name)
    }

    /// Content of a named earlier step. For a parallel aggregate this is an
    /// object mapping each child name to its (non-empty) content.
    pub fn step_content(&self, name: &str) -> Option<Value> {
        let output = self.previous_step_outputs.get(name)?;
        match &output.parallel_step_outputs {
            Some(children) => {
                let map = children
                    .iter()
                    .filter(|(_, child)| !content_is_empty(&child.content))
                    .map(|(child_name, child)| (child_name.clone(), child.content.clone()))
                    .collect::<serde_json::Map<_, _>>();
                Some(Value::Object(map))
            }
            None => Some(output.content.clone()),
        }
    }

    /// Every earlier step's content as `=== name ===` blocks.
    pub fn all_previous_content(&self) -> String {
        self.previous_step_outputs
            .iter()
            .filter(|(_, output)| !content_is_empty(&output.content))
            .map(|(name, output)| format!("=== {name} ===\n{}", content_text(&output.content)))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn last_step_content(&self) -> Option<&Value> {
        self.previous_step_outputs
            .last()
            .map(|(_, output)| &output.content)
    }
}

// ---------------------------------------------------------------------------
// StepOutput
// ---------------------------------------------------------------------------

/// What a step produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// `"function"`, `"agent"`, `"team"` or `"parallel"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_name: Option<String>,
    #[serde(default)]
    pub content: Value,
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Request early termination of the enclosing sequence.
    #[serde(default)]
    pub stop: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub videos: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audio: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Value>,
    /// Only set on the aggregate produced by a parallel block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_step_outputs: Option<IndexMap<String, StepOutput>>,
}

fn default_success() -> bool {
    true
}

impl Default for StepOutput {
    fn default() -> Self {
        Self {
            step_name: None,
            step_id: None,
            executor_type: None,
            executor_name: None,
            content: Value::Null,
            success: true,
            error: None,
            stop: false,
            images: Vec::new(),
            videos: Vec::new(),
            audio: Vec::new(),
            metrics: None,
            parallel_step_outputs: None,
        }
    }
}

impl StepOutput {
    pub fn new(content: impl Into<Value>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    /// An output that ends the enclosing sequence once recorded.
    pub fn stop(content: impl Into<Value>) -> Self {
        Self {
            content: content.into(),
            stop: true,
            ..Default::default()
        }
    }

    /// The output recorded in place of a step that returned an error.
    pub fn failed(step_name: &str, error: &Error) -> Self {
        Self {
            step_name: Some(step_name.to_string()),
            content: Value::String(format!("Step {step_name} failed: {error}")),
            success: false,
            error: Some(error.to_string()),
            ..Default::default()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.step_name = Some(name.into());
        self
    }

    pub fn with_metrics(mut self, metrics: Value) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_images(mut self, images: Vec<Artifact>) -> Self {
        self.images = images;
        self
    }

    pub fn with_videos(mut self, videos: Vec<Artifact>) -> Self {
        self.videos = videos;
        self
    }

    pub fn with_audio(mut self, audio: Vec<Artifact>) -> Self {
        self.audio = audio;
        self
    }

    pub fn content_text(&self) -> String {
        content_text(&self.content)
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Typed view of the metrics object attached to a step output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    pub step_name: String,
    pub executor_type: Option<String>,
    pub executor_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_steps: Option<IndexMap<String, StepMetrics>>,
}

impl StepMetrics {
    /// Describe `output`'s metrics. A metrics object that is itself a step
    /// metrics record (it has `metrics` or `parallel_steps`) is unwrapped and
    /// its nested parallel breakdown kept; anything else is kept as-is.
    pub fn from_output(output: &StepOutput, fallback_name: &str) -> Self {
        let (metrics, parallel_steps) = match &output.metrics {
            Some(Value::Object(map))
                if map.contains_key("metrics") || map.contains_key("parallel_steps") =>
            {
                let metrics = map.get("metrics").filter(|m| !m.is_null()).cloned();
                let parallel_steps = map
                    .get("parallel_steps")
                    .and_then(|steps| serde_json::from_value(steps.clone()).ok());
                (metrics, parallel_steps)
            }
            other => (other.clone(), None),
        };
        Self {
            step_name: output
                .step_name
                .clone()
                .unwrap_or_else(|| fallback_name.to_string()),
            executor_type: output.executor_type.clone(),
            executor_name: output.executor_name.clone(),
            metrics,
            parallel_steps,
        }
    }
}

/// Run-level roll-up of every step that reported metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMetrics {
    pub total_steps: usize,
    pub steps: IndexMap<String, StepMetrics>,
}

impl WorkflowMetrics {
    pub fn from_outputs(outputs: &[StepOutput]) -> Self {
        let mut steps = IndexMap::new();
        for (i, output) in outputs.iter().enumerate() {
            let Some(raw) = &output.metrics else {
                continue;
            };
            let fallback = format!("step_{i}");
            let metrics = serde_json::from_value::<StepMetrics>(raw.clone())
                .unwrap_or_else(|_| StepMetrics::from_output(output, &fallback));
            let key = output.step_name.clone().unwrap_or(fallback);
            steps.insert(key, metrics);
        }
        Self {
            total_steps: outputs.len(),
            steps,
        }
    }
}
