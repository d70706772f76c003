use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::workflow::types::Artifact;

/// Input handed to an agent or team by a workflow step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentRequest {
    /// Either the previous step's content or the workflow's original message.
    pub message: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub videos: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audio: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl AgentRequest {
    /// The message rendered as text. Structured messages are pretty-printed JSON.
    pub fn message_text(&self) -> String {
        match &self.message {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
        }
    }
}

/// Output of an agent or team run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentResponse {
    pub content: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub videos: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audio: Vec<Artifact>,
    /// Provider-reported usage (tokens, latency). Opaque to the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Value>,
}

impl AgentResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Value::String(content.into()),
            ..Default::default()
        }
    }

    pub fn with_metrics(mut self, metrics: Value) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Callback receiving executor-level events (content deltas, tool calls)
/// while an agent streams.
pub type OnExecutorEvent = dyn Fn(Value) + Send + Sync;

/// An LLM agent or team that a workflow step can drive.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility, so agents
/// can be stored as `Arc<dyn Agent>`. Teams implement the same trait and are
/// registered with `Step::builder().team(..)`.
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> Option<&str> {
        None
    }

    fn run(
        &self,
        request: AgentRequest,
    ) -> Pin<Box<dyn Future<Output = Result<AgentResponse, Error>> + Send + '_>>;

    /// Streaming run. Implementations push intermediate events through
    /// `on_event`; the default falls back to [`Agent::run`] without events.
    fn run_stream<'a>(
        &'a self,
        request: AgentRequest,
        on_event: &'a OnExecutorEvent,
    ) -> Pin<Box<dyn Future<Output = Result<AgentResponse, Error>> + Send + 'a>> {
        let _ = on_event;
        self.run(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    struct Echo;

    impl Agent for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn run(
            &self,
            request: AgentRequest,
        ) -> Pin<Box<dyn Future<Output = Result<AgentResponse, Error>> + Send + '_>> {
            Box::pin(async move { Ok(AgentResponse::text(request.message_text())) })
        }
    }

    #[test]
    fn message_text_renders_strings_and_json() {
        let req = AgentRequest {
            message: json!("plain"),
            ..Default::default()
        };
        assert_eq!(req.message_text(), "plain");

        let req = AgentRequest {
            message: json!({"topic": "rust"}),
            ..Default::default()
        };
        assert!(req.message_text().contains("\"topic\": \"rust\""));

        assert_eq!(AgentRequest::default().message_text(), "");
    }

    #[tokio::test]
    async fn default_run_stream_delegates_to_run() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let on_event = move |e: Value| sink.lock().expect("events lock").push(e);

        let req = AgentRequest {
            message: json!("hi"),
            ..Default::default()
        };
        let resp = Echo.run_stream(req, &on_event).await.unwrap();
        assert_eq!(resp.content, json!("hi"));
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn response_builders() {
        let resp = AgentResponse::text("done").with_metrics(json!({"input_tokens": 10}));
        assert_eq!(resp.content, json!("done"));
        assert_eq!(resp.metrics.unwrap()["input_tokens"], 10);
        assert!(Echo.description().is_none());
    }
}
