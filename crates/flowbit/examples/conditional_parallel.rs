//! Gate a research fan-out behind a condition, then summarize.
//!
//! The "agents" here are local stand-ins so the example runs offline. Swap in
//! any type implementing `flowbit::Agent` to call a real model.
//!
//! ```bash
//! RUST_LOG=flowbit=debug cargo run -p flowbit --example conditional_parallel -- "rust async runtimes"
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

use flowbit::{
    Agent, AgentRequest, AgentResponse, Condition, EngineConfig, Error, Parallel, StepLike,
    StepOutput, StreamItem, Workflow, WorkflowEvent,
};

/// Pretends to research a topic from one angle.
struct Researcher {
    name: String,
    angle: &'static str,
    delay: Duration,
}

impl Agent for Researcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(
        &self,
        request: AgentRequest,
    ) -> Pin<Box<dyn Future<Output = Result<AgentResponse, Error>> + Send + '_>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            let topic = request.message_text();
            Ok(AgentResponse::text(format!("{} notes on {topic}", self.angle)).with_metrics(
                serde_json::json!({ "elapsed_ms": self.delay.as_millis() as u64 }),
            ))
        })
    }
}

fn researcher(name: &str, angle: &'static str, millis: u64) -> StepLike {
    let agent: Arc<dyn Agent> = Arc::new(Researcher {
        name: name.into(),
        angle,
        delay: Duration::from_millis(millis),
    });
    StepLike::agent(agent)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let topic = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "rust async runtimes".into());

    // 1. Only research topics that mention something technical.
    let gate = Condition::builder()
        .name("is_technical")
        .when(|input| {
            input
                .message_as_string()
                .is_some_and(|m| m.contains("rust") || m.contains("async"))
        })
        .step(StepLike::function("frame", |input| {
            let topic = input.message_as_string().unwrap_or_default();
            Ok(StepOutput::new(topic.to_uppercase()))
        }))
        .build()?;

    // 2. Research from three angles at once, two at a time.
    let research = Parallel::builder()
        .name("research")
        .max_concurrency(2)
        .step(researcher("history", "historical", 120))
        .step(researcher("design", "design", 40))
        .step(researcher("ecosystem", "ecosystem", 80))
        .build()?;

    // 3. Fold the parallel results into one summary.
    let summarize = StepLike::function("summarize", |input| {
        let sections = input
            .step_content("research")
            .and_then(|v| v.as_object().map(|m| m.len()))
            .unwrap_or(0);
        Ok(StepOutput::new(format!(
            "summary of {sections} research sections\n\n{}",
            input.all_previous_content()
        )))
    });

    let workflow = Workflow::builder()
        .name("conditional-research")
        .config(EngineConfig {
            stream_intermediate_steps: true,
            ..Default::default()
        })
        .step(gate)
        .step(research)
        .step(summarize)
        .build()?;

    // 4. Stream the run and print lifecycle events as they arrive.
    let mut stream = workflow.run_stream(topic.as_str());
    while let Some(item) = stream.next().await {
        match item {
            StreamItem::Event(WorkflowEvent::WorkflowCompleted { content, .. }) => {
                println!("\n{}", content.as_str().unwrap_or_default());
            }
            StreamItem::Event(WorkflowEvent::WorkflowError { error, .. }) => {
                eprintln!("workflow failed: {error}");
            }
            StreamItem::Event(event) => {
                let meta = event.meta();
                let index = meta
                    .step_index
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default();
                eprintln!(
                    "[{:>28}] {} {}",
                    event.kind(),
                    index,
                    meta.step_name.as_deref().unwrap_or("")
                );
            }
            StreamItem::Output(output) => {
                eprintln!(
                    "[{:>28}] {} success={}",
                    "output",
                    output.step_name.as_deref().unwrap_or("?"),
                    output.success
                );
            }
        }
    }

    // 5. Run once more without streaming to show the aggregated response.
    let response = workflow.run(topic.as_str()).await;
    if let Some(metrics) = &response.workflow_metrics {
        eprintln!("[metrics] {}", serde_json::to_string_pretty(metrics)?);
    }

    Ok(())
}
