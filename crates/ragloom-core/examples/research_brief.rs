//! End-to-end demo: a research-brief workflow against a stub tool backend.
//!
//! Wires tracing, parses a JSON definition, streams progress events through
//! the broadcast bus, and prints the composed brief.
//!
//! ```text
//! RUST_LOG=info cargo run -p ragloom-core --example research_brief
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::{Value, json};

use ragloom_core::event::{BusSink, EventBus};
use ragloom_core::workflow::definition::parse_workflow_json;
use ragloom_core::workflow::runner::{ExecuteOptions, WorkflowRunner};
use ragloom_core::workflow::tools::{ToolCall, ToolInvoker};
use ragloom_types::workflow::ToolKind;

const DEFINITION: &str = r##"{
    "name": "research-brief",
    "version": "1.0.0",
    "inputs": {
        "query": { "type": "string", "required": true },
        "minScore": { "type": "number", "default": 0.75 }
    },
    "defaults": { "collection": "docs" },
    "steps": [
        {
            "id": "find",
            "tool": "search",
            "inputs": {
                "query": "{{ inputs.query }}",
                "collection": "{{ inputs.collection }}",
                "limit": 8
            }
        },
        {
            "id": "score",
            "tool": "rerank",
            "inputs": { "query": "{{ inputs.query }}", "hits": "{{ find.output.hits }}" }
        },
        {
            "id": "keep",
            "tool": "filter",
            "inputs": {
                "items": "{{ score.output.ranked }}",
                "condition": "item.score > inputs.minScore"
            }
        },
        {
            "id": "brief",
            "tool": "generate",
            "condition": "keep.output.count > 0",
            "inputs": {
                "prompt": "Summarize the passages into a short brief",
                "context": "{{ keep.output.items }}"
            }
        },
        {
            "id": "compose",
            "tool": "template",
            "inputs": {
                "text": "# {{ inputs.query }}\n\n{{ brief.output.text }}\n\nBased on {{ keep.output.count }} passages."
            }
        }
    ],
    "output": "{{ compose.output.text }}"
}"##;

/// Canned stand-in for a retrieval/generation service.
struct DemoBackend;

impl ToolInvoker for DemoBackend {
    fn invoke(&self, call: ToolCall) -> impl Future<Output = anyhow::Result<Value>> + Send {
        let output = match call.tool {
            ToolKind::Search => json!({
                "hits": [
                    { "title": "Compaction strategies", "text": "Tiered and leveled compaction trade write for read amplification.", "score": 0.58 },
                    { "title": "Vector index upkeep", "text": "HNSW graphs degrade without periodic rebuilds.", "score": 0.54 },
                    { "title": "Unrelated release notes", "text": "Version 3.2 adds a dashboard.", "score": 0.31 },
                ]
            }),
            ToolKind::Rerank => json!({
                "ranked": [
                    { "title": "Compaction strategies", "text": "Tiered and leveled compaction trade write for read amplification.", "score": 0.93 },
                    { "title": "Vector index upkeep", "text": "HNSW graphs degrade without periodic rebuilds.", "score": 0.88 },
                    { "title": "Unrelated release notes", "text": "Version 3.2 adds a dashboard.", "score": 0.22 },
                ]
            }),
            ToolKind::Generate => json!({
                "text": "Compaction consolidates segment files to bound read amplification; \
                         vector indexes additionally need periodic graph rebuilds to stay sharp."
            }),
            other => json!({ "tool": other.as_str(), "echo": call.inputs }),
        };
        async move { Ok(output) }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ragloom_observe::tracing_setup::init_tracing(false)?;

    let definition = parse_workflow_json(DEFINITION)?;

    // Stream progress events off the broadcast bus, the way an HTTP
    // front-end would fan them out as SSE.
    let bus = EventBus::new(64);
    let mut rx = bus.subscribe();
    let listener = tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            if let Ok(line) = serde_json::to_string(&event) {
                println!("event: {line}");
            }
        }
    });

    let runner = WorkflowRunner::new(Arc::new(DemoBackend));
    let options = ExecuteOptions {
        inputs: HashMap::from([("query".to_string(), json!("vector index compaction"))]),
        sink: Some(Arc::new(BusSink::new(bus.clone()))),
        ..Default::default()
    };

    let result = runner.execute(&definition, options).await?;

    // All senders are gone once the bus drops, which ends the listener.
    drop(bus);
    listener.await?;

    println!();
    println!(
        "run {} {:?} in {}ms across {} layers",
        result.run_id, result.status, result.total_time_ms, result.layers
    );
    println!();
    println!("{}", result.output.as_str().unwrap_or_default());

    ragloom_observe::tracing_setup::shutdown_tracing();
    Ok(())
}
