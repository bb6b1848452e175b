//! Basic turn processing example.
//!
//! Run with:
//!   cargo run --example basic_turn
//!
//! Requires OPENAI_API_KEY to be set (or an OpenAI-compatible proxy via
//! OPENAI_BASE_URL). Runs in ephemeral mode: no users file needed.

use std::sync::Arc;
use switchboard_core::{
    AppConfig, FunctionTool, ParamKind, PluginRegistry, System, ToolParam, TurnEvent, TurnRequest,
};

fn build_registry() -> PluginRegistry {
    let mut registry = PluginRegistry::new();

    // A tool the model can call; yields a progress update before returning.
    registry.register_tool(Arc::new(FunctionTool::new(
        "get_weather",
        "Get the current weather for a location.",
        vec![ToolParam::required("location", ParamKind::String, "City name")],
        |invocation| async move {
            let location = invocation.arguments["location"]
                .as_str()
                .unwrap_or("somewhere")
                .to_string();
            Ok(serde_json::json!({ "location": location, "temp_c": 20 }))
        },
    )));

    registry
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config = AppConfig::from_env();
    config.ephemeral = true;

    let system = System::start(config, build_registry())?;

    let mut rx = system
        .process_message(TurnRequest {
            user_id: "demo".to_string(),
            content: "What's the weather in Rotterdam?".to_string(),
            thread_id: None,
            model: Some("gpt-4o-mini".to_string()),
            system_prompt: None,
        })
        .await?;

    while let Some(event) = rx.recv().await {
        match event {
            TurnEvent::ThreadId { thread_id, .. } => println!("thread: {thread_id}"),
            TurnEvent::ThinkingTokens { content, .. } => print!("[thinking] {content}"),
            TurnEvent::MessageTokens { content, .. } => print!("{content}"),
            TurnEvent::ToolUpdate { content, .. } => println!("\n{content}"),
            TurnEvent::StreamEnd { .. } => println!("\n--- done ---"),
            TurnEvent::Error { message, .. } => println!("\nerror: {message}"),
        }
    }

    system.shutdown().await;
    Ok(())
}
