use crate::context::message::ContextMessage;
use crate::model::event::{ModelEvent, ToolCallDelta};
use crate::plugins::roles::ModelPlugin;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Default model client speaking the OpenAI-compatible chat-completions
/// protocol (works against LiteLLM-style proxies for multi-provider
/// setups). Owns the HTTP connection; the orchestrator only sees the event
/// stream.
pub struct OpenAiModelClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl OpenAiModelClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn wire_messages(
        messages: &[ContextMessage],
        system_prompt: Option<&str>,
    ) -> Vec<Value> {
        let mut wire = Vec::with_capacity(messages.len() + 1);
        if let Some(prompt) = system_prompt {
            wire.push(json!({ "role": "system", "content": prompt }));
        }
        for message in messages {
            wire.push(message.stripped().to_value());
        }
        wire
    }

    /// Fold non-streamed fields of a chunk into the accumulated metadata;
    /// first non-null value wins.
    fn capture_metadata(metadata: &mut Map<String, Value>, chunk: &Value) {
        if let Value::Object(fields) = chunk {
            for (key, value) in fields {
                if key == "choices" || value.is_null() {
                    continue;
                }
                if !metadata.contains_key(key) || metadata[key].is_null() {
                    metadata.insert(key.clone(), value.clone());
                }
            }
        }
        if let Some(finish) = chunk
            .pointer("/choices/0/finish_reason")
            .filter(|v| !v.is_null())
        {
            metadata
                .entry("finish_reason".to_string())
                .or_insert_with(|| finish.clone());
        }
    }

    async fn stream_chunks(
        &self,
        body: Value,
        tx: &mpsc::Sender<ModelEvent>,
    ) -> Result<Map<String, Value>> {
        let url = format!(
            "{}/chat/completions",
            self.base_url.trim_end_matches('/')
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("request to model provider failed")?
            .error_for_status()
            .context("model provider returned an error status")?;

        let mut metadata = Map::new();
        let mut byte_stream = response.bytes_stream();
        let mut leftover = String::new();

        while let Some(chunk) = byte_stream.next().await {
            let bytes = chunk.context("error reading model stream")?;
            leftover.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(pos) = leftover.find('\n') {
                let line = leftover[..pos].trim_end_matches('\r').to_string();
                leftover.drain(..=pos);

                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    return Ok(metadata);
                }
                let parsed: Value = match serde_json::from_str(data) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("skipping unparseable stream line: {e}");
                        continue;
                    }
                };

                Self::capture_metadata(&mut metadata, &parsed);
                let delta = parsed.pointer("/choices/0/delta");

                if let Some(delta) = delta {
                    // Reasoning tokens come first within a chunk.
                    let reasoning = delta
                        .get("reasoning")
                        .or_else(|| delta.get("reasoning_content"))
                        .and_then(Value::as_str)
                        .filter(|s| !s.is_empty());
                    if let Some(content) = reasoning {
                        if tx
                            .send(ModelEvent::ThinkingTokens { content: content.to_string() })
                            .await
                            .is_err()
                        {
                            return Ok(metadata);
                        }
                    }

                    if let Some(Value::Array(tool_calls)) = delta.get("tool_calls") {
                        let calls: Vec<ToolCallDelta> = tool_calls
                            .iter()
                            .filter_map(|c| serde_json::from_value(c.clone()).ok())
                            .collect();
                        if !calls.is_empty()
                            && tx.send(ModelEvent::ToolCalls { calls }).await.is_err()
                        {
                            return Ok(metadata);
                        }
                    }

                    if let Some(content) = delta
                        .get("content")
                        .and_then(Value::as_str)
                        .filter(|s| !s.is_empty())
                    {
                        if tx
                            .send(ModelEvent::MessageTokens { content: content.to_string() })
                            .await
                            .is_err()
                        {
                            return Ok(metadata);
                        }
                    }
                }
            }
        }
        Ok(metadata)
    }
}

#[async_trait]
impl ModelPlugin for OpenAiModelClient {
    async fn available_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/models", self.base_url.trim_end_matches('/'));
        let response: Value = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .context("model listing request failed")?
            .error_for_status()?
            .json()
            .await?;

        let models: Vec<String> = response["data"]
            .as_array()
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m["id"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        info!("retrieved {} models from provider", models.len());
        Ok(models)
    }

    async fn generate_response(
        &self,
        messages: Vec<ContextMessage>,
        model: &str,
        system_prompt: Option<&str>,
        tools: &[Value],
        tx: mpsc::Sender<ModelEvent>,
    ) -> Result<()> {
        let wire = Self::wire_messages(&messages, system_prompt);
        debug!(
            "generating response with model {model}: {} messages, {} tools",
            wire.len(),
            tools.len()
        );

        let mut body = json!({
            "model": model,
            "messages": wire,
            "temperature": 0.7,
            "max_tokens": 2000,
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.to_vec());
        }

        let metadata = self.stream_chunks(body, &tx).await?;
        let _ = tx
            .send(ModelEvent::StreamEnd {
                metadata: Value::Object(metadata),
            })
            .await;
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::message::ContextRole;

    #[test]
    fn wire_messages_prepend_system_prompt_and_strip_ids() {
        let mut msg = ContextMessage::new(ContextRole::User, "hi");
        msg.id = Some("internal".to_string());
        let wire = OpenAiModelClient::wire_messages(&[msg], Some("be brief"));

        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0]["role"], json!("system"));
        assert_eq!(wire[1]["role"], json!("user"));
        assert!(wire[1].get("_id").is_none());
    }

    #[test]
    fn metadata_keeps_first_non_null_values() {
        let mut metadata = Map::new();
        OpenAiModelClient::capture_metadata(
            &mut metadata,
            &json!({"id": "resp-1", "usage": null, "choices": []}),
        );
        OpenAiModelClient::capture_metadata(
            &mut metadata,
            &json!({"id": "resp-other", "usage": {"total_tokens": 9}}),
        );

        assert_eq!(metadata["id"], json!("resp-1"));
        assert_eq!(metadata["usage"]["total_tokens"], json!(9));
        assert!(!metadata.contains_key("choices"));
    }

    #[test]
    fn finish_reason_is_captured_from_choices() {
        let mut metadata = Map::new();
        OpenAiModelClient::capture_metadata(
            &mut metadata,
            &json!({"choices": [{"finish_reason": "tool_calls", "delta": {}}]}),
        );
        assert_eq!(metadata["finish_reason"], json!("tool_calls"));
    }
}
