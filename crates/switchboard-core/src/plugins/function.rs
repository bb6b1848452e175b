use crate::bridge::Bridge;
use crate::context::message::ContextMessage;
use crate::model::event::ModelEvent;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Identifiers shared by every hook invocation of a single turn.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub user_id: String,
    pub thread_id: String,
    pub turn_correlation_id: String,
}

/// The mutable call parameters a `pre_call` hook may override before the
/// next model round.
#[derive(Debug, Clone)]
pub struct CallSettings {
    pub model: String,
    pub system_prompt: Option<String>,
    pub tools: Vec<Value>,
}

/// State threaded through the `pre_call` chain: the message about to enter
/// the context, plus the call settings. Each hook receives the state as
/// left by the previous hook and returns its (possibly mutated) version.
#[derive(Debug, Clone)]
pub struct PreCallState {
    pub message: ContextMessage,
    pub settings: CallSettings,
}

/// An ordered hook that can intervene at three points of the round
/// life-cycle. Every hook returns a [`Bridge`]: updates it yields surface
/// to the user as tool-update events, and its final value feeds the chain.
///
/// `pre_call` runs highest-priority first; `filter_stream` and `post_call`
/// run in reverse. `filter_stream` shapes only what the user sees: a
/// `None` result drops the chunk from the stream, while the original chunk
/// still drives accumulation and storage.
#[async_trait]
pub trait FunctionPlugin: Send + Sync {
    fn name(&self) -> &str;
    fn priority(&self) -> i32 {
        0
    }

    async fn pre_call(&self, _ctx: HookContext, state: PreCallState) -> Bridge<PreCallState> {
        Bridge::ready(state)
    }

    async fn filter_stream(&self, _ctx: HookContext, chunk: ModelEvent) -> Bridge<Option<ModelEvent>> {
        Bridge::ready(Some(chunk))
    }

    async fn post_call(
        &self,
        _ctx: HookContext,
        _metadata: Value,
        message: ContextMessage,
    ) -> Bridge<ContextMessage> {
        Bridge::ready(message)
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Ordered fan-out over the registered function plugins. Each phase is
/// exposed as a single [`Bridge`], so the caller drains one update stream
/// regardless of how many hooks run underneath. A failing hook is logged,
/// surfaced as an error update, and skipped; the rest of the chain runs.
#[derive(Clone)]
pub struct FunctionFanOut {
    /// Priority descending; ties keep registration (source-name) order.
    plugins: Vec<Arc<dyn FunctionPlugin>>,
}

impl FunctionFanOut {
    pub fn new(mut plugins: Vec<Arc<dyn FunctionPlugin>>) -> Self {
        plugins.sort_by_key(|p| std::cmp::Reverse(p.priority()));
        Self { plugins }
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn plugins(&self) -> &[Arc<dyn FunctionPlugin>] {
        &self.plugins
    }

    /// Run `pre_call` through every hook, highest priority first.
    pub fn pre_call(&self, ctx: HookContext, state: PreCallState) -> Bridge<PreCallState> {
        let plugins = self.plugins.clone();
        Bridge::spawn(move |emitter| async move {
            let mut state = state;
            for plugin in &plugins {
                let name = plugin.name().to_string();
                debug!("pre_call: running function plugin '{name}'");
                let mut bridge = plugin.pre_call(ctx.clone(), state.clone()).await;
                while let Some(update) = bridge.next_update().await {
                    emitter.update(update).await;
                }
                match bridge.returns().await {
                    Ok(next) => state = next,
                    Err(e) => {
                        warn!("pre_call hook '{name}' failed: {e}");
                        emitter.update(format!("⚠️ {name}: {e}")).await;
                    }
                }
            }
            Ok(state)
        })
    }

    /// Run `filter_stream` through every hook, lowest priority first. A
    /// hook returning `None` drops the chunk for the rest of the chain.
    pub fn filter_stream(&self, ctx: HookContext, chunk: ModelEvent) -> Bridge<Option<ModelEvent>> {
        let plugins = self.plugins.clone();
        Bridge::spawn(move |emitter| async move {
            let mut current = Some(chunk);
            for plugin in plugins.iter().rev() {
                let Some(chunk) = current.take() else { break };
                let name = plugin.name().to_string();
                let mut bridge = plugin.filter_stream(ctx.clone(), chunk.clone()).await;
                while let Some(update) = bridge.next_update().await {
                    emitter.update(update).await;
                }
                match bridge.returns().await {
                    Ok(next) => current = next,
                    Err(e) => {
                        warn!("filter_stream hook '{name}' failed: {e}");
                        emitter.update(format!("⚠️ {name}: {e}")).await;
                        current = Some(chunk);
                    }
                }
            }
            Ok(current)
        })
    }

    /// Run `post_call` through every hook, lowest priority first.
    pub fn post_call(
        &self,
        ctx: HookContext,
        metadata: Value,
        message: ContextMessage,
    ) -> Bridge<ContextMessage> {
        let plugins = self.plugins.clone();
        Bridge::spawn(move |emitter| async move {
            let mut message = message;
            for plugin in plugins.iter().rev() {
                let name = plugin.name().to_string();
                let mut bridge = plugin
                    .post_call(ctx.clone(), metadata.clone(), message.clone())
                    .await;
                while let Some(update) = bridge.next_update().await {
                    emitter.update(update).await;
                }
                match bridge.returns().await {
                    Ok(next) => message = next,
                    Err(e) => {
                        warn!("post_call hook '{name}' failed: {e}");
                        emitter.update(format!("⚠️ {name}: {e}")).await;
                    }
                }
            }
            Ok(message)
        })
    }

    pub async fn shutdown_all(&self) {
        for plugin in &self.plugins {
            if let Err(e) = plugin.shutdown().await {
                warn!("function plugin '{}' shutdown failed: {e}", plugin.name());
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
