use crate::context::message::ContextMessage;
use crate::model::event::{merge_tool_call_deltas, ModelEvent, ToolCallDelta};
use crate::orchestrator::events::{now_rfc3339, TurnEvent, TurnRequest};
use crate::plugins::function::{CallSettings, FunctionFanOut, HookContext, PreCallState};
use crate::plugins::roles::{
    ContextPlugin, MessageProcessorPlugin, ModelPlugin, SystemPromptPlugin, ThreadPlugin,
};
use crate::threads::message::{MessageKind, MessageRole};
use crate::tools::registry::ToolRegistry;
use crate::tools::tool::ToolInvocation;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const TITLE_LIMIT: usize = 50;
const DISPLAY_LIMIT: usize = 250;

/// Mutable state of one turn: resolved ids, the call settings hooks may
/// override, the reasoning-purge list, and the current round's accumulators.
struct TurnState {
    user_id: String,
    thread_id: String,
    turn_correlation_id: String,
    settings: CallSettings,
    purge_reasoning_ids: Vec<String>,
    message_id: String,
    total_thinking: String,
    total_response: String,
    tool_calls: Vec<ToolCallDelta>,
    response_metadata: Value,
}

impl TurnState {
    fn hook_ctx(&self) -> HookContext {
        HookContext {
            user_id: self.user_id.clone(),
            thread_id: self.thread_id.clone(),
            turn_correlation_id: self.turn_correlation_id.clone(),
        }
    }

    fn reset_round(&mut self) {
        self.message_id = String::new();
        self.total_thinking = String::new();
        self.total_response = String::new();
        self.tool_calls = Vec::new();
        self.response_metadata = Value::Null;
    }
}

enum RoundControl {
    /// The round finished with a stream_end; state holds the results.
    Continue,
    /// An error was emitted or the caller went away; stop the turn.
    Abort,
}

enum ToolPhase {
    /// Tool results appended; run another model round.
    LoopBack,
    /// Nothing valid to dispatch; the turn ended with stream_end.
    Ended,
    Abort,
}

/// Drives one user turn end to end: thread resolution, history append,
/// context updates through the three hook phases, streaming model rounds,
/// and tool dispatch, yielding the turn event stream as it goes.
///
/// Per turn, events reach the caller in generation order and a history
/// segment is always persisted before the event that concludes it. A failed
/// tool execution is not fatal: it becomes a tool result the model can
/// react to. Model errors end the turn with an `error` event.
#[derive(Clone)]
pub struct TurnOrchestrator {
    model: Arc<dyn ModelPlugin>,
    threads: Arc<dyn ThreadPlugin>,
    context: Arc<dyn ContextPlugin>,
    prompts: Arc<dyn SystemPromptPlugin>,
    functions: FunctionFanOut,
    tools: Arc<ToolRegistry>,
}

async fn send(tx: &mpsc::Sender<TurnEvent>, event: TurnEvent) -> bool {
    tx.send(event).await.is_ok()
}

fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() > limit {
        let cut: String = text.chars().take(limit.saturating_sub(3)).collect();
        format!("{cut}...")
    } else {
        text.to_string()
    }
}

/// Replace results that cannot live in conversation history: strings with
/// non-printable bytes become an explanatory error, non-strings are
/// JSON-serialized.
fn sanitize_tool_result(value: &Value) -> String {
    match value {
        Value::String(s) => {
            let binary = s
                .chars()
                .any(|c| (c as u32) < 32 && !matches!(c, '\t' | '\n' | '\r'));
            if binary {
                format!(
                    "Error: Tool returned binary data ({} bytes). Binary data cannot be stored in conversation history.",
                    s.len()
                )
            } else {
                s.clone()
            }
        }
        other => serde_json::to_string(other)
            .unwrap_or_else(|e| format!("Error: Tool returned data that cannot be serialized to JSON. Error: {e}")),
    }
}

impl TurnOrchestrator {
    pub fn new(
        model: Arc<dyn ModelPlugin>,
        threads: Arc<dyn ThreadPlugin>,
        context: Arc<dyn ContextPlugin>,
        prompts: Arc<dyn SystemPromptPlugin>,
        functions: FunctionFanOut,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            model,
            threads,
            context,
            prompts,
            functions,
            tools,
        }
    }

    /// History appends are logged on failure but never abort a turn
    /// mid-stream; the next round refreshes context from the store anyway.
    #[allow(clippy::too_many_arguments)]
    async fn persist_history(
        &self,
        state: &TurnState,
        role: MessageRole,
        kind: MessageKind,
        content: &str,
        model: Option<&str>,
        aux_id: Option<&str>,
    ) {
        if let Err(e) = self
            .threads
            .add_message(
                &state.thread_id,
                &state.user_id,
                role,
                kind,
                content,
                model,
                aux_id,
            )
            .await
        {
            warn!("failed to persist history message: {e}");
        }
    }

    /// Persist a tool update to history and emit it; returns false when the
    /// caller is gone.
    async fn tool_update(
        &self,
        state: &TurnState,
        tx: &mpsc::Sender<TurnEvent>,
        call_id: &str,
        content: &str,
    ) -> bool {
        self.persist_history(
            state,
            MessageRole::Tool,
            MessageKind::ToolUpdate,
            content,
            Some(&state.settings.model),
            Some(call_id),
        )
        .await;
        send(tx, TurnEvent::tool_update(call_id, content)).await
    }

    /// Run the pre_call fan-out over a message about to enter the context,
    /// apply any settings mutations, then append the (possibly mutated)
    /// message. Hook updates surface as tool-update events.
    async fn add_message_with_pre_call(
        &self,
        state: &mut TurnState,
        tx: &mpsc::Sender<TurnEvent>,
        message: ContextMessage,
        message_id: Option<&str>,
    ) -> Result<bool> {
        let input = PreCallState {
            message: message.clone(),
            settings: state.settings.clone(),
        };
        let mut bridge = self.functions.pre_call(state.hook_ctx(), input);
        while let Some(update) = bridge.next_update().await {
            let call_id = Uuid::new_v4().to_string();
            if !self.tool_update(state, tx, &call_id, &update).await {
                return Ok(false);
            }
        }
        let resolved = match bridge.returns().await {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!("pre_call fan-out failed, using unmodified message: {e}");
                PreCallState {
                    message,
                    settings: state.settings.clone(),
                }
            }
        };
        state.settings = resolved.settings;
        self.context
            .add_message(&state.thread_id, &state.user_id, resolved.message, message_id)
            .await?;
        Ok(true)
    }

    /// Run the post_call fan-out and append the assistant message to the
    /// context.
    async fn save_assistant_message(
        &self,
        state: &TurnState,
        tx: &mpsc::Sender<TurnEvent>,
        message: ContextMessage,
    ) -> Result<bool> {
        let mut bridge = self.functions.post_call(
            state.hook_ctx(),
            state.response_metadata.clone(),
            message.clone(),
        );
        while let Some(update) = bridge.next_update().await {
            let call_id = Uuid::new_v4().to_string();
            if !self.tool_update(state, tx, &call_id, &update).await {
                return Ok(false);
            }
        }
        let message = match bridge.returns().await {
            Ok(mutated) => mutated,
            Err(e) => {
                warn!("post_call fan-out failed, storing unmodified message: {e}");
                message
            }
        };
        let message_id = state.message_id.clone();
        self.context
            .add_message(&state.thread_id, &state.user_id, message, Some(&message_id))
            .await?;
        Ok(true)
    }

    /// One streaming model round: refresh context, stream events through
    /// the filter chain, flush history segments on content-kind switches,
    /// and accumulate tool-call fragments. The original chunk drives
    /// accumulation and storage; the filtered version is what the user
    /// sees.
    async fn run_model_round(
        &self,
        state: &mut TurnState,
        tx: &mpsc::Sender<TurnEvent>,
    ) -> Result<RoundControl> {
        let context_messages = self
            .context
            .get_context(&state.thread_id, &state.user_id, true)
            .await?
            .unwrap_or_default();
        debug!("model round: {} context messages", context_messages.len());

        state.reset_round();
        let mut current_thinking = String::new();
        let mut current_response = String::new();
        let mut last_was_thinking: Option<bool> = None;
        let mut saw_stream_end = false;

        let (mtx, mut mrx) = mpsc::channel::<ModelEvent>(64);
        let model = Arc::clone(&self.model);
        let messages = context_messages;
        let model_name = state.settings.model.clone();
        let system_prompt = state.settings.system_prompt.clone();
        let tool_schemas = state.settings.tools.clone();
        let handle = tokio::spawn(async move {
            model
                .generate_response(
                    messages,
                    &model_name,
                    system_prompt.as_deref(),
                    &tool_schemas,
                    mtx,
                )
                .await
        });

        while let Some(event) = mrx.recv().await {
            // filter_stream shapes display only; per-hook updates surface
            // as tool updates.
            let mut bridge = self.functions.filter_stream(state.hook_ctx(), event.clone());
            while let Some(update) = bridge.next_update().await {
                let call_id = Uuid::new_v4().to_string();
                if !self.tool_update(state, tx, &call_id, &update).await {
                    return Ok(RoundControl::Abort);
                }
            }
            let filtered = match bridge.returns().await {
                Ok(filtered) => filtered,
                Err(e) => {
                    warn!("filter_stream fan-out failed, passing chunk through: {e}");
                    Some(event.clone())
                }
            };

            match &event {
                ModelEvent::ThinkingTokens { content } => {
                    // Segment switch: persist the closed response segment
                    // before emitting anything from the new one.
                    if last_was_thinking == Some(false) && !current_response.is_empty() {
                        self.persist_history(
                            state,
                            MessageRole::Assistant,
                            MessageKind::MessageText,
                            &current_response,
                            Some(&state.settings.model),
                            None,
                        )
                        .await;
                        current_response.clear();
                    }
                    if !self.emit_filtered(state, tx, filtered).await {
                        return Ok(RoundControl::Abort);
                    }
                    current_thinking.push_str(content);
                    state.total_thinking.push_str(content);
                    last_was_thinking = Some(true);
                }
                ModelEvent::MessageTokens { content } => {
                    if last_was_thinking == Some(true) && !current_thinking.is_empty() {
                        self.persist_history(
                            state,
                            MessageRole::Thinking,
                            MessageKind::MessageText,
                            &current_thinking,
                            Some(&state.settings.model),
                            None,
                        )
                        .await;
                        current_thinking.clear();
                    }
                    if !self.emit_filtered(state, tx, filtered).await {
                        return Ok(RoundControl::Abort);
                    }
                    current_response.push_str(content);
                    state.total_response.push_str(content);
                    last_was_thinking = Some(false);
                }
                ModelEvent::ToolCalls { calls } => {
                    // Internal: collected, never forwarded to the caller.
                    for call in calls {
                        merge_tool_call_deltas(&mut state.tool_calls, call);
                    }
                    debug!("accumulated {} tool call(s)", state.tool_calls.len());
                }
                ModelEvent::StreamEnd { metadata } => {
                    state.response_metadata = metadata.clone();
                    self.merge_metadata_tool_calls(state);
                    saw_stream_end = true;
                    break;
                }
                ModelEvent::Error { message } => {
                    error!("model error: {message}");
                    let _ = send(tx, TurnEvent::error(message.clone())).await;
                    return Ok(RoundControl::Abort);
                }
            }
        }
        drop(mrx);

        if !saw_stream_end {
            // The stream closed without its terminal event; the task result
            // explains why.
            let message = match handle.await {
                Ok(Ok(())) => "model stream ended without stream_end".to_string(),
                Ok(Err(e)) => format!("Error generating response: {e}"),
                Err(e) => format!("Error generating response: {e}"),
            };
            error!("{message}");
            let _ = send(tx, TurnEvent::error(message)).await;
            return Ok(RoundControl::Abort);
        }

        state.message_id = state
            .response_metadata
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if !current_thinking.is_empty() {
            self.persist_history(
                state,
                MessageRole::Thinking,
                MessageKind::MessageText,
                &current_thinking,
                Some(&state.settings.model),
                None,
            )
            .await;
        }
        if !current_response.is_empty() {
            self.persist_history(
                state,
                MessageRole::Assistant,
                MessageKind::MessageText,
                &current_response,
                Some(&state.settings.model),
                None,
            )
            .await;
        }
        Ok(RoundControl::Continue)
    }

    async fn emit_filtered(
        &self,
        state: &TurnState,
        tx: &mpsc::Sender<TurnEvent>,
        filtered: Option<ModelEvent>,
    ) -> bool {
        match filtered {
            Some(ModelEvent::ThinkingTokens { content }) => {
                send(tx, TurnEvent::thinking(content, state.settings.model.clone())).await
            }
            Some(ModelEvent::MessageTokens { content }) => {
                send(tx, TurnEvent::message(content, state.settings.model.clone())).await
            }
            // Dropped by a filter, or not a display chunk.
            _ => true,
        }
    }

    /// Providers may repeat the final tool-call list in stream_end
    /// metadata; append only the calls that were not already accumulated as
    /// deltas (matched by id, falling back to index).
    fn merge_metadata_tool_calls(&self, state: &mut TurnState) {
        let raw_calls = match state.response_metadata.get("tool_calls") {
            Some(Value::Array(raw_calls)) => raw_calls.clone(),
            _ => return,
        };
        let parsed: Vec<ToolCallDelta> = raw_calls
            .iter()
            .filter_map(|c| serde_json::from_value(c.clone()).ok())
            .collect();
        if !parsed.is_empty() {
            info!("found {} tool call(s) in stream_end metadata", parsed.len());
        }
        for call in parsed {
            let duplicate = state.tool_calls.iter().any(|existing| {
                match (&existing.id, &call.id) {
                    (Some(a), Some(b)) => a == b,
                    _ => existing.index == call.index,
                }
            });
            if !duplicate {
                state.tool_calls.push(call);
            }
        }
    }

    /// Validate and dispatch the round's tool calls. Invalid calls surface
    /// as error updates and are skipped; a failed execution becomes a tool
    /// result so the model can react to it, correlated by tool_call_id.
    async fn execute_tool_calls(
        &self,
        state: &mut TurnState,
        tx: &mpsc::Sender<TurnEvent>,
    ) -> Result<ToolPhase> {
        let calls = state.tool_calls.clone();
        let mut valid = Vec::new();
        for call in calls {
            let call_id = call
                .id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string());

            let Some(function) = call.function.clone() else {
                error!("tool call missing 'function' field");
                if !self
                    .tool_update(state, tx, &call_id, "🔧❌ Tool call missing 'function' field")
                    .await
                {
                    return Ok(ToolPhase::Abort);
                }
                continue;
            };
            let Some(name) = function.name.clone().filter(|n| !n.is_empty()) else {
                error!("tool call missing function name");
                if !self
                    .tool_update(state, tx, &call_id, "🔧❌ Tool call missing function name")
                    .await
                {
                    return Ok(ToolPhase::Abort);
                }
                continue;
            };
            valid.push((call_id, name, function.arguments.unwrap_or_default()));
        }

        if valid.is_empty() {
            warn!("no valid tool calls found to process");
            let _ = send(tx, TurnEvent::stream_end()).await;
            return Ok(ToolPhase::Ended);
        }
        info!("processing {} valid tool calls", valid.len());

        for (call_id, name, args_text) in valid {
            if !self
                .tool_update(state, tx, &call_id, &format!("🔧 Calling {name}({args_text})"))
                .await
            {
                return Ok(ToolPhase::Abort);
            }

            let outcome = self
                .run_single_tool(state, tx, &call_id, &name, &args_text)
                .await?;
            let sanitized = match outcome {
                Some(sanitized) => sanitized,
                None => return Ok(ToolPhase::Abort),
            };

            let tool_message = ContextMessage::tool_result(sanitized, call_id.clone());
            if !self
                .add_message_with_pre_call(state, tx, tool_message, None)
                .await?
            {
                return Ok(ToolPhase::Abort);
            }
        }
        Ok(ToolPhase::LoopBack)
    }

    /// Execute one tool call and emit its updates. Returns the sanitized
    /// result text (success or error, both become tool results), or None
    /// when the caller is gone.
    async fn run_single_tool(
        &self,
        state: &TurnState,
        tx: &mpsc::Sender<TurnEvent>,
        call_id: &str,
        name: &str,
        args_text: &str,
    ) -> Result<Option<String>> {
        let arguments: Value = if args_text.trim().is_empty() {
            Value::Object(serde_json::Map::new())
        } else {
            match serde_json::from_str(args_text) {
                Ok(parsed) => parsed,
                Err(e) => {
                    let message = format!("Error executing tool {name}: invalid arguments: {e}");
                    error!("{message}");
                    if !self
                        .tool_update(state, tx, call_id, &format!("❌ {name}: {message}"))
                        .await
                    {
                        return Ok(None);
                    }
                    return Ok(Some(message));
                }
            }
        };

        let Some(tool) = self.tools.get(name) else {
            let message = format!("Error executing tool {name}: tool not found");
            error!("{message}");
            if !self
                .tool_update(state, tx, call_id, &format!("❌ {name}: {message}"))
                .await
            {
                return Ok(None);
            }
            return Ok(Some(message));
        };

        info!("executing tool '{name}'");
        let mut bridge = tool
            .execute(ToolInvocation {
                user_id: state.user_id.clone(),
                thread_id: state.thread_id.clone(),
                turn_correlation_id: state.turn_correlation_id.clone(),
                arguments,
            })
            .await;
        while let Some(update) = bridge.next_update().await {
            if !self
                .tool_update(state, tx, call_id, &format!("{name}: {update}"))
                .await
            {
                return Ok(None);
            }
        }

        match bridge.returns().await {
            Ok(result) => {
                let sanitized = sanitize_tool_result(&result);
                let display = truncate_chars(&sanitized, DISPLAY_LIMIT);
                if !self
                    .tool_update(state, tx, call_id, &format!("✅ {name}: {display}"))
                    .await
                {
                    return Ok(None);
                }
                Ok(Some(sanitized))
            }
            Err(e) => {
                error!("error executing tool {name}: {e}");
                let sanitized =
                    sanitize_tool_result(&Value::String(format!("Error executing tool {name}: {e}")));
                if !self
                    .tool_update(state, tx, call_id, &format!("❌ {name}: {sanitized}"))
                    .await
                {
                    return Ok(None);
                }
                Ok(Some(sanitized))
            }
        }
    }

    async fn run_turn(&self, request: TurnRequest, tx: mpsc::Sender<TurnEvent>) -> Result<()> {
        info!(
            "processing message for user {} in thread {}",
            request.user_id,
            request.thread_id.as_deref().unwrap_or("new")
        );
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let prompt_key = request
            .system_prompt
            .clone()
            .unwrap_or_else(|| "default".to_string());

        // OPEN_THREAD: verify access by listing messages, or create.
        let thread_id = match &request.thread_id {
            Some(thread_id) => {
                let messages = self
                    .threads
                    .get_thread_messages(thread_id, &request.user_id)
                    .await?;
                if messages.is_none() {
                    let _ = send(&tx, TurnEvent::error("Thread not found or access denied")).await;
                    return Ok(());
                }
                thread_id.clone()
            }
            None => {
                let title = if request.content.chars().count() > TITLE_LIMIT {
                    let head: String = request.content.chars().take(TITLE_LIMIT).collect();
                    format!("{head}...")
                } else {
                    request.content.clone()
                };
                let created = self
                    .threads
                    .create_thread(&title, &model, &prompt_key, &request.user_id)
                    .await?;
                info!("created new thread {created}");
                created
            }
        };
        if !send(&tx, TurnEvent::thread_id(thread_id.clone())).await {
            return Ok(());
        }

        // ADD_USER_MSG.
        let user_message_id = Uuid::new_v4().to_string();
        let turn_correlation_id = format!("turn_{user_message_id}");

        let mut state = TurnState {
            user_id: request.user_id.clone(),
            thread_id,
            turn_correlation_id,
            settings: CallSettings {
                model,
                system_prompt: None,
                tools: self.tools.schemas(),
            },
            purge_reasoning_ids: Vec::new(),
            message_id: String::new(),
            total_thinking: String::new(),
            total_response: String::new(),
            tool_calls: Vec::new(),
            response_metadata: Value::Null,
        };

        self.persist_history(
            &state,
            MessageRole::User,
            MessageKind::MessageText,
            &request.content,
            None,
            None,
        )
        .await;

        // Resolve the system prompt; missing or empty means none at all.
        state.settings.system_prompt = self
            .prompts
            .get_prompt(&prompt_key)
            .await
            .filter(|p| !p.is_empty());

        let mut user_message = ContextMessage::user(&request.content);
        user_message.timestamp = Some(now_rfc3339());
        if !self
            .add_message_with_pre_call(&mut state, &tx, user_message, Some(&user_message_id))
            .await?
        {
            return Ok(());
        }

        // Main loop: model rounds until a round produces no tool calls.
        loop {
            match self.run_model_round(&mut state, &tx).await? {
                RoundControl::Continue => {}
                RoundControl::Abort => return Ok(()),
            }

            let mut assistant_message = ContextMessage::assistant(state.total_response.clone());
            assistant_message.id = Some(state.message_id.clone());
            assistant_message.model = Some(state.settings.model.clone());
            assistant_message.timestamp = Some(now_rfc3339());
            if !state.tool_calls.is_empty() {
                assistant_message.tool_calls = Some(state.tool_calls.clone());
                assistant_message.reasoning_content = Some(state.total_thinking.clone());
                state.purge_reasoning_ids.push(state.message_id.clone());
            }

            if !self
                .save_assistant_message(&state, &tx, assistant_message)
                .await?
            {
                return Ok(());
            }

            if state.tool_calls.is_empty() {
                // The tool loop is over: reasoning is no longer needed in
                // the context.
                for message_id in &state.purge_reasoning_ids {
                    let mut updates = serde_json::Map::new();
                    updates.insert("reasoning_content".to_string(), Value::Null);
                    if let Err(e) = self
                        .context
                        .update_message(&state.thread_id, &state.user_id, message_id, &updates)
                        .await
                    {
                        warn!("failed to purge reasoning from context message {message_id}: {e}");
                    }
                }
                let _ = send(&tx, TurnEvent::stream_end()).await;
                return Ok(());
            }

            match self.execute_tool_calls(&mut state, &tx).await? {
                ToolPhase::LoopBack => {}
                ToolPhase::Ended | ToolPhase::Abort => return Ok(()),
            }
        }
    }
}

#[async_trait]
impl MessageProcessorPlugin for TurnOrchestrator {
    async fn process_message(&self, request: TurnRequest) -> Result<mpsc::Receiver<TurnEvent>> {
        let (tx, rx) = mpsc::channel(64);
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.run_turn(request, tx.clone()).await {
                error!("turn failed: {e:#}");
                let _ = tx
                    .send(TurnEvent::error(format!("Error generating response: {e}")))
                    .await;
            }
        });
        Ok(rx)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::Bridge;
    use crate::context::manager::ContextManager;
    use crate::context::message::ContextRole;
    use crate::model::event::FunctionDelta;
    use crate::plugins::function::FunctionPlugin;
    use crate::store::store::SqliteStore;
    use crate::threads::manager::ThreadManager;
    use crate::tools::function_tool::{FunctionTool, ParamKind, ToolParam};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedModel {
        rounds: Mutex<VecDeque<Vec<ModelEvent>>>,
    }

    impl ScriptedModel {
        fn new(rounds: Vec<Vec<ModelEvent>>) -> Arc<Self> {
            Arc::new(Self {
                rounds: Mutex::new(rounds.into()),
            })
        }
    }

    #[async_trait]
    impl ModelPlugin for ScriptedModel {
        async fn available_models(&self) -> Result<Vec<String>> {
            Ok(vec!["scripted".to_string()])
        }

        async fn generate_response(
            &self,
            _messages: Vec<ContextMessage>,
            _model: &str,
            _system_prompt: Option<&str>,
            _tools: &[Value],
            tx: mpsc::Sender<ModelEvent>,
        ) -> Result<()> {
            let round = self
                .rounds
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| vec![ModelEvent::StreamEnd { metadata: json!({}) }]);
            for event in round {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            Ok(())
        }
    }

    struct NoPrompts;

    #[async_trait]
    impl SystemPromptPlugin for NoPrompts {
        async fn get_prompt(&self, _key: &str) -> Option<String> {
            None
        }
        async fn list_prompts(&self) -> BTreeMap<String, String> {
            BTreeMap::new()
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        orchestrator: TurnOrchestrator,
        threads: Arc<ThreadManager>,
        context: Arc<ContextManager>,
    }

    fn harness(
        model: Arc<dyn ModelPlugin>,
        functions: Vec<Arc<dyn FunctionPlugin>>,
        tools: ToolRegistry,
    ) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(SqliteStore::new(dir.path().join("turns.db")));
        let threads = Arc::new(ThreadManager::new(store.clone()));
        let context = Arc::new(ContextManager::new(store));
        context.set_thread_plugin(threads.clone());

        let orchestrator = TurnOrchestrator::new(
            model,
            threads.clone(),
            context.clone(),
            Arc::new(NoPrompts),
            FunctionFanOut::new(functions),
            Arc::new(tools),
        );
        Harness {
            _dir: dir,
            orchestrator,
            threads,
            context,
        }
    }

    async fn collect(mut rx: mpsc::Receiver<TurnEvent>) -> Vec<TurnEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn request(content: &str) -> TurnRequest {
        TurnRequest {
            user_id: "u1".to_string(),
            content: content.to_string(),
            thread_id: None,
            model: Some("scripted".to_string()),
            system_prompt: None,
        }
    }

    fn stream_end_count(events: &[TurnEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, TurnEvent::StreamEnd { .. }))
            .count()
    }

    fn thread_id_of(events: &[TurnEvent]) -> String {
        events
            .iter()
            .find_map(|e| match e {
                TurnEvent::ThreadId { thread_id, .. } => Some(thread_id.clone()),
                _ => None,
            })
            .expect("thread_id event")
    }

    // New thread, simple answer.
    #[tokio::test]
    async fn simple_answer_creates_thread_and_streams_tokens() {
        let model = ScriptedModel::new(vec![vec![
            ModelEvent::MessageTokens { content: "Hi".to_string() },
            ModelEvent::StreamEnd { metadata: json!({}) },
        ]]);
        let h = harness(model, Vec::new(), ToolRegistry::new());

        let rx = h.orchestrator.process_message(request("Hello")).await.unwrap();
        let events = collect(rx).await;

        assert!(matches!(events[0], TurnEvent::ThreadId { .. }));
        assert!(
            matches!(&events[1], TurnEvent::MessageTokens { content, .. } if content == "Hi")
        );
        assert!(matches!(events[2], TurnEvent::StreamEnd { .. }));
        assert_eq!(stream_end_count(&events), 1);

        let thread_id = thread_id_of(&events);
        let history = h
            .threads
            .get_thread_messages(&thread_id, "u1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, MessageRole::User);
        assert_eq!(history[0].content, "Hello");
        assert_eq!(history[1].role, MessageRole::Assistant);
        assert_eq!(history[1].content, "Hi");
        assert_eq!(history[1].model.as_deref(), Some("scripted"));

        let context = h
            .context
            .get_context(&thread_id, "u1", true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(context.len(), 2);
        assert_eq!(context[0].role, ContextRole::User);
        assert_eq!(context[0].content, "Hello");
        assert_eq!(context[1].role, ContextRole::Assistant);
        assert_eq!(context[1].content, "Hi");
    }

    // Full tool round-trip across two model rounds.
    #[tokio::test]
    async fn tool_round_trip_runs_two_rounds_and_purges_reasoning() {
        let model = ScriptedModel::new(vec![
            vec![
                ModelEvent::ThinkingTokens { content: "let me check".to_string() },
                ModelEvent::ToolCalls {
                    calls: vec![ToolCallDelta {
                        index: 0,
                        id: Some("c1".to_string()),
                        kind: Some("function".to_string()),
                        function: Some(FunctionDelta {
                            name: Some("get_weather".to_string()),
                            arguments: Some("{\"loc\":\"X\"}".to_string()),
                        }),
                    }],
                },
                ModelEvent::StreamEnd { metadata: json!({"id": "round-1"}) },
            ],
            vec![
                ModelEvent::MessageTokens { content: "20°".to_string() },
                ModelEvent::StreamEnd { metadata: json!({"id": "round-2"}) },
            ],
        ]);

        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(FunctionTool::new(
            "get_weather",
            "Get weather",
            vec![ToolParam::required("loc", ParamKind::String, "location")],
            |_invocation| async move { Ok(json!({"temp": 20})) },
        )));

        let h = harness(model, Vec::new(), tools);
        let rx = h.orchestrator.process_message(request("weather?")).await.unwrap();
        let events = collect(rx).await;

        let updates: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                TurnEvent::ToolUpdate { content, .. } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert!(updates.iter().any(|u| u.starts_with("🔧 Calling get_weather")));
        assert!(updates.iter().any(|u| u.starts_with("✅ get_weather:")));
        assert!(events
            .iter()
            .any(|e| matches!(e, TurnEvent::MessageTokens { content, .. } if content == "20°")));
        assert_eq!(stream_end_count(&events), 1);
        // Internal tool_calls events are never forwarded; the only events
        // are thread_id, thinking, tool updates, tokens, stream_end.
        assert!(events.iter().all(|e| !matches!(e, TurnEvent::Error { .. })));

        let thread_id = thread_id_of(&events);
        let context = h
            .context
            .get_context(&thread_id, "u1", false)
            .await
            .unwrap()
            .unwrap();
        // user, assistant(round 1), tool(c1), assistant(round 2)
        assert_eq!(context.len(), 4);
        assert_eq!(context[1].role, ContextRole::Assistant);
        assert!(context[1].tool_calls.is_some());
        // Reasoning was purged once the tool loop completed.
        assert!(context[1].reasoning_content.is_none());
        assert_eq!(context[2].role, ContextRole::Tool);
        assert_eq!(context[2].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(context[2].content, "{\"temp\":20}");
        assert_eq!(context[3].content, "20°");

        // History carries tool updates correlated by aux_id.
        let history = h
            .threads
            .get_thread_messages(&thread_id, "u1")
            .await
            .unwrap()
            .unwrap();
        assert!(history
            .iter()
            .any(|m| m.kind == MessageKind::ToolUpdate && m.aux_id.as_deref() == Some("c1")));
    }

    // A filter drops a chunk from display; context keeps the original.
    #[tokio::test]
    async fn filter_drop_is_display_only() {
        struct SecretDropper;

        #[async_trait]
        impl FunctionPlugin for SecretDropper {
            fn name(&self) -> &str {
                "secret_dropper"
            }
            async fn filter_stream(
                &self,
                _ctx: HookContext,
                chunk: ModelEvent,
            ) -> Bridge<Option<ModelEvent>> {
                if let ModelEvent::MessageTokens { content } = &chunk {
                    if content.contains("SECRET") {
                        return Bridge::ready(None);
                    }
                }
                Bridge::ready(Some(chunk))
            }
        }

        let model = ScriptedModel::new(vec![vec![
            ModelEvent::MessageTokens { content: "ok ".to_string() },
            ModelEvent::MessageTokens { content: "SECRET".to_string() },
            ModelEvent::MessageTokens { content: " done".to_string() },
            ModelEvent::StreamEnd { metadata: json!({}) },
        ]]);
        let h = harness(model, vec![Arc::new(SecretDropper)], ToolRegistry::new());

        let rx = h.orchestrator.process_message(request("go")).await.unwrap();
        let events = collect(rx).await;

        let tokens: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                TurnEvent::MessageTokens { content, .. } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(tokens, vec!["ok ", " done"]);
        assert_eq!(stream_end_count(&events), 1);

        // The context recorded everything the model produced.
        let thread_id = thread_id_of(&events);
        let context = h
            .context
            .get_context(&thread_id, "u1", true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(context[1].content, "ok SECRET done");
    }

    #[tokio::test]
    async fn unknown_thread_yields_error_event() {
        let model = ScriptedModel::new(vec![]);
        let h = harness(model, Vec::new(), ToolRegistry::new());

        let mut req = request("hi");
        req.thread_id = Some("no-such-thread".to_string());
        let rx = h.orchestrator.process_message(req).await.unwrap();
        let events = collect(rx).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            TurnEvent::Error { message, .. } if message.contains("not found")
        ));
        assert_eq!(stream_end_count(&events), 0);
    }

    #[tokio::test]
    async fn model_error_terminates_turn_without_stream_end() {
        let model = ScriptedModel::new(vec![vec![
            ModelEvent::MessageTokens { content: "par".to_string() },
            ModelEvent::Error { message: "provider fell over".to_string() },
        ]]);
        let h = harness(model, Vec::new(), ToolRegistry::new());

        let rx = h.orchestrator.process_message(request("hi")).await.unwrap();
        let events = collect(rx).await;

        assert!(events
            .iter()
            .any(|e| matches!(e, TurnEvent::Error { message, .. } if message.contains("provider"))));
        assert_eq!(stream_end_count(&events), 0);
    }

    #[tokio::test]
    async fn failing_tool_becomes_tool_result_not_fatal() {
        let model = ScriptedModel::new(vec![
            vec![
                ModelEvent::ToolCalls {
                    calls: vec![ToolCallDelta {
                        index: 0,
                        id: Some("c1".to_string()),
                        kind: None,
                        function: Some(FunctionDelta {
                            name: Some("broken".to_string()),
                            arguments: Some("{}".to_string()),
                        }),
                    }],
                },
                ModelEvent::StreamEnd { metadata: json!({}) },
            ],
            vec![
                ModelEvent::MessageTokens { content: "sorry".to_string() },
                ModelEvent::StreamEnd { metadata: json!({}) },
            ],
        ]);

        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(FunctionTool::new(
            "broken",
            "Always fails",
            Vec::new(),
            |_invocation| async move { Err(anyhow::anyhow!("disk on fire")) },
        )));

        let h = harness(model, Vec::new(), tools);
        let rx = h.orchestrator.process_message(request("try it")).await.unwrap();
        let events = collect(rx).await;

        assert!(events.iter().any(
            |e| matches!(e, TurnEvent::ToolUpdate { content, .. } if content.starts_with("❌ broken:"))
        ));
        // The turn recovered: second round answered and closed the stream.
        assert!(events
            .iter()
            .any(|e| matches!(e, TurnEvent::MessageTokens { content, .. } if content == "sorry")));
        assert_eq!(stream_end_count(&events), 1);

        // The model saw the failure correlated by tool_call_id.
        let thread_id = thread_id_of(&events);
        let context = h
            .context
            .get_context(&thread_id, "u1", true)
            .await
            .unwrap()
            .unwrap();
        let tool_entry = context
            .iter()
            .find(|m| m.role == ContextRole::Tool)
            .unwrap();
        assert_eq!(tool_entry.tool_call_id.as_deref(), Some("c1"));
        assert!(tool_entry.content.contains("disk on fire"));
    }

    #[tokio::test]
    async fn streamed_argument_fragments_are_reassembled() {
        let model = ScriptedModel::new(vec![
            vec![
                ModelEvent::ToolCalls {
                    calls: vec![ToolCallDelta {
                        index: 0,
                        id: Some("c1".to_string()),
                        kind: None,
                        function: Some(FunctionDelta {
                            name: Some("get_weather".to_string()),
                            arguments: Some("{\"loc\":".to_string()),
                        }),
                    }],
                },
                ModelEvent::ToolCalls {
                    calls: vec![ToolCallDelta {
                        index: 0,
                        id: None,
                        kind: None,
                        function: Some(FunctionDelta {
                            name: None,
                            arguments: Some("\"X\"}".to_string()),
                        }),
                    }],
                },
                // The final metadata repeats the call; it must not
                // double-dispatch.
                ModelEvent::StreamEnd {
                    metadata: json!({"tool_calls": [
                        {"index": 0, "id": "c1", "function": {"name": "get_weather", "arguments": "{\"loc\":\"X\"}"}}
                    ]}),
                },
            ],
            vec![
                ModelEvent::MessageTokens { content: "done".to_string() },
                ModelEvent::StreamEnd { metadata: json!({}) },
            ],
        ]);

        let calls_seen = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&calls_seen);
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(FunctionTool::new(
            "get_weather",
            "Get weather",
            vec![ToolParam::required("loc", ParamKind::String, "location")],
            move |invocation| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().unwrap().push(invocation.arguments.clone());
                    Ok(json!({"temp": 20}))
                }
            },
        )));

        let h = harness(model, Vec::new(), tools);
        let rx = h.orchestrator.process_message(request("weather")).await.unwrap();
        let events = collect(rx).await;

        assert_eq!(stream_end_count(&events), 1);
        let seen = calls_seen.lock().unwrap();
        assert_eq!(seen.len(), 1, "metadata repeat must be deduped");
        assert_eq!(seen[0], json!({"loc": "X"}));
    }

    #[tokio::test]
    async fn thinking_and_message_segments_flush_separately_to_history() {
        let model = ScriptedModel::new(vec![vec![
            ModelEvent::ThinkingTokens { content: "hmm ".to_string() },
            ModelEvent::ThinkingTokens { content: "okay".to_string() },
            ModelEvent::MessageTokens { content: "answer".to_string() },
            ModelEvent::StreamEnd { metadata: json!({}) },
        ]]);
        let h = harness(model, Vec::new(), ToolRegistry::new());

        let rx = h.orchestrator.process_message(request("think")).await.unwrap();
        let events = collect(rx).await;
        let thread_id = thread_id_of(&events);

        let history = h
            .threads
            .get_thread_messages(&thread_id, "u1")
            .await
            .unwrap()
            .unwrap();
        let roles: Vec<MessageRole> = history.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![MessageRole::User, MessageRole::Thinking, MessageRole::Assistant]
        );
        assert_eq!(history[1].content, "hmm okay");
        assert_eq!(history[2].content, "answer");
    }

    #[tokio::test]
    async fn long_first_message_truncates_thread_title() {
        let model = ScriptedModel::new(vec![vec![
            ModelEvent::MessageTokens { content: "ok".to_string() },
            ModelEvent::StreamEnd { metadata: json!({}) },
        ]]);
        let h = harness(model, Vec::new(), ToolRegistry::new());

        let long = "x".repeat(80);
        let rx = h.orchestrator.process_message(request(&long)).await.unwrap();
        let events = collect(rx).await;
        let _ = thread_id_of(&events);

        let threads = h.threads.get_threads("u1", None).await.unwrap();
        assert!(threads[0].title.ends_with("..."));
        assert_eq!(threads[0].title.chars().count(), 53);
    }
}
