use crate::auth::auth::YamlFileAuth;
use crate::config::config::AppConfig;
use crate::context::manager::ContextManager;
use crate::model::openai::OpenAiModelClient;
use crate::orchestrator::events::{TurnEvent, TurnRequest};
use crate::orchestrator::orchestrator::TurnOrchestrator;
use crate::plugins::function::FunctionFanOut;
use crate::plugins::registry::{shutdown_fan_out, PluginRegistry};
use crate::plugins::roles::{
    AuthPlugin, ContextPlugin, MessageProcessorPlugin, ModelPlugin, Role, RoleInstance,
    StorePlugin, SystemPromptPlugin, ThreadPlugin,
};
use crate::prompts::prompts::YamlSystemPrompts;
use crate::store::store::SqliteStore;
use crate::threads::manager::ThreadManager;
use crate::tools::registry::ToolRegistry;
use anyhow::{bail, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

/// The explicitly constructed process-wide value: store, the active plugin
/// per role, the ordered function plugins, and the tool registry, wired at
/// startup and passed by reference. The lifetime is the process; shutdown
/// is explicit.
pub struct System {
    pub config: AppConfig,
    pub auth: Arc<dyn AuthPlugin>,
    pub model: Arc<dyn ModelPlugin>,
    pub threads: Arc<dyn ThreadPlugin>,
    pub store: Arc<dyn StorePlugin>,
    pub context: Arc<dyn ContextPlugin>,
    pub prompts: Arc<dyn SystemPromptPlugin>,
    pub processor: Arc<dyn MessageProcessorPlugin>,
    pub functions: FunctionFanOut,
    pub tools: Arc<ToolRegistry>,
    roles: HashMap<Role, RoleInstance>,
}

impl System {
    /// Resolve registrations against the built-in defaults, verify that
    /// every role is filled, and wire the orchestrator. Conformance failure
    /// is fatal here, at startup.
    pub fn start(config: AppConfig, registry: PluginRegistry) -> Result<Self> {
        let mut resolved = registry.resolve();

        let store_plugin: Arc<dyn StorePlugin> = match resolved.roles.remove(&Role::Store) {
            Some(RoleInstance::Store(plugin)) => plugin,
            Some(_) => bail!("plugin registered for role 'store' has the wrong capability set"),
            None => Arc::new(SqliteStore::new(config.db_path())),
        };

        let threads: Arc<dyn ThreadPlugin> = match resolved.roles.remove(&Role::Thread) {
            Some(RoleInstance::Thread(plugin)) => plugin,
            Some(_) => bail!("plugin registered for role 'thread' has the wrong capability set"),
            None => Arc::new(ThreadManager::new(Arc::clone(&store_plugin))),
        };

        let context: Arc<dyn ContextPlugin> = match resolved.roles.remove(&Role::Context) {
            Some(RoleInstance::Context(plugin)) => plugin,
            Some(_) => bail!("plugin registered for role 'context' has the wrong capability set"),
            None => {
                let manager = Arc::new(ContextManager::new(Arc::clone(&store_plugin)));
                manager.set_thread_plugin(Arc::clone(&threads));
                manager
            }
        };

        let auth: Arc<dyn AuthPlugin> = match resolved.roles.remove(&Role::Auth) {
            Some(RoleInstance::Auth(plugin)) => plugin,
            Some(_) => bail!("plugin registered for role 'auth' has the wrong capability set"),
            None => Arc::new(YamlFileAuth::new(&config)?),
        };

        let prompts: Arc<dyn SystemPromptPlugin> = match resolved.roles.remove(&Role::SystemPrompt)
        {
            Some(RoleInstance::SystemPrompt(plugin)) => plugin,
            Some(_) => {
                bail!("plugin registered for role 'system_prompt' has the wrong capability set")
            }
            None => Arc::new(YamlSystemPrompts::new(config.prompts_path())),
        };

        let model: Arc<dyn ModelPlugin> = match resolved.roles.remove(&Role::Model) {
            Some(RoleInstance::Model(plugin)) => plugin,
            Some(_) => bail!("plugin registered for role 'model' has the wrong capability set"),
            None => Arc::new(OpenAiModelClient::new(
                config.model_base_url.clone(),
                config.model_api_key.clone(),
            )),
        };

        let processor: Arc<dyn MessageProcessorPlugin> =
            match resolved.roles.remove(&Role::MessageProcessor) {
                Some(RoleInstance::MessageProcessor(plugin)) => plugin,
                Some(_) => bail!(
                    "plugin registered for role 'message_processor' has the wrong capability set"
                ),
                None => Arc::new(TurnOrchestrator::new(
                    Arc::clone(&model),
                    Arc::clone(&threads),
                    Arc::clone(&context),
                    Arc::clone(&prompts),
                    resolved.functions.clone(),
                    Arc::clone(&resolved.tools),
                )),
            };

        let mut roles = HashMap::new();
        roles.insert(Role::Auth, RoleInstance::Auth(Arc::clone(&auth)));
        roles.insert(Role::Model, RoleInstance::Model(Arc::clone(&model)));
        roles.insert(Role::Thread, RoleInstance::Thread(Arc::clone(&threads)));
        roles.insert(Role::Store, RoleInstance::Store(Arc::clone(&store_plugin)));
        roles.insert(Role::Context, RoleInstance::Context(Arc::clone(&context)));
        roles.insert(
            Role::SystemPrompt,
            RoleInstance::SystemPrompt(Arc::clone(&prompts)),
        );
        roles.insert(
            Role::MessageProcessor,
            RoleInstance::MessageProcessor(Arc::clone(&processor)),
        );
        for role in Role::ALL {
            if !roles.contains_key(&role) {
                bail!("no plugin available for required role '{role}'");
            }
        }
        info!("system started: {} roles active, {} tool(s)", roles.len(), resolved.tools.names().len());

        Ok(Self {
            config,
            auth,
            model,
            threads,
            store: store_plugin,
            context,
            prompts,
            processor,
            functions: resolved.functions,
            tools: resolved.tools,
            roles,
        })
    }

    /// The single streaming entry point.
    pub async fn process_message(&self, request: TurnRequest) -> Result<mpsc::Receiver<TurnEvent>> {
        self.processor.process_message(request).await
    }

    /// Bounded, concurrent shutdown of every active plugin, the store
    /// included.
    pub async fn shutdown(&self) {
        info!("system shutdown requested");
        shutdown_fan_out(&self.roles, &self.functions).await;
        info!("system shutdown complete");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::message::ContextMessage;
    use crate::model::event::ModelEvent;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct OneLinerModel;

    #[async_trait]
    impl crate::plugins::roles::ModelPlugin for OneLinerModel {
        async fn available_models(&self) -> Result<Vec<String>> {
            Ok(vec!["fixed".to_string()])
        }
        async fn generate_response(
            &self,
            _messages: Vec<ContextMessage>,
            _model: &str,
            _system_prompt: Option<&str>,
            _tools: &[Value],
            tx: mpsc::Sender<ModelEvent>,
        ) -> Result<()> {
            let _ = tx
                .send(ModelEvent::MessageTokens { content: "pong".to_string() })
                .await;
            let _ = tx.send(ModelEvent::StreamEnd { metadata: json!({}) }).await;
            Ok(())
        }
    }

    fn test_config(dir: &tempfile::TempDir) -> AppConfig {
        AppConfig {
            data_path: dir.path().to_path_buf(),
            ephemeral: true,
            ..AppConfig::default()
        }
    }

    #[tokio::test]
    async fn start_fills_every_role_and_serves_a_turn() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = PluginRegistry::new();
        registry.register_role("test_model.rs", RoleInstance::Model(Arc::new(OneLinerModel)));

        let system = System::start(test_config(&dir), registry).unwrap();
        for role in Role::ALL {
            assert!(system.roles.contains_key(&role));
        }

        let rx = system
            .process_message(TurnRequest {
                user_id: "u1".to_string(),
                content: "ping".to_string(),
                thread_id: None,
                model: Some("fixed".to_string()),
                system_prompt: None,
            })
            .await
            .unwrap();

        let mut rx = rx;
        let mut saw_pong = false;
        let mut saw_end = false;
        while let Some(event) = rx.recv().await {
            match event {
                TurnEvent::MessageTokens { content, .. } if content == "pong" => saw_pong = true,
                TurnEvent::StreamEnd { .. } => saw_end = true,
                _ => {}
            }
        }
        assert!(saw_pong && saw_end);

        system.shutdown().await;
    }

    #[tokio::test]
    async fn registered_role_overrides_default() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = PluginRegistry::new();
        registry.register_role("test_model.rs", RoleInstance::Model(Arc::new(OneLinerModel)));
        let system = System::start(test_config(&dir), registry).unwrap();
        assert_eq!(
            system.model.available_models().await.unwrap(),
            vec!["fixed".to_string()]
        );
    }
}
