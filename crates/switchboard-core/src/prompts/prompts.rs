use crate::plugins::roles::SystemPromptPlugin;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptEntry {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// System prompts from a YAML file keyed by prompt name:
///
/// ```yaml
/// default:
///   content: "You are a helpful assistant."
///   description: "General purpose assistant"
/// ```
///
/// When the file is missing a built-in `default` prompt is used.
pub struct YamlSystemPrompts {
    prompts: BTreeMap<String, PromptEntry>,
}

impl YamlSystemPrompts {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let prompts = match std::fs::read_to_string(path) {
            Ok(raw) => match serde_yaml::from_str::<BTreeMap<String, PromptEntry>>(&raw) {
                Ok(prompts) => {
                    info!("loaded {} system prompt(s) from {}", prompts.len(), path.display());
                    prompts
                }
                Err(e) => {
                    warn!("invalid system prompts file {}: {e}; using built-in defaults", path.display());
                    Self::builtin()
                }
            },
            Err(_) => {
                warn!(
                    "system prompts file {} not found; using built-in defaults",
                    path.display()
                );
                Self::builtin()
            }
        };
        Self { prompts }
    }

    fn builtin() -> BTreeMap<String, PromptEntry> {
        let mut prompts = BTreeMap::new();
        prompts.insert(
            "default".to_string(),
            PromptEntry {
                content: "You are a helpful assistant.".to_string(),
                description: Some("General purpose assistant".to_string()),
            },
        );
        prompts
    }

    pub fn all_prompts(&self) -> &BTreeMap<String, PromptEntry> {
        &self.prompts
    }
}

#[async_trait]
impl SystemPromptPlugin for YamlSystemPrompts {
    async fn get_prompt(&self, key: &str) -> Option<String> {
        self.prompts.get(key).map(|entry| entry.content.clone())
    }

    async fn list_prompts(&self) -> BTreeMap<String, String> {
        self.prompts
            .iter()
            .map(|(key, entry)| {
                (key.clone(), entry.description.clone().unwrap_or_default())
            })
            .collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
