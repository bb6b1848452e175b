use crate::plugins::function::{FunctionFanOut, FunctionPlugin};
use crate::plugins::roles::{Role, RoleInstance};
use crate::tools::registry::ToolRegistry;
use crate::tools::tool::Tool;
use anyhow::{bail, Result};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

struct RoleCandidate {
    source: String,
    instance: RoleInstance,
}

/// Compile-time analogue of plugin discovery: registrations are made
/// explicitly at startup, each with a `source` name that plays the file-name
/// role in deterministic tiebreaks.
///
/// Selection per role sorts candidates by priority descending, then source
/// ascending; a tie at top priority is resolved by source order and logged.
/// Roles with no candidate fall back to the named default wired by the
/// system. After resolution exactly one plugin is active per role; a role
/// that cannot be filled is fatal at startup.
pub struct PluginRegistry {
    roles: HashMap<Role, Vec<RoleCandidate>>,
    functions: Vec<(String, Arc<dyn FunctionPlugin>)>,
    tools: ToolRegistry,
}

/// Everything selected at startup, in resolution order.
pub struct ResolvedPlugins {
    pub roles: HashMap<Role, RoleInstance>,
    pub functions: FunctionFanOut,
    pub tools: Arc<ToolRegistry>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            roles: HashMap::new(),
            functions: Vec::new(),
            tools: ToolRegistry::new(),
        }
    }

    /// Register a role plugin candidate under a source name.
    pub fn register_role(&mut self, source: impl Into<String>, instance: RoleInstance) {
        let source = source.into();
        let role = instance.role();
        info!(
            "registered role plugin for '{role}' (priority: {}, source: {source})",
            instance.priority()
        );
        self.roles
            .entry(role)
            .or_default()
            .push(RoleCandidate { source, instance });
    }

    /// Register a function plugin. Ordering among equal priorities follows
    /// source name, like role selection.
    pub fn register_function(&mut self, source: impl Into<String>, plugin: Arc<dyn FunctionPlugin>) {
        let source = source.into();
        info!(
            "registered function plugin '{}' (priority: {}, source: {source})",
            plugin.name(),
            plugin.priority()
        );
        self.functions.push((source, plugin));
    }

    /// Register a tool plugin. Duplicate names keep the first registration.
    pub fn register_tool(&mut self, tool: Arc<dyn Tool>) {
        self.tools.register(tool);
    }

    /// Select the active plugin for every role that has candidates, order
    /// the function plugins, and hand over the tool registry. Roles without
    /// candidates are absent from the map; the system fills them with
    /// defaults and then verifies the full role set is covered.
    pub fn resolve(mut self) -> ResolvedPlugins {
        let mut selected = HashMap::new();
        for (role, mut candidates) in self.roles.drain() {
            candidates.sort_by(|a, b| {
                b.instance
                    .priority()
                    .cmp(&a.instance.priority())
                    .then_with(|| a.source.cmp(&b.source))
            });

            let top_priority = candidates[0].instance.priority();
            let tied: Vec<&str> = candidates
                .iter()
                .filter(|c| c.instance.priority() == top_priority)
                .map(|c| c.source.as_str())
                .collect();
            if tied.len() > 1 {
                info!(
                    "priority tie for role '{role}': {} candidates share priority {top_priority} \
                     ({tied:?}); source-name tiebreak selected '{}'",
                    tied.len(),
                    candidates[0].source
                );
            }
            info!(
                "selected active plugin for role '{role}' (source: {})",
                candidates[0].source
            );
            let winner = candidates.remove(0);
            selected.insert(role, winner.instance);
        }

        self.functions.sort_by(|a, b| {
            b.1.priority()
                .cmp(&a.1.priority())
                .then_with(|| a.0.cmp(&b.0))
        });
        let functions =
            FunctionFanOut::new(self.functions.into_iter().map(|(_, p)| p).collect());

        ResolvedPlugins {
            roles: selected,
            functions,
            tools: Arc::new(self.tools),
        }
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolvedPlugins {
    /// Conformance check: after defaults are merged in, every role must be
    /// filled exactly once. Fatal at startup otherwise.
    pub fn verify_role_coverage(&self) -> Result<()> {
        for role in Role::ALL {
            if !self.roles.contains_key(&role) {
                bail!("no plugin available for required role '{role}'");
            }
        }
        Ok(())
    }
}

/// Concurrent shutdown fan-out over role and function plugins, each bounded
/// by a timeout. Failures are logged individually and never abort the rest.
pub async fn shutdown_fan_out(roles: &HashMap<Role, RoleInstance>, functions: &FunctionFanOut) {
    info!("shutting down {} role plugin(s)", roles.len());
    let role_futures = roles.iter().map(|(role, instance)| async move {
        match timeout(SHUTDOWN_TIMEOUT, instance.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("shutdown of role '{role}' failed: {e}"),
            Err(_) => warn!("shutdown of role '{role}' timed out"),
        }
    });
    join_all(role_futures).await;

    let function_futures = functions.plugins().iter().map(|plugin| async move {
        match timeout(SHUTDOWN_TIMEOUT, plugin.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("shutdown of function plugin '{}' failed: {e}", plugin.name()),
            Err(_) => warn!("shutdown of function plugin '{}' timed out", plugin.name()),
        }
    });
    join_all(function_futures).await;
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::roles::SystemPromptPlugin;
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    struct NamedPrompts {
        tag: &'static str,
        priority: i32,
    }

    #[async_trait]
    impl SystemPromptPlugin for NamedPrompts {
        fn priority(&self) -> i32 {
            self.priority
        }
        async fn get_prompt(&self, _key: &str) -> Option<String> {
            Some(self.tag.to_string())
        }
        async fn list_prompts(&self) -> BTreeMap<String, String> {
            BTreeMap::new()
        }
    }

    fn candidate(tag: &'static str, priority: i32) -> RoleInstance {
        RoleInstance::SystemPrompt(Arc::new(NamedPrompts { tag, priority }))
    }

    async fn selected_tag(resolved: &ResolvedPlugins) -> String {
        match resolved.roles.get(&Role::SystemPrompt).unwrap() {
            RoleInstance::SystemPrompt(p) => p.get_prompt("any").await.unwrap(),
            _ => panic!("wrong role variant"),
        }
    }

    #[tokio::test]
    async fn highest_priority_wins() {
        let mut registry = PluginRegistry::new();
        registry.register_role("a_low.rs", candidate("low", 1));
        registry.register_role("b_high.rs", candidate("high", 10));
        let resolved = registry.resolve();
        assert_eq!(selected_tag(&resolved).await, "high");
    }

    #[tokio::test]
    async fn tie_breaks_by_source_name_ascending() {
        let mut registry = PluginRegistry::new();
        registry.register_role("zeta.rs", candidate("zeta", 5));
        registry.register_role("alpha.rs", candidate("alpha", 5));
        let resolved = registry.resolve();
        assert_eq!(selected_tag(&resolved).await, "alpha");
    }

    #[tokio::test]
    async fn missing_role_fails_coverage_check() {
        let registry = PluginRegistry::new();
        let resolved = registry.resolve();
        assert!(resolved.verify_role_coverage().is_err());
    }

    #[tokio::test]
    async fn function_plugins_order_by_priority_then_source() {
        use crate::plugins::function::FunctionPlugin;

        struct Named(&'static str, i32);
        #[async_trait]
        impl FunctionPlugin for Named {
            fn name(&self) -> &str {
                self.0
            }
            fn priority(&self) -> i32 {
                self.1
            }
        }

        let mut registry = PluginRegistry::new();
        registry.register_function("b.rs", Arc::new(Named("second", 5)));
        registry.register_function("a.rs", Arc::new(Named("first", 5)));
        registry.register_function("c.rs", Arc::new(Named("top", 9)));
        let resolved = registry.resolve();

        let names: Vec<&str> = resolved
            .functions
            .plugins()
            .iter()
            .map(|p| p.name())
            .collect();
        assert_eq!(names, vec!["top", "first", "second"]);
    }
}
