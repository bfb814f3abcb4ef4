use crate::errors::UtcpError;
use crate::providers::base::Provider;
use crate::repository::ToolRepository;
use crate::tools::Tool;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

struct RegisteredTool {
    provider_name: String,
    tool: Tool,
    /// Monotonic registration sequence; search ties break on it.
    seq: u64,
}

#[derive(Default)]
struct RegistryState {
    providers: HashMap<String, Arc<dyn Provider>>,
    tools: HashMap<String, RegisteredTool>, // qualified name -> entry
    next_seq: u64,
}

/// In-memory repository. One lock covers providers and tools, so removing a
/// provider takes its tools with it atomically w.r.t. concurrent lookups.
pub struct InMemoryToolRepository {
    state: RwLock<RegistryState>,
}

impl InMemoryToolRepository {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
        }
    }
}

impl Default for InMemoryToolRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolRepository for InMemoryToolRepository {
    async fn save_provider_with_tools(
        &self,
        provider: Arc<dyn Provider>,
        tools: Vec<Tool>,
    ) -> Result<()> {
        let provider_name = provider.name();
        let mut state = self.state.write().await;

        // Replacement drops any previous tool set for this provider.
        state
            .tools
            .retain(|_, entry| entry.provider_name != provider_name);
        state.providers.insert(provider_name.clone(), provider);

        for tool in tools {
            let seq = state.next_seq;
            state.next_seq += 1;
            state.tools.insert(
                tool.name.clone(),
                RegisteredTool {
                    provider_name: provider_name.clone(),
                    tool,
                    seq,
                },
            );
        }

        Ok(())
    }

    async fn get_provider(&self, name: &str) -> Result<Option<Arc<dyn Provider>>> {
        let state = self.state.read().await;
        Ok(state.providers.get(name).cloned())
    }

    async fn remove_provider(&self, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if state.providers.remove(name).is_none() {
            return Err(UtcpError::ProviderNotFound(name.to_string()).into());
        }
        state.tools.retain(|_, entry| entry.provider_name != name);
        Ok(())
    }

    async fn get_tools(&self) -> Result<Vec<Tool>> {
        let state = self.state.read().await;
        let mut entries: Vec<_> = state.tools.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        Ok(entries.into_iter().map(|entry| entry.tool.clone()).collect())
    }

    async fn get_tool(&self, qualified_name: &str) -> Result<Option<(String, Tool)>> {
        let state = self.state.read().await;
        Ok(state
            .tools
            .get(qualified_name)
            .map(|entry| (entry.provider_name.clone(), entry.tool.clone())))
    }

    async fn get_tools_by_provider(&self, provider_name: &str) -> Result<Vec<Tool>> {
        let state = self.state.read().await;
        if !state.providers.contains_key(provider_name) {
            return Err(UtcpError::ProviderNotFound(provider_name.to_string()).into());
        }
        let mut entries: Vec<_> = state
            .tools
            .values()
            .filter(|entry| entry.provider_name == provider_name)
            .collect();
        entries.sort_by_key(|entry| entry.seq);
        Ok(entries.into_iter().map(|entry| entry.tool.clone()).collect())
    }
}
