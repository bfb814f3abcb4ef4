pub mod in_memory;

use crate::providers::base::Provider;
use crate::tools::Tool;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Name-indexed store of providers and their (qualified-name) tools.
///
/// Implementations must make `remove_provider` atomic with respect to
/// lookups: once it returns, no tool owned by that provider is observable.
#[async_trait]
pub trait ToolRepository: Send + Sync {
    /// Insert or replace a provider together with its full tool set.
    async fn save_provider_with_tools(
        &self,
        prov: Arc<dyn Provider>,
        tools: Vec<Tool>,
    ) -> Result<()>;
    async fn get_provider(&self, name: &str) -> Result<Option<Arc<dyn Provider>>>;
    /// Remove a provider and every tool it owns.
    async fn remove_provider(&self, name: &str) -> Result<()>;
    /// All tools, in registration order.
    async fn get_tools(&self) -> Result<Vec<Tool>>;
    /// Look up one tool by qualified name, returning its owning provider name.
    async fn get_tool(&self, qualified_name: &str) -> Result<Option<(String, Tool)>>;
    async fn get_tools_by_provider(&self, provider_name: &str) -> Result<Vec<Tool>>;
}
