pub mod auth;
pub mod config;
pub mod context;
pub mod errors;
pub mod loader;
pub mod openapi;
pub mod providers;
pub mod repository;
pub mod search;
pub mod tools;
pub mod transports;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::UtcpClientConfig;
use crate::context::CallContext;
use crate::errors::UtcpError;
use crate::providers::base::{Provider, ProviderType};
use crate::repository::in_memory::InMemoryToolRepository;
use crate::repository::ToolRepository;
use crate::search::SubstringSearch;
use crate::tools::{Tool, ToolSearchStrategy};
use crate::transports::registry::TransportRegistry;
use crate::transports::stream::StreamResult;
use crate::transports::{ClientTransport, ToolResult};

/// Uniform client surface over the transport plug-ins.
#[async_trait]
pub trait UtcpClientInterface: Send + Sync {
    /// Discover a provider's tools and add them to the registry under
    /// `<provider>.<tool>` names. Registering an existing name replaces it.
    async fn register_tool_provider(
        &self,
        ctx: &CallContext,
        prov: Arc<dyn Provider>,
    ) -> Result<Vec<Tool>>;
    /// Remove a provider and its tools, then release transport resources.
    async fn deregister_tool_provider(&self, ctx: &CallContext, provider_name: &str) -> Result<()>;
    /// Call a tool by qualified (or unambiguous bare) name.
    async fn call_tool(
        &self,
        ctx: &CallContext,
        tool_name: &str,
        args: HashMap<String, Value>,
    ) -> Result<ToolResult>;
    /// Call a tool, requesting a streamed response.
    async fn call_tool_stream(
        &self,
        ctx: &CallContext,
        tool_name: &str,
        args: HashMap<String, Value>,
    ) -> Result<Box<dyn StreamResult>>;
    /// Rank registered tools against a query. `limit == 0` is unlimited.
    async fn search_tools(&self, query: &str, limit: usize) -> Result<Vec<Tool>>;
    fn get_transports(&self) -> HashMap<String, Arc<dyn ClientTransport>>;
    /// Tear down every transport-held resource.
    async fn close(&self) -> Result<()>;
}

pub struct UtcpClient {
    config: UtcpClientConfig,
    transports: TransportRegistry,
    tool_repository: Arc<dyn ToolRepository>,
    search_strategy: Arc<dyn ToolSearchStrategy>,
    name_pattern: Regex,
}

impl UtcpClient {
    /// Client with default transports, repository, and search strategy.
    /// Providers listed in the config file are registered before returning;
    /// individual failures are logged, not fatal.
    pub async fn create(config: UtcpClientConfig) -> Result<Self> {
        let repo: Arc<dyn ToolRepository> = Arc::new(InMemoryToolRepository::new());
        let strategy = Arc::new(SubstringSearch::new(repo.clone()));
        Self::with_components(
            config,
            TransportRegistry::with_default_transports(),
            repo,
            strategy,
        )
        .await
    }

    /// Client with caller-supplied transports, repository, and strategy.
    pub async fn with_components(
        config: UtcpClientConfig,
        transports: TransportRegistry,
        repo: Arc<dyn ToolRepository>,
        strategy: Arc<dyn ToolSearchStrategy>,
    ) -> Result<Self> {
        let client = Self {
            config,
            transports,
            tool_repository: repo,
            search_strategy: strategy,
            name_pattern: Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap(),
        };

        if let Some(providers_path) = client.config.providers_file_path.clone() {
            let providers =
                crate::loader::load_providers_from_file(&providers_path, &client.config).await?;
            let ctx = CallContext::new();
            for provider in providers {
                let name = provider.name();
                match client.register_tool_provider(&ctx, provider).await {
                    Ok(tools) => {
                        info!(provider = %name, tools = tools.len(), "registered provider");
                    }
                    Err(e) => {
                        warn!(provider = %name, error = %e, "failed to register provider");
                    }
                }
            }
        }

        Ok(client)
    }

    fn transport_for(&self, provider_type: ProviderType) -> Result<Arc<dyn ClientTransport>> {
        self.transports.get(provider_type.as_key()).ok_or_else(|| {
            UtcpError::Config(format!(
                "no transport registered for provider kind '{}'",
                provider_type.as_key()
            ))
            .into()
        })
    }

    /// Resolve a tool name to its provider and transport. Qualified names
    /// split at the first dot; bare names resolve only when exactly one
    /// registered tool matches.
    async fn resolve_tool(
        &self,
        tool_name: &str,
    ) -> Result<(String, Arc<dyn Provider>, Arc<dyn ClientTransport>)> {
        let qualified = if tool_name.contains('.') {
            match self.tool_repository.get_tool(tool_name).await? {
                Some(_) => tool_name.to_string(),
                None => return Err(UtcpError::ToolNotFound(tool_name.to_string()).into()),
            }
        } else {
            let suffix = format!(".{}", tool_name);
            let matches: Vec<String> = self
                .tool_repository
                .get_tools()
                .await?
                .into_iter()
                .map(|t| t.name)
                .filter(|name| name.ends_with(&suffix))
                .collect();
            match matches.len() {
                0 => return Err(UtcpError::ToolNotFound(tool_name.to_string()).into()),
                1 => matches.into_iter().next().unwrap(),
                _ => {
                    return Err(UtcpError::Config(format!(
                        "tool name '{}' is ambiguous across providers: {}",
                        tool_name,
                        matches.join(", ")
                    ))
                    .into())
                }
            }
        };

        let (provider_name, _) = qualified
            .split_once('.')
            .ok_or_else(|| UtcpError::ToolNotFound(qualified.clone()))?;
        let provider = self
            .tool_repository
            .get_provider(provider_name)
            .await?
            .ok_or_else(|| UtcpError::ProviderNotFound(provider_name.to_string()))?;
        let transport = self.transport_for(provider.type_())?;
        Ok((qualified, provider, transport))
    }
}

#[async_trait]
impl UtcpClientInterface for UtcpClient {
    async fn register_tool_provider(
        &self,
        ctx: &CallContext,
        prov: Arc<dyn Provider>,
    ) -> Result<Vec<Tool>> {
        let provider_name = prov.name();
        if !self.name_pattern.is_match(&provider_name) {
            return Err(UtcpError::Config(format!(
                "provider name '{}' is not a valid identifier",
                provider_name
            ))
            .into());
        }

        let transport = self.transport_for(prov.type_())?;

        // Replacement semantics: tear the old entry down before rediscovery.
        if self
            .tool_repository
            .get_provider(&provider_name)
            .await?
            .is_some()
        {
            self.deregister_tool_provider(ctx, &provider_name).await?;
        }

        // Discovery happens before any registry mutation, so a failure here
        // leaves the registry untouched.
        let discovered = transport.register_tool_provider(ctx, prov.as_ref()).await?;

        let prefix = format!("{}.", provider_name);
        let mut registered = Vec::new();
        for mut tool in discovered {
            if !tool.name.starts_with(&prefix) {
                tool.name = format!("{}{}", prefix, tool.name.trim_start_matches('.'));
            }
            let local = &tool.name[prefix.len()..];
            if !self.name_pattern.is_match(local) {
                warn!(tool = %tool.name, "skipping tool with invalid name");
                continue;
            }
            registered.push(tool);
        }

        self.tool_repository
            .save_provider_with_tools(prov, registered.clone())
            .await?;
        Ok(registered)
    }

    async fn deregister_tool_provider(&self, ctx: &CallContext, provider_name: &str) -> Result<()> {
        let prov = self
            .tool_repository
            .get_provider(provider_name)
            .await?
            .ok_or_else(|| UtcpError::ProviderNotFound(provider_name.to_string()))?;

        // Registry first: the provider's tools vanish atomically. Transport
        // failures are surfaced but never resurrect the registry entry.
        self.tool_repository.remove_provider(provider_name).await?;

        let transport = self.transport_for(prov.type_())?;
        transport.deregister_tool_provider(ctx, prov.as_ref()).await
    }

    async fn call_tool(
        &self,
        ctx: &CallContext,
        tool_name: &str,
        args: HashMap<String, Value>,
    ) -> Result<ToolResult> {
        let (qualified, provider, transport) = self.resolve_tool(tool_name).await?;
        transport
            .call_tool(ctx, &qualified, args, provider.as_ref(), None)
            .await
    }

    async fn call_tool_stream(
        &self,
        ctx: &CallContext,
        tool_name: &str,
        args: HashMap<String, Value>,
    ) -> Result<Box<dyn StreamResult>> {
        let (qualified, provider, transport) = self.resolve_tool(tool_name).await?;
        transport
            .call_tool_stream(ctx, &qualified, args, provider.as_ref())
            .await
    }

    async fn search_tools(&self, query: &str, limit: usize) -> Result<Vec<Tool>> {
        self.search_strategy.search_tools(query, limit).await
    }

    fn get_transports(&self) -> HashMap<String, Arc<dyn ClientTransport>> {
        self.transports.as_map()
    }

    async fn close(&self) -> Result<()> {
        let mut first_error = None;
        for (kind, transport) in self.transports.as_map() {
            if let Err(e) = transport.close().await {
                warn!(transport = %kind, error = %e, "transport close failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
