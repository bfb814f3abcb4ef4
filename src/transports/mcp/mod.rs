// MCP transport: JSON-RPC 2.0 over HTTP.
use anyhow::Result;
use async_trait::async_trait;
use reqwest::{header, Client};
use serde_json::{json, Value};
use std::collections::HashMap;

use crate::auth::{AuthConfig, OAuth2TokenManager};
use crate::context::CallContext;
use crate::errors::UtcpError;
use crate::providers::base::Provider;
use crate::providers::mcp::McpProvider;
use crate::tools::Tool;
use crate::transports::{
    expect_provider, local_tool_name, stream::StreamResult, ClientTransport, ToolResult,
};

pub struct McpTransport {
    client: Client,
    tokens: OAuth2TokenManager,
}

impl McpTransport {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            tokens: OAuth2TokenManager::new(),
        }
    }

    async fn apply_auth(
        &self,
        builder: reqwest::RequestBuilder,
        provider_name: &str,
        auth: &AuthConfig,
    ) -> Result<reqwest::RequestBuilder> {
        match auth {
            AuthConfig::ApiKey(api_key) => {
                let location = api_key.location.to_ascii_lowercase();
                match location.as_str() {
                    "header" => Ok(builder.header(&api_key.var_name, &api_key.api_key)),
                    "query" => {
                        Ok(builder.query(&[(api_key.var_name.clone(), api_key.api_key.clone())]))
                    }
                    "cookie" => {
                        let cookie_value = format!("{}={}", api_key.var_name, api_key.api_key);
                        Ok(builder.header(header::COOKIE, cookie_value))
                    }
                    other => Err(UtcpError::Config(format!(
                        "unsupported API key location: {}",
                        other
                    ))
                    .into()),
                }
            }
            AuthConfig::Basic(basic) => {
                Ok(builder.basic_auth(&basic.username, Some(&basic.password)))
            }
            AuthConfig::OAuth2(oauth) => {
                let token = self.tokens.bearer_token(provider_name, oauth).await?;
                Ok(builder.bearer_auth(token))
            }
        }
    }

    async fn rpc(&self, prov: &McpProvider, method: &str, params: Value) -> Result<Value> {
        let request_body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1,
        });

        let mut request = self.client.post(&prov.url).json(&request_body);
        if let Some(headers) = &prov.headers {
            for (k, v) in headers {
                request = request.header(k, v);
            }
        }
        if let Some(auth) = &prov.base.auth {
            request = self.apply_auth(request, &prov.name(), auth).await?;
        }

        let response = request
            .send()
            .await
            .map_err(|e| UtcpError::transport(prov.name(), e.to_string()))?;
        if !response.status().is_success() {
            return Err(UtcpError::transport(
                prov.name(),
                format!("MCP request failed: {}", response.status()),
            )
            .into());
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| UtcpError::MalformedResponse(e.to_string()))?;

        if let Some(error) = body.get("error") {
            return Err(UtcpError::CallFailed {
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("MCP error")
                    .to_string(),
                payload: Some(error.clone()),
            }
            .into());
        }

        body.get("result")
            .cloned()
            .ok_or_else(|| UtcpError::MalformedResponse("no result in MCP response".into()).into())
    }
}

impl Default for McpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClientTransport for McpTransport {
    async fn register_tool_provider(
        &self,
        ctx: &CallContext,
        prov: &dyn Provider,
    ) -> Result<Vec<Tool>> {
        let mcp_prov = expect_provider::<McpProvider>(prov, "mcp")?;

        let discover = async {
            let result = self
                .rpc(mcp_prov, "tools/list", json!({ "cursor": null }))
                .await
                .map_err(|e| UtcpError::discovery(mcp_prov.name(), e.to_string()))?;

            let mut tools = Vec::new();
            if let Some(raw_tools) = result.get("tools").and_then(Value::as_array) {
                for raw in raw_tools {
                    let Some(name) = raw.get("name").and_then(Value::as_str) else {
                        continue;
                    };
                    let mut tool = Tool::new(
                        name,
                        raw.get("description")
                            .and_then(Value::as_str)
                            .unwrap_or_default(),
                    );
                    if let Some(schema) = raw.get("inputSchema") {
                        if let Ok(parsed) = serde_json::from_value(schema.clone()) {
                            tool.inputs = parsed;
                        }
                    }
                    tools.push(tool);
                }
            }
            Ok(tools)
        };

        ctx.drive(None, discover).await
    }

    async fn deregister_tool_provider(
        &self,
        _ctx: &CallContext,
        prov: &dyn Provider,
    ) -> Result<()> {
        let mcp_prov = expect_provider::<McpProvider>(prov, "mcp")?;
        self.tokens.forget(&mcp_prov.name()).await;
        Ok(())
    }

    async fn call_tool(
        &self,
        ctx: &CallContext,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &dyn Provider,
        _correlation: Option<&str>,
    ) -> Result<ToolResult> {
        let mcp_prov = expect_provider::<McpProvider>(prov, "mcp")?;

        let params = json!({
            "name": local_tool_name(tool_name, &mcp_prov.name()),
            "arguments": args,
        });
        let result = ctx
            .drive(None, self.rpc(mcp_prov, "tools/call", params))
            .await?;
        Ok(ToolResult::Value(result))
    }

    async fn call_tool_stream(
        &self,
        _ctx: &CallContext,
        _tool_name: &str,
        _args: HashMap<String, Value>,
        prov: &dyn Provider,
    ) -> Result<Box<dyn StreamResult>> {
        expect_provider::<McpProvider>(prov, "mcp")?;
        Err(UtcpError::UnsupportedOp(
            "MCP streaming needs an sse or websocket provider".to_string(),
        )
        .into())
    }
}
