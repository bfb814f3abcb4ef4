pub mod cli;
pub mod graphql;
pub mod grpc;
pub mod http;
pub mod http_stream;
pub mod mcp;
pub mod registry;
pub mod sse;
pub mod stream;
pub mod tcp;
pub mod text;
pub mod udp;
pub mod webrtc;
pub mod websocket;

use crate::context::CallContext;
use crate::errors::UtcpError;
use crate::providers::base::Provider;
use crate::tools::Tool;
use crate::transports::stream::StreamResult;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

/// Result of a single tool call: either one value or a lazy stream, depending
/// on what the transport's wire protocol naturally produces.
pub enum ToolResult {
    Value(Value),
    Stream(Box<dyn StreamResult>),
}

impl ToolResult {
    pub fn is_stream(&self) -> bool {
        matches!(self, ToolResult::Stream(_))
    }

    pub fn into_value(self) -> Result<Value> {
        match self {
            ToolResult::Value(v) => Ok(v),
            ToolResult::Stream(_) => Err(UtcpError::UnsupportedOp(
                "call produced a stream; consume it via into_stream".to_string(),
            )
            .into()),
        }
    }

    pub fn into_stream(self) -> Result<Box<dyn StreamResult>> {
        match self {
            ToolResult::Stream(s) => Ok(s),
            ToolResult::Value(_) => Err(UtcpError::UnsupportedOp(
                "call produced a single value, not a stream".to_string(),
            )
            .into()),
        }
    }
}

impl std::fmt::Debug for ToolResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolResult::Value(v) => f.debug_tuple("Value").field(v).finish(),
            ToolResult::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Core transport abstraction every provider kind implements.
///
/// Each operation fails with `TransportKindMismatch` when handed a provider
/// of the wrong kind, and honors the context's deadline and cancellation.
#[async_trait]
pub trait ClientTransport: Send + Sync {
    /// Perform discovery and return the provider's tools. Idempotent: calling
    /// it again on a live provider may refresh the set but must not disturb
    /// other providers.
    async fn register_tool_provider(
        &self,
        ctx: &CallContext,
        prov: &dyn Provider,
    ) -> Result<Vec<Tool>>;

    /// Release any long-lived resources bound to the provider.
    async fn deregister_tool_provider(&self, ctx: &CallContext, prov: &dyn Provider)
        -> Result<()>;

    /// Single-response call. `correlation` is a caller-supplied id honored by
    /// multiplexing transports.
    async fn call_tool(
        &self,
        ctx: &CallContext,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &dyn Provider,
        correlation: Option<&str>,
    ) -> Result<ToolResult>;

    /// Initiate a streamed response.
    async fn call_tool_stream(
        &self,
        ctx: &CallContext,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &dyn Provider,
    ) -> Result<Box<dyn StreamResult>>;

    /// Tear down every provider-scoped resource this transport holds.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Strip the `<provider>.` prefix the registry added, when present.
pub(crate) fn local_tool_name<'a>(tool_name: &'a str, provider_name: &str) -> &'a str {
    tool_name
        .strip_prefix(provider_name)
        .and_then(|rest| rest.strip_prefix('.'))
        .unwrap_or(tool_name)
}

/// Downcast helper shared by the concrete transports.
pub(crate) fn expect_provider<'a, P: 'static>(
    prov: &'a dyn Provider,
    expected: &'static str,
) -> Result<&'a P> {
    prov.as_any().downcast_ref::<P>().ok_or_else(|| {
        UtcpError::TransportKindMismatch {
            provider: prov.name(),
            expected,
        }
        .into()
    })
}

pub use registry::TransportRegistry;
