// TCP transport: newline-delimited JSON over a fresh connection per call.
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::context::CallContext;
use crate::errors::UtcpError;
use crate::providers::base::Provider;
use crate::providers::tcp::TcpProvider;
use crate::tools::{Manual, Tool};
use crate::transports::{
    expect_provider, local_tool_name, stream::StreamResult, ClientTransport, ToolResult,
};

pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }

    /// Send one JSON line, read one JSON line back.
    async fn exchange(&self, prov: &TcpProvider, message: &Value) -> Result<Value> {
        let stream = TcpStream::connect(prov.address())
            .await
            .map_err(|e| UtcpError::transport(prov.name(), e.to_string()))?;
        let (read_half, mut write_half) = stream.into_split();

        let mut payload = serde_json::to_vec(message)?;
        payload.push(b'\n');
        write_half
            .write_all(&payload)
            .await
            .map_err(|e| UtcpError::transport(prov.name(), e.to_string()))?;
        write_half
            .flush()
            .await
            .map_err(|e| UtcpError::transport(prov.name(), e.to_string()))?;

        let mut line = String::new();
        let mut reader = BufReader::new(read_half);
        let read = reader
            .read_line(&mut line)
            .await
            .map_err(|e| UtcpError::transport(prov.name(), e.to_string()))?;
        if read == 0 {
            return Err(UtcpError::transport(prov.name(), "connection closed before reply").into());
        }

        serde_json::from_str(line.trim_end())
            .map_err(|e| UtcpError::MalformedResponse(e.to_string()).into())
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClientTransport for TcpTransport {
    async fn register_tool_provider(
        &self,
        ctx: &CallContext,
        prov: &dyn Provider,
    ) -> Result<Vec<Tool>> {
        let tcp_prov = expect_provider::<TcpProvider>(prov, "tcp")?;

        let request = serde_json::json!({ "action": "list" });
        let reply = ctx
            .drive(tcp_prov.timeout_ms, self.exchange(tcp_prov, &request))
            .await?;

        let manual: Manual = serde_json::from_value(reply)
            .map_err(|e| UtcpError::discovery(tcp_prov.name(), e.to_string()))?;
        tracing::debug!(provider = %tcp_prov.name(), version = %manual.version, "discovered manual");
        Ok(manual.tools)
    }

    async fn deregister_tool_provider(
        &self,
        _ctx: &CallContext,
        prov: &dyn Provider,
    ) -> Result<()> {
        expect_provider::<TcpProvider>(prov, "tcp")?;
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
        let tcp_prov = expect_provider::<TcpProvider>(prov, "tcp")?;

        let request = serde_json::json!({
            "tool": local_tool_name(tool_name, &tcp_prov.name()),
            "args": args,
        });
        let reply = ctx
            .drive(tcp_prov.timeout_ms, self.exchange(tcp_prov, &request))
            .await?;
        Ok(ToolResult::Value(reply))
    }

    async fn call_tool_stream(
        &self,
        _ctx: &CallContext,
        _tool_name: &str,
        _args: HashMap<String, Value>,
        prov: &dyn Provider,
    ) -> Result<Box<dyn StreamResult>> {
        expect_provider::<TcpProvider>(prov, "tcp")?;
        Err(UtcpError::UnsupportedOp(
            "TCP calls are single-reply; use a websocket provider for streams".to_string(),
        )
        .into())
    }
}
