// WebRTC transport. Data channels need an external signaling integration;
// until one is plugged in, operations beyond kind checks are unsupported.
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

use crate::context::CallContext;
use crate::errors::UtcpError;
use crate::providers::base::Provider;
use crate::providers::webrtc::WebRtcProvider;
use crate::tools::Tool;
use crate::transports::{expect_provider, stream::StreamResult, ClientTransport, ToolResult};

pub struct WebRtcTransport;

impl WebRtcTransport {
    pub fn new() -> Self {
        Self
    }

    fn unsupported(op: &str) -> anyhow::Error {
        UtcpError::UnsupportedOp(format!(
            "webrtc {} requires a signaling integration, which is not wired into this client",
            op
        ))
        .into()
    }
}

impl Default for WebRtcTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClientTransport for WebRtcTransport {
    async fn register_tool_provider(
        &self,
        _ctx: &CallContext,
        prov: &dyn Provider,
    ) -> Result<Vec<Tool>> {
        expect_provider::<WebRtcProvider>(prov, "webrtc")?;
        Err(Self::unsupported("discovery"))
    }

    async fn deregister_tool_provider(
        &self,
        _ctx: &CallContext,
        prov: &dyn Provider,
    ) -> Result<()> {
        expect_provider::<WebRtcProvider>(prov, "webrtc")?;
        Ok(())
    }

    async fn call_tool(
        &self,
        _ctx: &CallContext,
        _tool_name: &str,
        _args: HashMap<String, Value>,
        prov: &dyn Provider,
        _correlation: Option<&str>,
    ) -> Result<ToolResult> {
        expect_provider::<WebRtcProvider>(prov, "webrtc")?;
        Err(Self::unsupported("calls"))
    }

    async fn call_tool_stream(
        &self,
        _ctx: &CallContext,
        _tool_name: &str,
        _args: HashMap<String, Value>,
        prov: &dyn Provider,
    ) -> Result<Box<dyn StreamResult>> {
        expect_provider::<WebRtcProvider>(prov, "webrtc")?;
        Err(Self::unsupported("streaming"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::as_utcp_error;
    use crate::providers::base::{BaseProvider, ProviderType};

    #[tokio::test]
    async fn operations_report_unsupported_not_mismatch() {
        let prov = WebRtcProvider::new(
            "rtc".to_string(),
            "wss://signal.example.com".to_string(),
            None,
        );
        let transport = WebRtcTransport::new();

        let err = transport
            .register_tool_provider(&CallContext::new(), &prov)
            .await
            .unwrap_err();
        assert!(matches!(
            as_utcp_error(&err),
            Some(UtcpError::UnsupportedOp(_))
        ));

        // Deregister is a safe no-op so client shutdown never trips on it.
        transport
            .deregister_tool_provider(&CallContext::new(), &prov)
            .await
            .unwrap();

        let wrong = BaseProvider::new("w".to_string(), ProviderType::Http, None);
        let err = transport
            .call_tool(&CallContext::new(), "t", HashMap::new(), &wrong, None)
            .await
            .unwrap_err();
        assert!(matches!(
            as_utcp_error(&err),
            Some(UtcpError::TransportKindMismatch { .. })
        ));
    }
}
