// UDP transport: one request datagram, one response datagram per operation.
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::net::UdpSocket;

use crate::context::CallContext;
use crate::errors::UtcpError;
use crate::providers::base::Provider;
use crate::providers::udp::UdpProvider;
use crate::tools::{Manual, Tool};
use crate::transports::{
    expect_provider, local_tool_name, stream::StreamResult, ClientTransport, ToolResult,
};

/// Largest payload a single datagram can deliver to us. A reply that fills
/// the whole buffer is assumed truncated.
const MAX_DATAGRAM: usize = 65_535;

/// Discovery request payload.
const DISCOVER: &[u8] = b"DISCOVER";

pub struct UdpTransport;

impl UdpTransport {
    pub fn new() -> Self {
        Self
    }

    /// One round trip on a fresh connected socket.
    async fn exchange(&self, prov: &UdpProvider, payload: &[u8]) -> Result<Vec<u8>> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| UtcpError::transport(prov.name(), e.to_string()))?;
        socket
            .connect(prov.address())
            .await
            .map_err(|e| UtcpError::transport(prov.name(), e.to_string()))?;

        socket
            .send(payload)
            .await
            .map_err(|e| UtcpError::transport(prov.name(), e.to_string()))?;

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let len = socket
            .recv(&mut buf)
            .await
            .map_err(|e| UtcpError::transport(prov.name(), e.to_string()))?;
        if len == MAX_DATAGRAM {
            return Err(UtcpError::PayloadTooLarge { limit: MAX_DATAGRAM }.into());
        }

        buf.truncate(len);
        Ok(buf)
    }
}

impl Default for UdpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClientTransport for UdpTransport {
    async fn register_tool_provider(
        &self,
        ctx: &CallContext,
        prov: &dyn Provider,
    ) -> Result<Vec<Tool>> {
        let udp_prov = expect_provider::<UdpProvider>(prov, "udp")?;

        let reply = ctx
            .drive(udp_prov.timeout_ms, self.exchange(udp_prov, DISCOVER))
            .await?;

        let manual: Manual = serde_json::from_slice(&reply)
            .map_err(|e| UtcpError::discovery(udp_prov.name(), e.to_string()))?;
        tracing::debug!(provider = %udp_prov.name(), version = %manual.version, "discovered manual");
        Ok(manual.tools)
    }

    async fn deregister_tool_provider(
        &self,
        _ctx: &CallContext,
        prov: &dyn Provider,
    ) -> Result<()> {
        expect_provider::<UdpProvider>(prov, "udp")?;
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
        let udp_prov = expect_provider::<UdpProvider>(prov, "udp")?;

        let request = serde_json::json!({
            "tool": local_tool_name(tool_name, &udp_prov.name()),
            "args": args,
        });
        let request_bytes = serde_json::to_vec(&request)?;

        let reply = ctx
            .drive(udp_prov.timeout_ms, self.exchange(udp_prov, &request_bytes))
            .await?;

        let value: Value = serde_json::from_slice(&reply)
            .map_err(|e| UtcpError::MalformedResponse(e.to_string()))?;
        Ok(ToolResult::Value(value))
    }

    async fn call_tool_stream(
        &self,
        _ctx: &CallContext,
        _tool_name: &str,
        _args: HashMap<String, Value>,
        prov: &dyn Provider,
    ) -> Result<Box<dyn StreamResult>> {
        expect_provider::<UdpProvider>(prov, "udp")?;
        Err(UtcpError::UnsupportedOp(
            "UDP does not support streaming; use a websocket or sse provider".to_string(),
        )
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::as_utcp_error;
    use crate::providers::base::{BaseProvider, ProviderType};
    use serde_json::json;
    use std::time::{Duration, Instant};

    async fn spawn_udp_server(reply_fn: impl Fn(Value) -> Vec<u8> + Send + 'static) -> String {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65_535];
            loop {
                let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let request = if &buf[..len] == DISCOVER {
                    Value::String("DISCOVER".to_string())
                } else {
                    serde_json::from_slice(&buf[..len]).unwrap_or(Value::Null)
                };
                let reply = reply_fn(request);
                let _ = socket.send_to(&reply, peer).await;
            }
        });
        addr.to_string()
    }

    fn provider(addr: &str, timeout_ms: Option<u64>) -> UdpProvider {
        let (host, port) = addr.rsplit_once(':').unwrap();
        UdpProvider {
            base: BaseProvider::new("udp".to_string(), ProviderType::Udp, None),
            host: host.to_string(),
            port: port.parse().unwrap(),
            timeout_ms,
        }
    }

    #[tokio::test]
    async fn discover_parses_the_manual_datagram() {
        let addr = spawn_udp_server(|req| {
            assert_eq!(req, json!("DISCOVER"));
            serde_json::to_vec(&json!({
                "version": "1.0",
                "tools": [{ "name": "udp_echo", "description": "Echo" }]
            }))
            .unwrap()
        })
        .await;

        let prov = provider(&addr, Some(1_000));
        let tools = UdpTransport::new()
            .register_tool_provider(&CallContext::new(), &prov)
            .await
            .unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "udp_echo");
    }

    #[tokio::test]
    async fn call_round_trips_the_echo_payload() {
        let addr = spawn_udp_server(|req| {
            assert_eq!(req.get("tool"), Some(&json!("udp_echo")));
            let msg = req["args"]["msg"].clone();
            serde_json::to_vec(&json!({ "result": msg })).unwrap()
        })
        .await;

        let prov = provider(&addr, Some(1_000));
        let result = UdpTransport::new()
            .call_tool(
                &CallContext::new(),
                "udp.udp_echo",
                HashMap::from([("msg".to_string(), json!("hi"))]),
                &prov,
                None,
            )
            .await
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(result, json!({ "result": "hi" }));
    }

    #[tokio::test]
    async fn silent_server_times_out_as_deadline_exceeded() {
        // Nothing listens on the discard port.
        let prov = provider("127.0.0.1:9", Some(100));
        let started = Instant::now();
        let err = UdpTransport::new()
            .call_tool(&CallContext::new(), "noop", HashMap::new(), &prov, None)
            .await
            .unwrap_err();
        assert!(matches!(
            as_utcp_error(&err),
            Some(UtcpError::DeadlineExceeded)
        ));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn non_json_reply_is_malformed() {
        let addr = spawn_udp_server(|_| b"not json at all".to_vec()).await;
        let prov = provider(&addr, Some(1_000));
        let err = UdpTransport::new()
            .call_tool(&CallContext::new(), "echo", HashMap::new(), &prov, None)
            .await
            .unwrap_err();
        assert!(matches!(
            as_utcp_error(&err),
            Some(UtcpError::MalformedResponse(_))
        ));
    }

    #[tokio::test]
    async fn stream_and_kind_mismatch_are_rejected() {
        let prov = provider("127.0.0.1:9", None);
        let transport = UdpTransport::new();

        let err = match transport
            .call_tool_stream(&CallContext::new(), "tool", HashMap::new(), &prov)
            .await
        {
            Err(err) => err,
            Ok(_) => panic!("expected error"),
        };
        assert!(matches!(
            as_utcp_error(&err),
            Some(UtcpError::UnsupportedOp(_))
        ));

        let wrong = BaseProvider::new("other".to_string(), ProviderType::Http, None);
        let err = transport
            .call_tool(&CallContext::new(), "tool", HashMap::new(), &wrong, None)
            .await
            .unwrap_err();
        assert!(matches!(
            as_utcp_error(&err),
            Some(UtcpError::TransportKindMismatch { .. })
        ));
    }
}
