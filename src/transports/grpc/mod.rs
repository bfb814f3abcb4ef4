// gRPC transport for the UTCP service (GetManual / CallTool / CallToolStream).
use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use tokio::sync::{mpsc, Mutex};
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, Endpoint};
use tonic::Request;

use crate::auth::AuthConfig;
use crate::context::CallContext;
use crate::errors::UtcpError;
use crate::providers::base::Provider;
use crate::providers::grpc::GrpcProvider;
use crate::tools::Tool;
use crate::transports::{
    expect_provider, local_tool_name,
    stream::{boxed_channel_stream, StreamResult},
    ClientTransport, ToolResult,
};

// Wire messages of the UTCP gRPC service. Hand-derived rather than generated:
// the .proto (and any raw-service stubs) live with the servers, not here.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Empty {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ToolCallRequest {
    #[prost(string, tag = "1")]
    pub tool: String,
    #[prost(string, tag = "2")]
    pub args_json: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ToolCallResponse {
    #[prost(string, tag = "1")]
    pub result_json: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ToolDefinition {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub description: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ManualReply {
    #[prost(string, tag = "1")]
    pub version: String,
    #[prost(message, repeated, tag = "2")]
    pub tools: Vec<ToolDefinition>,
}

const GET_MANUAL: &str = "/utcp.UtcpService/GetManual";
const CALL_TOOL: &str = "/utcp.UtcpService/CallTool";
const CALL_TOOL_STREAM: &str = "/utcp.UtcpService/CallToolStream";

pub struct GrpcTransport {
    /// Persistent channel per provider; torn down on deregister/close.
    channels: Mutex<HashMap<String, Channel>>,
}

impl GrpcTransport {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    async fn channel_for(&self, prov: &GrpcProvider) -> Result<Channel> {
        let mut channels = self.channels.lock().await;
        if let Some(channel) = channels.get(&prov.name()) {
            return Ok(channel.clone());
        }

        let endpoint = Endpoint::from_shared(prov.endpoint())
            .map_err(|e| UtcpError::Config(format!("bad gRPC endpoint: {}", e)))?;
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| UtcpError::transport(prov.name(), e.to_string()))?;
        channels.insert(prov.name(), channel.clone());
        Ok(channel)
    }

    fn apply_auth<T>(prov: &GrpcProvider, req: &mut Request<T>) -> Result<()> {
        if let Some(auth) = &prov.base.auth {
            match auth {
                AuthConfig::Basic(auth) => {
                    let basic = base64::engine::general_purpose::STANDARD
                        .encode(format!("{}:{}", auth.username, auth.password));
                    let value = MetadataValue::from_str(&format!("Basic {}", basic))
                        .map_err(|e| UtcpError::Config(e.to_string()))?;
                    req.metadata_mut().insert("authorization", value);
                }
                _ => {
                    return Err(UtcpError::Config(
                        "only basic auth is supported for gRPC providers".to_string(),
                    )
                    .into());
                }
            }
        }
        Ok(())
    }

    /// Providers configured for a raw named method need generated stubs to
    /// marshal their request message; reject them up front.
    fn reject_raw_mode(prov: &GrpcProvider) -> Result<()> {
        if prov.method_name.is_some() || prov.service_name.is_some() {
            return Err(UtcpError::UnsupportedOp(
                "raw gRPC methods require generated stubs; only the UTCP service is wired in"
                    .to_string(),
            )
            .into());
        }
        Ok(())
    }

    async fn grpc_client(&self, prov: &GrpcProvider) -> Result<tonic::client::Grpc<Channel>> {
        let channel = self.channel_for(prov).await?;
        let mut grpc = tonic::client::Grpc::new(channel);
        grpc.ready()
            .await
            .map_err(|e| UtcpError::transport(prov.name(), e.to_string()))?;
        Ok(grpc)
    }

    fn decode_result(result_json: &str) -> Value {
        if result_json.is_empty() {
            return Value::Null;
        }
        serde_json::from_str(result_json)
            .unwrap_or_else(|_| Value::String(result_json.to_string()))
    }
}

impl Default for GrpcTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClientTransport for GrpcTransport {
    async fn register_tool_provider(
        &self,
        ctx: &CallContext,
        prov: &dyn Provider,
    ) -> Result<Vec<Tool>> {
        let grpc_prov = expect_provider::<GrpcProvider>(prov, "grpc")?;
        Self::reject_raw_mode(grpc_prov)?;

        let discover = async {
            let mut grpc = self.grpc_client(grpc_prov).await?;
            let mut request = Request::new(Empty {});
            Self::apply_auth(grpc_prov, &mut request)?;

            let codec: tonic::codec::ProstCodec<Empty, ManualReply> =
                tonic::codec::ProstCodec::default();
            let manual = grpc
                .unary(request, PathAndQuery::from_static(GET_MANUAL), codec)
                .await
                .map_err(|status| UtcpError::discovery(grpc_prov.name(), status.to_string()))?
                .into_inner();

            Ok(manual
                .tools
                .into_iter()
                .map(|t| Tool::new(t.name, t.description))
                .collect())
        };

        ctx.drive(None, discover).await
    }

    async fn deregister_tool_provider(
        &self,
        _ctx: &CallContext,
        prov: &dyn Provider,
    ) -> Result<()> {
        let grpc_prov = expect_provider::<GrpcProvider>(prov, "grpc")?;
        self.channels.lock().await.remove(&grpc_prov.name());
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
        let grpc_prov = expect_provider::<GrpcProvider>(prov, "grpc")?;
        Self::reject_raw_mode(grpc_prov)?;

        let call = async {
            let mut grpc = self.grpc_client(grpc_prov).await?;
            let mut request = Request::new(ToolCallRequest {
                tool: local_tool_name(tool_name, &grpc_prov.name()).to_string(),
                args_json: serde_json::to_string(&args)?,
            });
            Self::apply_auth(grpc_prov, &mut request)?;

            let codec: tonic::codec::ProstCodec<ToolCallRequest, ToolCallResponse> =
                tonic::codec::ProstCodec::default();
            let response = grpc
                .unary(request, PathAndQuery::from_static(CALL_TOOL), codec)
                .await
                .map_err(|status| UtcpError::CallFailed {
                    message: status.message().to_string(),
                    payload: None,
                })?
                .into_inner();

            Ok(ToolResult::Value(Self::decode_result(&response.result_json)))
        };

        ctx.drive(None, call).await
    }

    async fn call_tool_stream(
        &self,
        ctx: &CallContext,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &dyn Provider,
    ) -> Result<Box<dyn StreamResult>> {
        let grpc_prov = expect_provider::<GrpcProvider>(prov, "grpc")?;
        Self::reject_raw_mode(grpc_prov)?;

        let provider_name = grpc_prov.name();
        let open = async {
            let mut grpc = self.grpc_client(grpc_prov).await?;
            let mut request = Request::new(ToolCallRequest {
                tool: local_tool_name(tool_name, &provider_name).to_string(),
                args_json: serde_json::to_string(&args)?,
            });
            Self::apply_auth(grpc_prov, &mut request)?;

            let codec: tonic::codec::ProstCodec<ToolCallRequest, ToolCallResponse> =
                tonic::codec::ProstCodec::default();
            grpc.server_streaming(request, PathAndQuery::from_static(CALL_TOOL_STREAM), codec)
                .await
                .map_err(|status| {
                    UtcpError::transport(provider_name.clone(), status.to_string()).into()
                })
        };
        let mut inbound = ctx.drive(None, open).await?.into_inner();

        let (tx, rx) = mpsc::channel(16);
        let provider_name = grpc_prov.name();
        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(reply)) => {
                        if tx
                            .send(Ok(Self::decode_result(&reply.result_json)))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(status) => {
                        let _ = tx
                            .send(Err(UtcpError::transport(
                                provider_name,
                                status.to_string(),
                            )))
                            .await;
                        return;
                    }
                }
            }
        });

        Ok(boxed_channel_stream(rx, None))
    }

    async fn close(&self) -> Result<()> {
        self.channels.lock().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{ApiKeyAuth, BasicAuth};
    use crate::errors::as_utcp_error;

    #[test]
    fn apply_auth_sets_basic_header() {
        let prov = GrpcProvider::new(
            "grpc".to_string(),
            "localhost".to_string(),
            50051,
            Some(AuthConfig::Basic(BasicAuth::new(
                "user".into(),
                "pass".into(),
            ))),
        );

        let mut request: Request<()> = Request::new(());
        GrpcTransport::apply_auth(&prov, &mut request).unwrap();

        let header = request.metadata().get("authorization").unwrap();
        assert_eq!(header.to_str().unwrap(), "Basic dXNlcjpwYXNz");
    }

    #[test]
    fn apply_auth_rejects_non_basic() {
        let prov = GrpcProvider::new(
            "grpc".to_string(),
            "localhost".to_string(),
            50051,
            Some(AuthConfig::ApiKey(ApiKeyAuth::new("secret".into()))),
        );

        let mut request: Request<()> = Request::new(());
        let err = GrpcTransport::apply_auth(&prov, &mut request).unwrap_err();
        assert!(matches!(as_utcp_error(&err), Some(UtcpError::Config(_))));
    }

    #[tokio::test]
    async fn raw_method_mode_is_unsupported() {
        let mut prov = GrpcProvider::new("grpc".to_string(), "localhost".to_string(), 50051, None);
        prov.service_name = Some("pkg.Custom".to_string());
        prov.method_name = Some("Frobnicate".to_string());

        let err = GrpcTransport::new()
            .call_tool(&CallContext::new(), "x", HashMap::new(), &prov, None)
            .await
            .unwrap_err();
        assert!(matches!(
            as_utcp_error(&err),
            Some(UtcpError::UnsupportedOp(_))
        ));
    }

    #[test]
    fn endpoint_scheme_follows_use_ssl() {
        let mut prov = GrpcProvider::new("g".to_string(), "host".to_string(), 7, None);
        assert_eq!(prov.endpoint(), "http://host:7");
        prov.use_ssl = true;
        assert_eq!(prov.endpoint(), "https://host:7");
    }

    #[test]
    fn empty_result_json_decodes_to_null() {
        assert_eq!(GrpcTransport::decode_result(""), Value::Null);
        assert_eq!(
            GrpcTransport::decode_result("{\"a\":1}"),
            serde_json::json!({"a": 1})
        );
        assert_eq!(
            GrpcTransport::decode_result("plain text"),
            Value::String("plain text".to_string())
        );
    }
}
