use serde::{Deserialize, Serialize};

use crate::auth::AuthConfig;

/// Closed set of provider kinds. Unknown discriminators fail at parse time
/// rather than mapping onto a catch-all variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    Http,
    Sse,
    HttpStream,
    Cli,
    Websocket,
    Grpc,
    Graphql,
    Tcp,
    Udp,
    Webrtc,
    Mcp,
    Text,
}

impl ProviderType {
    /// Registry key; also the `provider_type` discriminator on the wire.
    pub fn as_key(&self) -> &'static str {
        match self {
            ProviderType::Http => "http",
            ProviderType::Sse => "sse",
            ProviderType::HttpStream => "http_stream",
            ProviderType::Cli => "cli",
            ProviderType::Websocket => "websocket",
            ProviderType::Grpc => "grpc",
            ProviderType::Graphql => "graphql",
            ProviderType::Tcp => "tcp",
            ProviderType::Udp => "udp",
            ProviderType::Webrtc => "webrtc",
            ProviderType::Mcp => "mcp",
            ProviderType::Text => "text",
        }
    }
}

pub trait Provider: Send + Sync + std::fmt::Debug + std::any::Any {
    fn type_(&self) -> ProviderType;
    fn name(&self) -> String;

    fn as_any(&self) -> &dyn std::any::Any;
}

/// Fields shared by every provider kind; flattened into each concrete struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseProvider {
    pub name: String,
    pub provider_type: ProviderType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
}

impl BaseProvider {
    pub fn new(name: String, provider_type: ProviderType, auth: Option<AuthConfig>) -> Self {
        Self {
            name,
            provider_type,
            auth,
        }
    }
}

impl Provider for BaseProvider {
    fn type_(&self) -> ProviderType {
        self.provider_type
    }
    fn name(&self) -> String {
        self.name.clone()
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
