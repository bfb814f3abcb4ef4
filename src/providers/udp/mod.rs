use serde::{Deserialize, Serialize};

use crate::auth::AuthConfig;
use crate::providers::base::{BaseProvider, Provider, ProviderType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UdpProvider {
    #[serde(flatten)]
    pub base: BaseProvider,
    pub host: String,
    pub port: u16,
    /// Default per-call timeout when the context carries no deadline.
    /// Zero (or absent) waits forever.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Provider for UdpProvider {
    fn type_(&self) -> ProviderType {
        ProviderType::Udp
    }

    fn name(&self) -> String {
        self.base.name.clone()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl UdpProvider {
    pub fn new(name: String, host: String, port: u16, auth: Option<AuthConfig>) -> Self {
        Self {
            base: BaseProvider::new(name, ProviderType::Udp, auth),
            host,
            port,
            timeout_ms: Some(30_000),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
