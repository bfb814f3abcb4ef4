use serde::{Deserialize, Serialize};

use crate::auth::AuthConfig;
use crate::providers::base::{BaseProvider, Provider, ProviderType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrpcProvider {
    #[serde(flatten)]
    pub base: BaseProvider,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub use_ssl: bool,
    /// Raw-method mode: fully-qualified service and method names. Calling a
    /// raw method needs generated stubs, which live outside this crate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method_name: Option<String>,
}

impl Provider for GrpcProvider {
    fn type_(&self) -> ProviderType {
        ProviderType::Grpc
    }

    fn name(&self) -> String {
        self.base.name.clone()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl GrpcProvider {
    pub fn new(name: String, host: String, port: u16, auth: Option<AuthConfig>) -> Self {
        Self {
            base: BaseProvider::new(name, ProviderType::Grpc, auth),
            host,
            port,
            use_ssl: false,
            service_name: None,
            method_name: None,
        }
    }

    pub fn endpoint(&self) -> String {
        let scheme = if self.use_ssl { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}
