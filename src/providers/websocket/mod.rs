use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::auth::AuthConfig;
use crate::providers::base::{BaseProvider, Provider, ProviderType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebSocketProvider {
    #[serde(flatten)]
    pub base: BaseProvider,
    /// Discovery URL; the streaming connection dials the same endpoint with
    /// any trailing `/tools` segment removed.
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default)]
    pub keep_alive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Provider for WebSocketProvider {
    fn type_(&self) -> ProviderType {
        ProviderType::Websocket
    }

    fn name(&self) -> String {
        self.base.name.clone()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl WebSocketProvider {
    pub fn new(name: String, url: String, auth: Option<AuthConfig>) -> Self {
        Self {
            base: BaseProvider::new(name, ProviderType::Websocket, auth),
            url,
            protocol: None,
            keep_alive: false,
            headers: None,
            timeout_ms: None,
        }
    }
}
