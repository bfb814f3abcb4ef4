use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::auth::AuthConfig;
use crate::providers::base::{BaseProvider, Provider, ProviderType};

/// Local template provider: each entry in `templates` is one tool whose call
/// renders the template against the call arguments. No network involved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextProvider {
    #[serde(flatten)]
    pub base: BaseProvider,
    #[serde(default)]
    pub templates: HashMap<String, String>,
}

impl Provider for TextProvider {
    fn type_(&self) -> ProviderType {
        ProviderType::Text
    }

    fn name(&self) -> String {
        self.base.name.clone()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl TextProvider {
    pub fn new(
        name: String,
        templates: HashMap<String, String>,
        auth: Option<AuthConfig>,
    ) -> Self {
        Self {
            base: BaseProvider::new(name, ProviderType::Text, auth),
            templates,
        }
    }
}
