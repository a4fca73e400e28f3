//! Provider-related models.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Supported upstream LLM providers.
///
/// Providers are opaque to the core: tasks may carry a provider override,
/// but only the injected executor interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Openai,
    Xai,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::Openai => "openai",
            ProviderType::Xai => "xai",
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
