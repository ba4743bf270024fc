//! Client registry and factory.
//!
//! Maps provider names to concrete [`LlmClient`] implementations.

use std::sync::Arc;

use crate::client::provider::LlmClient;
use crate::client::providers::OpenAiClient;
use crate::config::AppConfig;
use crate::error::ClientError;

/// Creates an [`LlmClient`] based on the configured provider name.
///
/// # Supported Providers
///
/// - `"openai"` (default) — OpenAI-compatible APIs via `async-openai`
///
/// # Errors
///
/// Returns [`ClientError::UnsupportedProvider`] for unknown provider
/// names and [`ClientError::ApiKeyMissing`] when no key is configured.
pub fn create_client(config: &AppConfig) -> Result<Arc<dyn LlmClient>, ClientError> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiClient::new(config)?)),
        other => Err(ClientError::UnsupportedProvider {
            name: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_openai_client() {
        let config = AppConfig::builder().api_key("test").build();
        let client = create_client(&config);
        assert!(client.is_ok());
        assert_eq!(client.unwrap_or_else(|_| unreachable!()).name(), "openai");
    }

    #[test]
    fn test_create_unknown_provider() {
        let config = AppConfig::builder()
            .api_key("test")
            .provider("unknown")
            .build();
        let result = create_client(&config);
        assert!(matches!(
            result,
            Err(ClientError::UnsupportedProvider { .. })
        ));
    }

    #[test]
    fn test_create_without_api_key() {
        let config = AppConfig::builder().build();
        assert!(matches!(
            create_client(&config),
            Err(ClientError::ApiKeyMissing)
        ));
    }
}
