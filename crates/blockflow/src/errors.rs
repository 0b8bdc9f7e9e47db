use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum_macros::Display;
use thiserror::Error;

use crate::providers::factory::ProviderKind;

/// Provider-agnostic error taxonomy crossing the proxy boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    UnsupportedProvider,
    AuthFailed,
    RateLimited,
    InvalidRequest,
    ProviderUnavailable,
    /// Informational: the context payload was truncated to fit its budget.
    ContextBudgetExceeded,
    VaultDecryptFailed,
    Unknown,
}

impl ErrorKind {
    /// Kinds that qualify for the single transparent retry.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::RateLimited | ErrorKind::ProviderUnavailable)
    }

    pub fn is_fatal(self) -> bool {
        !matches!(self, ErrorKind::ContextBudgetExceeded)
    }
}

#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ChatError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    /// Raw provider text with secrets redacted. Server-side logging only.
    #[serde(skip)]
    pub diagnostic: Option<String>,
}

impl ChatError {
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
            provider: None,
            retry_after_ms: None,
            diagnostic: None,
        }
    }

    pub fn unsupported_provider(name: &str) -> Self {
        Self::new(
            ErrorKind::UnsupportedProvider,
            format!("Provider '{}' is not supported", name),
        )
    }

    pub fn auth_failed(provider: ProviderKind) -> Self {
        Self::new(
            ErrorKind::AuthFailed,
            format!(
                "Authentication with {} failed; check the stored API key",
                provider
            ),
        )
        .with_provider(provider)
    }

    pub fn rate_limited(provider: ProviderKind, retry_after: Option<Duration>) -> Self {
        let mut err = Self::new(
            ErrorKind::RateLimited,
            format!("{} rate limit reached", provider),
        )
        .with_provider(provider);
        err.retry_after_ms = retry_after.map(|d| d.as_millis() as u64);
        err
    }

    pub fn unavailable<S: Into<String>>(provider: ProviderKind, message: S) -> Self {
        Self::new(ErrorKind::ProviderUnavailable, message).with_provider(provider)
    }

    pub fn timeout(provider: ProviderKind) -> Self {
        Self::unavailable(provider, format!("{} did not respond in time", provider))
    }

    pub fn vault_decrypt_failed() -> Self {
        Self::new(
            ErrorKind::VaultDecryptFailed,
            "Stored credential could not be decrypted",
        )
    }

    pub fn context_budget_exceeded(dropped: usize, budget_chars: usize) -> Self {
        Self::new(
            ErrorKind::ContextBudgetExceeded,
            format!(
                "{} context item(s) dropped to fit the {} character budget",
                dropped, budget_chars
            ),
        )
    }

    pub fn with_provider(mut self, provider: ProviderKind) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_diagnostic<S: Into<String>>(mut self, diagnostic: S) -> Self {
        self.diagnostic = Some(diagnostic.into());
        self
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_ms.map(Duration::from_millis)
    }
}

pub type ProxyResult<T> = Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::RateLimited.is_retryable());
        assert!(ErrorKind::ProviderUnavailable.is_retryable());
        assert!(!ErrorKind::AuthFailed.is_retryable());
        assert!(!ErrorKind::InvalidRequest.is_retryable());
        assert!(!ErrorKind::Unknown.is_retryable());
        assert!(!ErrorKind::ContextBudgetExceeded.is_fatal());
    }

    #[test]
    fn test_serialization_skips_diagnostic() -> anyhow::Result<()> {
        let err = ChatError::auth_failed(ProviderKind::OpenAi)
            .with_diagnostic("{\"error\": \"Incorrect API key provided: [REDACTED]\"}");
        let value = serde_json::to_value(&err)?;

        assert_eq!(value["kind"], json!("auth_failed"));
        assert_eq!(value["provider"], json!("openai"));
        assert!(value.get("diagnostic").is_none());
        assert!(!value.to_string().contains("Incorrect API key"));
        Ok(())
    }

    #[test]
    fn test_rate_limited_carries_retry_after() {
        let err = ChatError::rate_limited(ProviderKind::Anthropic, Some(Duration::from_secs(2)));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(err.to_string(), "rate_limited: anthropic rate limit reached");
    }
}
