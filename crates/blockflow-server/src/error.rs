use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use blockflow::context::ContextError;
use blockflow::errors::{ChatError, ErrorKind};
use blockflow::store::StoreError;
use blockflow::vault::VaultError;
use blockflow::webhook::WebhookError;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {env_var}")]
    MissingEnvVar { env_var: String },

    #[error("Invalid value in {env_var}: {reason}")]
    InvalidValue { env_var: String, reason: String },

    #[error("Configuration error: {0}")]
    Other(#[from] config::ConfigError),
}

/// `vault.key` -> `BLOCKFLOW_VAULT__KEY`
pub fn to_env_var(field: &str) -> String {
    format!("BLOCKFLOW_{}", field.replace('.', "__").to_uppercase())
}

/// Field path out of serde's "missing field `x`" message, with the parent key when present
pub fn missing_field_path(message: &str) -> Option<String> {
    let rest = message.strip_prefix("missing field `")?;
    let (field, rest) = rest.split_once('`')?;
    let parent = rest
        .split_once("for key")
        .map(|(_, key)| key.trim().trim_matches(|c| c == '`' || c == '"'))
        .filter(|key| !key.is_empty());
    Some(match parent {
        Some(parent) => format!("{}.{}", parent, field),
        None => field.to_string(),
    })
}

/// HTTP status for each error kind crossing the API
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::AuthFailed | ErrorKind::VaultDecryptFailed => StatusCode::UNAUTHORIZED,
        ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::InvalidRequest | ErrorKind::UnsupportedProvider => StatusCode::BAD_REQUEST,
        ErrorKind::ContextBudgetExceeded => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorKind::ProviderUnavailable | ErrorKind::Unknown => StatusCode::BAD_GATEWAY,
    }
}

#[derive(Debug)]
pub enum ApiError {
    Chat(ChatError),
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Chat(err) => {
                let status = status_for(err.kind);
                let retry_after = err
                    .retry_after()
                    .map(|delay| delay.as_secs().max(1).to_string())
                    .and_then(|secs| HeaderValue::from_str(&secs).ok());
                let mut response = (status, Json(json!({ "error": err }))).into_response();
                if let Some(value) = retry_after {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
                return response;
            }
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Unauthorized(message) => (StatusCode::UNAUTHORIZED, message),
            ApiError::Internal(message) => {
                tracing::error!("Internal error: {}", message);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": { "message": body } }))).into_response()
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        if let Some(diagnostic) = &err.diagnostic {
            tracing::warn!(kind = %err.kind, diagnostic = %diagnostic, "chat request failed");
        }
        ApiError::Chat(err)
    }
}

impl From<VaultError> for ApiError {
    fn from(err: VaultError) -> Self {
        ApiError::from(ChatError::from(err))
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::BoardNotFound(_)
            | StoreError::BlockNotFound(_)
            | StoreError::ConnectionNotFound(_)
            | StoreError::CredentialNotFound(_) => ApiError::NotFound(err.to_string()),
            StoreError::SelfLoop | StoreError::MissingContextSource => {
                ApiError::BadRequest(err.to_string())
            }
            StoreError::Backend(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<ContextError> for ApiError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::Store(err) => err.into(),
        }
    }
}

impl From<WebhookError> for ApiError {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::InvalidSignature => ApiError::Unauthorized(err.to_string()),
            WebhookError::MalformedPayload(_) => ApiError::BadRequest(err.to_string()),
            WebhookError::Store(err) => err.into(),
        }
    }
}
