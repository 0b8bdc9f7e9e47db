//! Subscription webhooks from the billing provider.
//!
//! The raw body is authenticated with a hex HMAC-SHA256 signature before anything
//! is parsed. Unknown event types are acknowledged and ignored.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use strum_macros::{Display, EnumString};
use thiserror::Error;

use crate::store::StoreError;
use crate::vault::Secret;

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("Webhook signature is missing or does not match")]
    InvalidSignature,

    #[error("Malformed webhook payload: {0}")]
    MalformedPayload(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SubscriptionEventKind {
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionCancelled,
    SubscriptionResumed,
    SubscriptionExpired,
    SubscriptionPaused,
    SubscriptionUnpaused,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub subscription_id: String,
    pub user_id: Option<String>,
    pub status: String,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn upsert_subscription(&self, record: SubscriptionRecord) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    Applied {
        event: SubscriptionEventKind,
        record: SubscriptionRecord,
    },
    Ignored {
        event: String,
    },
}

#[derive(Debug, Deserialize)]
struct Payload {
    meta: Meta,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct Meta {
    event_name: String,
    #[serde(default)]
    custom_data: Option<Value>,
}

/// Hex HMAC-SHA256 of `body`
pub fn sign(secret: &Secret, body: &[u8]) -> Result<String, WebhookError> {
    let mut mac = mac_for(secret)?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time comparison of a hex signature against the body
pub fn verify_signature(secret: &Secret, body: &[u8], signature: &str) -> Result<(), WebhookError> {
    let expected = hex::decode(signature.trim()).map_err(|_| WebhookError::InvalidSignature)?;
    let mut mac = mac_for(secret)?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| WebhookError::InvalidSignature)
}

fn mac_for(secret: &Secret) -> Result<HmacSha256, WebhookError> {
    HmacSha256::new_from_slice(secret.expose().as_bytes())
        .map_err(|_| WebhookError::InvalidSignature)
}

/// Verify, parse and apply one webhook delivery
pub async fn handle_webhook(
    secret: &Secret,
    body: &[u8],
    signature: Option<&str>,
    store: &dyn SubscriptionStore,
) -> Result<WebhookOutcome, WebhookError> {
    verify_signature(secret, body, signature.ok_or(WebhookError::InvalidSignature)?)?;

    let payload: Payload = serde_json::from_slice(body)
        .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;

    let Ok(event) = payload.meta.event_name.parse::<SubscriptionEventKind>() else {
        tracing::debug!(event = %payload.meta.event_name, "ignoring webhook event");
        return Ok(WebhookOutcome::Ignored {
            event: payload.meta.event_name,
        });
    };

    let record = subscription_record(&payload)?;
    store.upsert_subscription(record.clone()).await?;
    tracing::info!(
        event = %event,
        subscription_id = %record.subscription_id,
        status = %record.status,
        "subscription updated"
    );
    Ok(WebhookOutcome::Applied { event, record })
}

fn subscription_record(payload: &Payload) -> Result<SubscriptionRecord, WebhookError> {
    let subscription_id = match payload.data.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => return Err(WebhookError::MalformedPayload("missing data.id".to_string())),
    };
    let attributes = payload.data.get("attributes");
    let status = attributes
        .and_then(|a| a.get("status"))
        .and_then(|s| s.as_str())
        .ok_or_else(|| WebhookError::MalformedPayload("missing status".to_string()))?
        .to_string();
    let updated_at = attributes
        .and_then(|a| a.get("updated_at"))
        .and_then(|t| t.as_str())
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    let user_id = payload
        .meta
        .custom_data
        .as_ref()
        .and_then(|c| c.get("user_id"))
        .and_then(|u| u.as_str())
        .map(str::to_string);

    Ok(SubscriptionRecord {
        subscription_id,
        user_id,
        status,
        updated_at,
    })
}
