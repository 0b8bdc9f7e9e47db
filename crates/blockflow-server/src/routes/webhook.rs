use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use blockflow::webhook::{handle_webhook, WebhookOutcome};
use bytes::Bytes;

use crate::error::ApiError;
use crate::state::AppState;

pub const SIGNATURE_HEADER: &str = "x-signature";

async fn subscription_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    match handle_webhook(&state.webhook_secret, &body, signature, state.store.as_ref()).await {
        Ok(WebhookOutcome::Applied { .. }) => Ok(StatusCode::OK),
        // Unhandled event types are still acknowledged
        Ok(WebhookOutcome::Ignored { .. }) => Ok(StatusCode::OK),
        Err(err) => {
            tracing::warn!(error = %err, "webhook rejected");
            Err(err.into())
        }
    }
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/webhooks/subscription", post(subscription_webhook))
        .with_state(state)
}
