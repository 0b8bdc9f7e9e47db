pub mod blocks;
pub mod chat;
pub mod credentials;
pub mod webhook;

use axum::body::Body;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Router;
use blockflow::errors::ChatError;
use blockflow::providers::base::ChatEvent;
use blockflow::store::GraphStore;
use blockflow::vault::Secret;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use serde::Serialize;
use std::convert::Infallible;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

pub fn configure(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(chat::routes(state.clone()))
        .merge(blocks::routes(state.clone()))
        .merge(credentials::routes(state.clone()))
        .merge(webhook::routes(state))
        .layer(cors)
}

/// Look up a stored credential and decrypt it for a single provider call
pub(crate) async fn resolve_credential(
    state: &AppState,
    credential_id: Uuid,
) -> Result<Secret, ApiError> {
    let credential = state.store.get_credential(credential_id).await?;
    Ok(state.vault.decrypt(&credential.blob)?)
}

/// One server-sent event frame
pub(crate) fn sse_frame<T: Serialize>(event: Option<&str>, data: &T) -> String {
    let data = serde_json::to_string(data).unwrap_or_else(|_| "null".to_string());
    match event {
        Some(event) => format!("event: {}\ndata: {}\n\n", event, data),
        None => format!("data: {}\n\n", data),
    }
}

pub(crate) fn event_frame(item: &Result<ChatEvent, ChatError>) -> String {
    match item {
        Ok(event) => sse_frame(None, event),
        Err(err) => {
            if let Some(diagnostic) = &err.diagnostic {
                tracing::warn!(kind = %err.kind, diagnostic = %diagnostic, "stream failed");
            }
            sse_frame(Some("error"), err)
        }
    }
}

/// `text/event-stream` body over pre-rendered frames.
///
/// Dropping the response body drops the frame stream, which cancels the upstream call.
pub struct SseResponse {
    frames: BoxStream<'static, String>,
}

impl SseResponse {
    pub fn new(frames: BoxStream<'static, String>) -> Self {
        Self { frames }
    }
}

impl IntoResponse for SseResponse {
    fn into_response(self) -> Response {
        let body = Body::from_stream(
            self.frames
                .map(|frame| Ok::<_, Infallible>(Bytes::from(frame))),
        );
        (
            [
                (header::CONTENT_TYPE, "text/event-stream"),
                (header::CACHE_CONTROL, "no-cache"),
                (header::CONNECTION, "keep-alive"),
            ],
            body,
        )
            .into_response()
    }
}
