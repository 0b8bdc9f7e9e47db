use async_stream::stream;
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use blockflow::context::{ContextPayload, ContextRequest, UnavailableSource};
use blockflow::errors::{ChatError, ErrorKind};
use blockflow::models::board::Block;
use blockflow::models::message::{ChatMessage, Message, MessageMetadata};
use blockflow::models::reference::ChatReference;
use blockflow::providers::base::{ChatInvocation, GenerationParams, Usage};
use blockflow::store::GraphStore;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use uuid::Uuid;

use super::{event_frame, resolve_credential, sse_frame, SseResponse};
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    content: String,
    credential_ref: Uuid,
    #[serde(default)]
    references: Vec<ChatReference>,
    #[serde(default)]
    include_transitive: bool,
    budget_chars: Option<usize>,
    #[serde(default)]
    params: GenerationParams,
    #[serde(default = "default_stream")]
    stream: bool,
}

fn default_stream() -> bool {
    true
}

#[derive(Debug, Serialize)]
struct SendMessageResponse {
    message: Message,
    #[serde(skip_serializing_if = "Option::is_none")]
    notice: Option<ChatError>,
    unavailable_sources: Vec<UnavailableSource>,
}

#[derive(Debug, Deserialize)]
struct ContextQuery {
    budget_chars: Option<usize>,
    #[serde(default)]
    include_transitive: bool,
}

/// System prompt, assembled context, then the new user turn if the budget left it out
fn build_prompt(block: &Block, payload: &ContextPayload, user_message: &Message) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    if !block.system_prompt.trim().is_empty() {
        messages.push(ChatMessage::system(block.system_prompt.as_str()));
    }
    messages.extend(payload.to_chat_messages());
    if !payload
        .items
        .iter()
        .any(|item| item.message_id == user_message.id)
    {
        messages.push(ChatMessage::user(user_message.content.as_str()));
    }
    messages
}

fn assistant_reply(block_id: Uuid, content: &str, usage: &Usage, latency_ms: u64) -> Message {
    Message::assistant(block_id)
        .with_text(content)
        .with_metadata(MessageMetadata {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cost: None,
            latency_ms: Some(latency_ms),
        })
}

async fn send_message(
    State(state): State<AppState>,
    Path(block_id): Path<Uuid>,
    Json(request): Json<SendMessageRequest>,
) -> Result<Response, ApiError> {
    let block = state.store.get_block(block_id).await?;
    let credential = resolve_credential(&state, request.credential_ref).await?;

    let user_message = Message::user(block_id).with_text(&request.content);
    state.store.append_message(user_message.clone()).await?;

    let context_request = ContextRequest::new(
        block_id,
        request.budget_chars.unwrap_or(state.default_budget_chars),
    )
    .with_references(request.references)
    .transitive(request.include_transitive);
    let payload = state.assembler.assemble(&context_request).await?;
    let notice = payload.budget_notice();

    tracing::info!(
        block_id = %block_id,
        model = %block.model,
        items = payload.included_count,
        dropped = payload.dropped_count,
        estimated_tokens = payload.estimated_tokens,
        "sending block message"
    );

    let invocation = ChatInvocation::new(
        block.model.provider,
        block.model.name.as_str(),
        credential,
    )
    .with_messages(build_prompt(&block, &payload, &user_message))
    .with_params(request.params)
    .streaming(request.stream);

    if !request.stream {
        let result = state.proxy.complete(invocation).await?;
        let reply = assistant_reply(block_id, &result.content, &result.usage, result.latency_ms);
        state.store.append_message(reply.clone()).await?;
        return Ok(Json(SendMessageResponse {
            message: reply,
            notice,
            unavailable_sources: payload.unavailable_sources,
        })
        .into_response());
    }

    let started = Instant::now();
    let store = state.store.clone();
    let mut events = state.proxy.dispatch(invocation);
    let frames = stream! {
        if let Some(notice) = &notice {
            yield sse_frame(Some("notice"), notice);
        }

        let mut content = String::new();
        while let Some(item) = events.next().await {
            if let Ok(event) = &item {
                content.push_str(&event.delta);
                if event.is_final {
                    let usage = event.usage.clone().unwrap_or_default();
                    let latency_ms = started.elapsed().as_millis() as u64;
                    let reply = assistant_reply(block_id, &content, &usage, latency_ms);
                    if let Err(err) = store.append_message(reply).await {
                        tracing::error!(block_id = %block_id, error = %err, "failed to save reply");
                        yield sse_frame(
                            Some("error"),
                            &ChatError::new(ErrorKind::Unknown, "The reply could not be saved"),
                        );
                        break;
                    }
                }
            }
            yield event_frame(&item);
        }
    };
    Ok(SseResponse::new(frames.boxed()).into_response())
}

async fn get_context(
    State(state): State<AppState>,
    Path(block_id): Path<Uuid>,
    Query(query): Query<ContextQuery>,
) -> Result<Json<ContextPayload>, ApiError> {
    let request = ContextRequest::new(
        block_id,
        query.budget_chars.unwrap_or(state.default_budget_chars),
    )
    .transitive(query.include_transitive);
    Ok(Json(state.assembler.assemble(&request).await?))
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/blocks/:id/messages", post(send_message))
        .route("/blocks/:id/context", get(get_context))
        .with_state(state)
}
