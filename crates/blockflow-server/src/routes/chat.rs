use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use blockflow::errors::ChatError;
use blockflow::models::message::ChatMessage;
use blockflow::providers::base::{ChatInvocation, GenerationParams};
use blockflow::providers::factory::ProviderKind;
use futures::StreamExt;
use serde::Deserialize;
use uuid::Uuid;

use super::{event_frame, resolve_credential, SseResponse};
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
struct ChatRequest {
    provider: String,
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(default)]
    params: GenerationParams,
    credential_ref: Uuid,
    #[serde(default)]
    stream: bool,
}

async fn chat_handler(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let provider = request
        .provider
        .parse::<ProviderKind>()
        .map_err(|_| ChatError::unsupported_provider(&request.provider))?;
    let credential = resolve_credential(&state, request.credential_ref).await?;

    tracing::info!(
        provider = %provider,
        model = %request.model,
        stream = request.stream,
        "chat request"
    );
    let invocation = ChatInvocation::new(provider, request.model, credential)
        .with_messages(request.messages)
        .with_params(request.params)
        .streaming(request.stream);

    if request.stream {
        let frames = state
            .proxy
            .dispatch(invocation)
            .map(|item| event_frame(&item))
            .boxed();
        return Ok(SseResponse::new(frames).into_response());
    }

    let result = state.proxy.complete(invocation).await?;
    Ok(Json(result).into_response())
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/chat", post(chat_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::test_helpers::{body_json, body_text, sse_frames};
    use crate::state::test_support::test_state;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use blockflow::models::credential::ProviderCredential;
    use blockflow::store::GraphStore;
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use wiremock::matchers::{header as header_matcher, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn store_key(state: &AppState, provider: ProviderKind, key: &str) -> Uuid {
        let blob = state.vault.encrypt(key).unwrap();
        let credential = ProviderCredential::new("owner", provider, blob);
        let id = credential.id;
        state.store.upsert_credential(credential).await.unwrap();
        id
    }

    fn chat_request(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/chat")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_unsupported_provider_rejected() {
        let server = MockServer::start().await;
        let state = test_state(&server.uri()).unwrap();
        let credential_ref = store_key(&state, ProviderKind::OpenAi, "sk-test").await;

        let response = routes(state)
            .oneshot(chat_request(json!({
                "provider": "acme",
                "model": "m",
                "messages": [{"role": "user", "content": "hi"}],
                "credential_ref": credential_ref
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["kind"], "unsupported_provider");
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_credential_is_not_found() {
        let server = MockServer::start().await;
        let state = test_state(&server.uri()).unwrap();

        let response = routes(state)
            .oneshot(chat_request(json!({
                "provider": "openai",
                "model": "gpt-4o",
                "messages": [{"role": "user", "content": "hi"}],
                "credential_ref": Uuid::new_v4()
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_complete_returns_result() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header_matcher("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "Hello!"}}],
                "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
            })))
            .expect(1)
            .mount(&server)
            .await;
        let state = test_state(&server.uri()).unwrap();
        let credential_ref = store_key(&state, ProviderKind::OpenAi, "sk-test").await;

        let response = routes(state)
            .oneshot(chat_request(json!({
                "provider": "openai",
                "model": "gpt-4o",
                "messages": [{"role": "user", "content": "hi"}],
                "credential_ref": credential_ref
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["content"], "Hello!");
        assert_eq!(body["provider"], "openai");
        assert_eq!(body["usage"]["output_tokens"], 2);
    }

    #[tokio::test]
    async fn test_stream_relays_events() {
        let server = MockServer::start().await;
        let sse = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2,\"total_tokens\":5}}\n\n",
            "data: [DONE]\n\n"
        );
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse),
            )
            .expect(1)
            .mount(&server)
            .await;
        let state = test_state(&server.uri()).unwrap();
        let credential_ref = store_key(&state, ProviderKind::OpenAi, "sk-test").await;

        let response = routes(state)
            .oneshot(chat_request(json!({
                "provider": "openai",
                "model": "gpt-4o",
                "messages": [{"role": "user", "content": "hi"}],
                "credential_ref": credential_ref,
                "stream": true
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );
        let frames = sse_frames(&body_text(response).await);
        let text: String = frames
            .iter()
            .filter_map(|(_, data)| data["delta"].as_str())
            .collect();
        assert_eq!(text, "Hello");

        let (event, last) = frames.last().unwrap();
        assert!(event.is_none());
        assert_eq!(last["is_final"], true);
        assert_eq!(last["usage"]["output_tokens"], 2);
    }

    #[tokio::test]
    async fn test_auth_failure_hides_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": {"message": "Incorrect API key provided: sk-secret-123"}
            })))
            .expect(1)
            .mount(&server)
            .await;
        let state = test_state(&server.uri()).unwrap();
        let credential_ref = store_key(&state, ProviderKind::OpenAi, "sk-secret-123").await;

        let response = routes(state)
            .oneshot(chat_request(json!({
                "provider": "openai",
                "model": "gpt-4o",
                "messages": [{"role": "user", "content": "hi"}],
                "credential_ref": credential_ref
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let text = body_text(response).await;
        assert!(text.contains("auth_failed"));
        assert!(!text.contains("sk-secret-123"));
    }

    #[tokio::test]
    async fn test_stream_error_frame() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"message": "bad model", "type": "invalid_request_error"}
            })))
            .expect(1)
            .mount(&server)
            .await;
        let state = test_state(&server.uri()).unwrap();
        let credential_ref = store_key(&state, ProviderKind::OpenAi, "sk-test").await;

        let response = routes(state)
            .oneshot(chat_request(json!({
                "provider": "openai",
                "model": "nope",
                "messages": [{"role": "user", "content": "hi"}],
                "credential_ref": credential_ref,
                "stream": true
            })))
            .await
            .unwrap();

        let frames = sse_frames(&body_text(response).await);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0.as_deref(), Some("error"));
        assert_eq!(frames[0].1["kind"], "invalid_request");
    }
}
