use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};

use super::base::{ChatEvent, ChatInvocation, Provider};
use super::factory::ProviderKind;
use super::sse::SseEvent;
use super::utils::{
    apply_openai_params, check_openai_context_length_error, messages_to_openai_spec,
    openai_response_to_event, openai_stream_event, stream_error,
};
use crate::errors::{ChatError, ErrorKind};

/// OpenAI chat completions, also spoken by Mistral, Groq, DeepSeek and xAI
#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    kind: ProviderKind,
    host: String,
}

impl OpenAiProvider {
    pub fn new<S: Into<String>>(kind: ProviderKind, host: S) -> Self {
        Self {
            kind,
            host: host.into(),
        }
    }

    fn payload(&self, invocation: &ChatInvocation) -> Value {
        let mut payload = json!({
            "model": invocation.model,
            "messages": messages_to_openai_spec(&invocation.messages),
        });
        apply_openai_params(&mut payload, &invocation.params);

        if invocation.stream {
            payload["stream"] = json!(true);
            // Only OpenAI itself is known to honor usage on streams
            if self.kind == ProviderKind::OpenAi {
                payload["stream_options"] = json!({ "include_usage": true });
            }
        }
        payload
    }
}

impl Provider for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn build_request(&self, client: &Client, invocation: &ChatInvocation) -> RequestBuilder {
        let url = format!("{}/v1/chat/completions", self.host.trim_end_matches('/'));
        client
            .post(url)
            .bearer_auth(invocation.credential.expose())
            .json(&self.payload(invocation))
    }

    fn parse_response(&self, body: &Value) -> Result<ChatEvent, ChatError> {
        // Raise specific error if context length is exceeded
        if let Some(error) = body.get("error") {
            if let Some(err) = check_openai_context_length_error(error) {
                return Err(ChatError::new(ErrorKind::InvalidRequest, err.to_string())
                    .with_provider(self.kind));
            }
            return Err(stream_error(self.kind, error));
        }
        openai_response_to_event(self.kind, body)
    }

    fn parse_stream_event(&self, event: &SseEvent) -> Result<Option<ChatEvent>, ChatError> {
        openai_stream_event(self.kind, &event.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::ChatMessage;
    use crate::providers::base::{GenerationParams, Usage};
    use crate::vault::Secret;
    use wiremock::matchers::{bearer_token, body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn invocation(kind: ProviderKind) -> ChatInvocation {
        ChatInvocation::new(kind, "gpt-4o", Secret::new("test_api_key"))
            .with_message(ChatMessage::system("You are a helpful assistant."))
            .with_message(ChatMessage::user("Hello?"))
            .with_params(GenerationParams {
                temperature: Some(0.5),
                ..Default::default()
            })
    }

    #[tokio::test]
    async fn test_request_shape() -> anyhow::Result<()> {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(bearer_token("test_api_key"))
            .and(body_partial_json(json!({
                "model": "gpt-4o",
                "temperature": 0.5,
                "messages": [
                    {"role": "system", "content": "You are a helpful assistant."},
                    {"role": "user", "content": "Hello?"}
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&mock_server)
            .await;

        let provider = OpenAiProvider::new(ProviderKind::OpenAi, mock_server.uri());
        let response = provider
            .build_request(&Client::new(), &invocation(ProviderKind::OpenAi))
            .send()
            .await?;
        assert!(response.status().is_success());
        Ok(())
    }

    #[tokio::test]
    async fn test_streaming_requests_usage_for_openai_only() -> anyhow::Result<()> {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({
                "stream": true,
                "stream_options": {"include_usage": true}
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = Client::new();
        let openai = OpenAiProvider::new(ProviderKind::OpenAi, mock_server.uri());
        let response = openai
            .build_request(&client, &invocation(ProviderKind::OpenAi).streaming(true))
            .send()
            .await?;
        assert!(response.status().is_success());

        let groq = OpenAiProvider::new(ProviderKind::Groq, mock_server.uri());
        let response = groq
            .build_request(&client, &invocation(ProviderKind::Groq).streaming(true))
            .send()
            .await?;
        assert_eq!(response.status().as_u16(), 404);
        Ok(())
    }

    #[test]
    fn test_parse_response() -> anyhow::Result<()> {
        let provider = OpenAiProvider::new(ProviderKind::OpenAi, "http://localhost");
        let body = json!({
            "id": "chatcmpl-123",
            "object": "chat.completion",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": "Hello! How can I assist you today?"
                },
                "finish_reason": "stop"
            }],
            "usage": {
                "prompt_tokens": 12,
                "completion_tokens": 15,
                "total_tokens": 27
            }
        });

        let event = provider.parse_response(&body)?;
        assert_eq!(event.delta, "Hello! How can I assist you today?");
        assert!(event.is_final);
        assert_eq!(event.usage, Some(Usage::new(Some(12), Some(15), Some(27))));
        Ok(())
    }

    #[test]
    fn test_parse_response_context_length_error() {
        let provider = OpenAiProvider::new(ProviderKind::OpenAi, "http://localhost");
        let body = json!({
            "error": {
                "code": "context_length_exceeded",
                "message": "This model's maximum context length is 128000 tokens."
            }
        });
        let err = provider.parse_response(&body).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
        assert!(err.message.contains("maximum context length"));
    }

    #[test]
    fn test_parse_stream_events() -> anyhow::Result<()> {
        let provider = OpenAiProvider::new(ProviderKind::DeepSeek, "http://localhost");
        let event = provider
            .parse_stream_event(&SseEvent::data(
                r#"{"choices":[{"index":0,"delta":{"content":"Hi"}}]}"#,
            ))?
            .unwrap();
        assert_eq!(event.delta, "Hi");
        assert!(!event.is_final);

        let done = provider.parse_stream_event(&SseEvent::data("[DONE]"))?.unwrap();
        assert!(done.is_final);

        let err = provider
            .parse_stream_event(&SseEvent::data(
                r#"{"error":{"type":"server_error","message":"boom"}}"#,
            ))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ProviderUnavailable);
        Ok(())
    }
}
