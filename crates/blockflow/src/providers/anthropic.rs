use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};

use super::base::{ChatEvent, ChatInvocation, Provider, Usage};
use super::factory::ProviderKind;
use super::sse::SseEvent;
use super::utils::{malformed, split_turns, stream_error, token_count};
use crate::errors::ChatError;

/// The messages API rejects requests without `max_tokens`.
const DEFAULT_MAX_TOKENS: i32 = 4096;

#[derive(Debug, Clone)]
pub struct AnthropicProvider {
    host: String,
    version: String,
}

impl AnthropicProvider {
    pub fn new<H: Into<String>, V: Into<String>>(host: H, version: V) -> Self {
        Self {
            host: host.into(),
            version: version.into(),
        }
    }

    fn get_usage(data: &Value) -> Option<Usage> {
        let usage = data.get("usage").filter(|u| u.is_object())?;
        Some(Usage::new(
            token_count(usage.get("input_tokens")),
            token_count(usage.get("output_tokens")),
            None,
        ))
    }

    fn payload(invocation: &ChatInvocation) -> Value {
        let turns = split_turns(&invocation.messages, "assistant");
        let messages: Vec<Value> = turns
            .turns
            .iter()
            .map(|turn| {
                let content: Vec<Value> = turn
                    .texts
                    .iter()
                    .map(|text| json!({"type": "text", "text": text}))
                    .collect();
                json!({"role": turn.role, "content": content})
            })
            .collect();

        let params = &invocation.params;
        let mut payload = json!({
            "model": invocation.model,
            "messages": messages,
            "max_tokens": params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        });
        if let Some(system) = turns.system {
            payload["system"] = json!(system);
        }
        if let Some(temp) = params.temperature {
            payload["temperature"] = json!(temp);
        }
        if let Some(top_p) = params.top_p {
            payload["top_p"] = json!(top_p);
        }
        if invocation.stream {
            payload["stream"] = json!(true);
        }
        payload
    }
}

impl Provider for AnthropicProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn build_request(&self, client: &Client, invocation: &ChatInvocation) -> RequestBuilder {
        let url = format!("{}/v1/messages", self.host.trim_end_matches('/'));
        client
            .post(url)
            .header("x-api-key", invocation.credential.expose())
            .header("anthropic-version", &self.version)
            .json(&Self::payload(invocation))
    }

    fn parse_response(&self, body: &Value) -> Result<ChatEvent, ChatError> {
        if let Some(error) = body.get("error") {
            return Err(stream_error(self.kind(), error));
        }
        let content = body
            .get("content")
            .and_then(|c| c.as_array())
            .ok_or_else(|| malformed(self.kind(), "response has no content"))?;

        let text: String = content
            .iter()
            .filter(|block| block.get("type").and_then(|t| t.as_str()) == Some("text"))
            .filter_map(|block| block.get("text").and_then(|t| t.as_str()))
            .collect();

        let mut event = ChatEvent::delta(text).finished();
        if let Some(usage) = Self::get_usage(body) {
            event = event.with_usage(usage);
        }
        Ok(event)
    }

    fn parse_stream_event(&self, event: &SseEvent) -> Result<Option<ChatEvent>, ChatError> {
        let data: Value = serde_json::from_str(&event.data)
            .map_err(|_| malformed(self.kind(), "unreadable stream event"))?;
        let event_type = event
            .event
            .as_deref()
            .or_else(|| data.get("type").and_then(|t| t.as_str()))
            .unwrap_or_default();

        match event_type {
            "message_start" => Ok(data
                .get("message")
                .and_then(Self::get_usage)
                .map(|usage| ChatEvent::default().with_usage(usage))),
            "content_block_delta" => {
                let text = data
                    .get("delta")
                    .filter(|d| d.get("type").and_then(|t| t.as_str()) == Some("text_delta"))
                    .and_then(|d| d.get("text"))
                    .and_then(|t| t.as_str())
                    .unwrap_or_default();
                Ok((!text.is_empty()).then(|| ChatEvent::delta(text)))
            }
            "message_delta" => Ok(Self::get_usage(&data).map(|usage| {
                // Only output tokens are reported here
                ChatEvent::default().with_usage(Usage {
                    input_tokens: None,
                    total_tokens: None,
                    ..usage
                })
            })),
            "message_stop" => Ok(Some(ChatEvent::final_event())),
            "error" => Err(stream_error(
                self.kind(),
                data.get("error").unwrap_or(&Value::Null),
            )),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::models::message::ChatMessage;
    use crate::vault::Secret;
    use uuid::Uuid;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn event(kind: &str, data: Value) -> SseEvent {
        SseEvent {
            event: Some(kind.to_string()),
            data: data.to_string(),
        }
    }

    #[tokio::test]
    async fn test_request_shape() -> anyhow::Result<()> {
        let source = Uuid::new_v4();
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test_api_key"))
            .and(header("anthropic-version", "2023-06-01"))
            .and(body_partial_json(json!({
                "model": "claude-3-5-sonnet-latest",
                "system": "Be brief.",
                "max_tokens": 4096,
                "messages": [{
                    "role": "user",
                    "content": [
                        {"type": "text", "text": format!("[Context from block {}]\nupstream", source)},
                        {"type": "text", "text": "Hello?"}
                    ]
                }]
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let provider = AnthropicProvider::new(mock_server.uri(), "2023-06-01");
        let invocation = ChatInvocation::new(
            ProviderKind::Anthropic,
            "claude-3-5-sonnet-latest",
            Secret::new("test_api_key"),
        )
        .with_messages(vec![
            ChatMessage::system("Be brief."),
            ChatMessage::context(source, "upstream"),
            ChatMessage::user("Hello?"),
        ]);

        let response = provider
            .build_request(&Client::new(), &invocation)
            .send()
            .await?;
        assert!(response.status().is_success());
        Ok(())
    }

    #[test]
    fn test_parse_response() -> anyhow::Result<()> {
        let provider = AnthropicProvider::new("http://localhost", "2023-06-01");
        let body = json!({
            "id": "msg_123",
            "type": "message",
            "role": "assistant",
            "content": [{
                "type": "text",
                "text": "Hello! How can I assist you today?"
            }],
            "model": "claude-3-sonnet-20240229",
            "stop_reason": "end_turn",
            "stop_sequence": null,
            "usage": {
                "input_tokens": 12,
                "output_tokens": 15
            }
        });

        let event = provider.parse_response(&body)?;
        assert_eq!(event.delta, "Hello! How can I assist you today?");
        assert!(event.is_final);
        assert_eq!(event.usage, Some(Usage::new(Some(12), Some(15), Some(27))));
        Ok(())
    }

    #[test]
    fn test_parse_stream() -> anyhow::Result<()> {
        let provider = AnthropicProvider::new("http://localhost", "2023-06-01");

        let start = provider
            .parse_stream_event(&event(
                "message_start",
                json!({"type": "message_start", "message": {"usage": {"input_tokens": 25, "output_tokens": 1}}}),
            ))?
            .unwrap();
        assert_eq!(start.delta, "");
        assert_eq!(start.usage.unwrap().input_tokens, Some(25));

        let ping = provider.parse_stream_event(&event("ping", json!({"type": "ping"})))?;
        assert_eq!(ping, None);

        let delta = provider
            .parse_stream_event(&event(
                "content_block_delta",
                json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hi"}}),
            ))?
            .unwrap();
        assert_eq!(delta, ChatEvent::delta("Hi"));

        let usage = provider
            .parse_stream_event(&event(
                "message_delta",
                json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 15}}),
            ))?
            .unwrap()
            .usage
            .unwrap();
        assert_eq!(usage.output_tokens, Some(15));
        assert_eq!(usage.input_tokens, None);

        let stop = provider
            .parse_stream_event(&event("message_stop", json!({"type": "message_stop"})))?
            .unwrap();
        assert!(stop.is_final);
        Ok(())
    }

    #[test]
    fn test_stream_error_event() {
        let provider = AnthropicProvider::new("http://localhost", "2023-06-01");
        let err = provider
            .parse_stream_event(&event(
                "error",
                json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}}),
            ))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ProviderUnavailable);
        assert_eq!(err.provider, Some(ProviderKind::Anthropic));
    }
}
