use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};

use super::base::{ChatEvent, ChatInvocation, Provider, Usage};
use super::factory::ProviderKind;
use super::sse::SseEvent;
use super::utils::{malformed, split_turns, stream_error, token_count};
use crate::errors::{ChatError, ErrorKind};

/// Gemini `generateContent`. The key travels as a query parameter.
#[derive(Debug, Clone)]
pub struct GoogleProvider {
    host: String,
}

impl GoogleProvider {
    pub fn new<S: Into<String>>(host: S) -> Self {
        Self { host: host.into() }
    }

    fn get_usage(data: &Value) -> Option<Usage> {
        let usage = data.get("usageMetadata").filter(|u| u.is_object())?;
        let count = |field: &str| token_count(usage.get(field));
        Some(Usage::new(
            count("promptTokenCount"),
            count("candidatesTokenCount"),
            count("totalTokenCount"),
        ))
    }

    fn payload(invocation: &ChatInvocation) -> Value {
        let turns = split_turns(&invocation.messages, "model");
        let contents: Vec<Value> = turns
            .turns
            .iter()
            .map(|turn| {
                let parts: Vec<Value> = turn.texts.iter().map(|text| json!({"text": text})).collect();
                json!({"role": turn.role, "parts": parts})
            })
            .collect();

        let mut payload = json!({ "contents": contents });
        if let Some(system) = turns.system {
            payload["systemInstruction"] = json!({"parts": [{"text": system}]});
        }

        let params = &invocation.params;
        let mut generation_config = serde_json::Map::new();
        if let Some(temp) = params.temperature {
            generation_config.insert("temperature".to_string(), json!(temp));
        }
        if let Some(tokens) = params.max_tokens {
            generation_config.insert("maxOutputTokens".to_string(), json!(tokens));
        }
        if let Some(top_p) = params.top_p {
            generation_config.insert("topP".to_string(), json!(top_p));
        }
        if !generation_config.is_empty() {
            payload["generationConfig"] = Value::Object(generation_config);
        }
        payload
    }

    /// Candidate text plus usage; a `finishReason` marks the last chunk
    fn to_event(&self, data: &Value) -> Result<ChatEvent, ChatError> {
        if let Some(error) = data.get("error") {
            return Err(stream_error(self.kind(), error));
        }
        let candidate = data
            .get("candidates")
            .and_then(|c| c.get(0))
            .ok_or_else(|| malformed(self.kind(), "response has no candidates"))?;

        let text: String = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
                    .collect()
            })
            .unwrap_or_default();

        let mut event = ChatEvent::delta(text);
        event.is_final = candidate.get("finishReason").is_some_and(|r| !r.is_null());
        event.usage = Self::get_usage(data);
        Ok(event)
    }
}

impl Provider for GoogleProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
    }

    /// The model id becomes a path segment of the endpoint
    fn validate(&self, invocation: &ChatInvocation) -> Result<(), ChatError> {
        let model = &invocation.model;
        if model.is_empty() || model.contains(['/', '?', '#', '%']) {
            return Err(ChatError::new(
                ErrorKind::InvalidRequest,
                format!("Invalid model id for {}: {:?}", self.kind(), model),
            )
            .with_provider(self.kind()));
        }
        Ok(())
    }

    fn build_request(&self, client: &Client, invocation: &ChatInvocation) -> RequestBuilder {
        let host = self.host.trim_end_matches('/');
        let request = if invocation.stream {
            client
                .post(format!(
                    "{}/v1beta/models/{}:streamGenerateContent",
                    host, invocation.model
                ))
                .query(&[("alt", "sse")])
        } else {
            client.post(format!(
                "{}/v1beta/models/{}:generateContent",
                host, invocation.model
            ))
        };
        request
            .query(&[("key", invocation.credential.expose())])
            .json(&Self::payload(invocation))
    }

    fn parse_response(&self, body: &Value) -> Result<ChatEvent, ChatError> {
        Ok(self.to_event(body)?.finished())
    }

    fn parse_stream_event(&self, event: &SseEvent) -> Result<Option<ChatEvent>, ChatError> {
        let data: Value = serde_json::from_str(&event.data)
            .map_err(|_| malformed(self.kind(), "unreadable stream chunk"))?;
        let event = self.to_event(&data)?;
        if event.delta.is_empty() && !event.is_final && event.usage.is_none() {
            return Ok(None);
        }
        Ok(Some(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::ChatMessage;
    use crate::providers::base::GenerationParams;
    use crate::vault::Secret;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn invocation() -> ChatInvocation {
        ChatInvocation::new(ProviderKind::Google, "gemini-1.5-pro", Secret::new("test_api_key"))
            .with_messages(vec![
                ChatMessage::system("Be brief."),
                ChatMessage::user("Hello?"),
                ChatMessage::assistant("Hi."),
                ChatMessage::user("Again"),
            ])
            .with_params(GenerationParams {
                max_tokens: Some(256),
                ..Default::default()
            })
    }

    #[test]
    fn test_model_id_must_be_one_path_segment() {
        let provider = GoogleProvider::new("http://localhost:1");
        assert!(provider.validate(&invocation()).is_ok());

        for model in ["", "gemini/../../v1/files", "gemini?alt=json", "gemini#x", "gemini%2Fx"] {
            let mut bad = invocation();
            bad.model = model.to_string();
            let err = provider.validate(&bad).unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidRequest, "{:?}", model);
            assert_eq!(err.provider, Some(ProviderKind::Google));
        }
    }

    #[tokio::test]
    async fn test_request_shape() -> anyhow::Result<()> {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-1.5-pro:generateContent"))
            .and(query_param("key", "test_api_key"))
            .and(body_partial_json(json!({
                "systemInstruction": {"parts": [{"text": "Be brief."}]},
                "contents": [
                    {"role": "user", "parts": [{"text": "Hello?"}]},
                    {"role": "model", "parts": [{"text": "Hi."}]},
                    {"role": "user", "parts": [{"text": "Again"}]}
                ],
                "generationConfig": {"maxOutputTokens": 256}
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let provider = GoogleProvider::new(mock_server.uri());
        let response = provider
            .build_request(&Client::new(), &invocation())
            .send()
            .await?;
        assert!(response.status().is_success());
        Ok(())
    }

    #[tokio::test]
    async fn test_streaming_endpoint() -> anyhow::Result<()> {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-1.5-pro:streamGenerateContent"))
            .and(query_param("alt", "sse"))
            .and(query_param("key", "test_api_key"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let provider = GoogleProvider::new(mock_server.uri());
        let response = provider
            .build_request(&Client::new(), &invocation().streaming(true))
            .send()
            .await?;
        assert!(response.status().is_success());
        Ok(())
    }

    #[test]
    fn test_parse_response() -> anyhow::Result<()> {
        let provider = GoogleProvider::new("http://localhost");
        let body = json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "Hello "}, {"text": "there"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 8, "candidatesTokenCount": 2, "totalTokenCount": 10}
        });
        let event = provider.parse_response(&body)?;
        assert_eq!(event.delta, "Hello there");
        assert!(event.is_final);
        assert_eq!(event.usage, Some(Usage::new(Some(8), Some(2), Some(10))));
        Ok(())
    }

    #[test]
    fn test_parse_stream_chunks() -> anyhow::Result<()> {
        let provider = GoogleProvider::new("http://localhost");
        let first = provider
            .parse_stream_event(&SseEvent::data(
                json!({"candidates": [{"content": {"parts": [{"text": "Hel"}]}}]}).to_string(),
            ))?
            .unwrap();
        assert_eq!(first, ChatEvent::delta("Hel"));

        let last = provider
            .parse_stream_event(&SseEvent::data(
                json!({
                    "candidates": [{"content": {"parts": [{"text": "lo"}]}, "finishReason": "STOP"}],
                    "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 2}
                })
                .to_string(),
            ))?
            .unwrap();
        assert!(last.is_final);
        assert_eq!(last.usage.unwrap().total_tokens, Some(6));
        Ok(())
    }

    #[test]
    fn test_error_body() {
        let provider = GoogleProvider::new("http://localhost");
        let err = provider
            .parse_response(&json!({
                "error": {"code": 429, "message": "Quota exceeded", "status": "RESOURCE_EXHAUSTED"}
            }))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimited);
    }
}
