use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};

use super::base::{ChatEvent, ChatInvocation, Provider, Usage};
use super::factory::ProviderKind;
use super::sse::SseEvent;
use super::utils::{malformed, token_count, wire_text};
use crate::errors::{ChatError, ErrorKind};
use crate::models::role::Role;

/// Cohere chat v2
#[derive(Debug, Clone)]
pub struct CohereProvider {
    host: String,
}

impl CohereProvider {
    pub fn new<S: Into<String>>(host: S) -> Self {
        Self { host: host.into() }
    }

    /// Prefer `tokens`; fall back to `billed_units`
    fn get_usage(usage: Option<&Value>) -> Option<Usage> {
        let usage = usage?;
        let counts = usage
            .get("tokens")
            .or_else(|| usage.get("billed_units"))
            .filter(|c| c.is_object())?;
        let count = |field: &str| token_count(counts.get(field));
        Some(Usage::new(
            count("input_tokens"),
            count("output_tokens"),
            None,
        ))
    }

    fn payload(invocation: &ChatInvocation) -> Value {
        let messages: Vec<Value> = invocation
            .messages
            .iter()
            .filter(|m| !m.content.is_empty())
            .map(|message| {
                let role = match message.role {
                    Role::System => "system",
                    Role::User | Role::Context => "user",
                    Role::Assistant => "assistant",
                };
                json!({"role": role, "content": wire_text(message)})
            })
            .collect();

        let params = &invocation.params;
        let mut payload = json!({
            "model": invocation.model,
            "messages": messages,
        });
        if let Some(temp) = params.temperature {
            payload["temperature"] = json!(temp);
        }
        if let Some(tokens) = params.max_tokens {
            payload["max_tokens"] = json!(tokens);
        }
        if let Some(top_p) = params.top_p {
            payload["p"] = json!(top_p);
        }
        if let Some(penalty) = params.frequency_penalty {
            payload["frequency_penalty"] = json!(penalty);
        }
        if let Some(penalty) = params.presence_penalty {
            payload["presence_penalty"] = json!(penalty);
        }
        if invocation.stream {
            payload["stream"] = json!(true);
        }
        payload
    }
}

impl Provider for CohereProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Cohere
    }

    fn build_request(&self, client: &Client, invocation: &ChatInvocation) -> RequestBuilder {
        let url = format!("{}/v2/chat", self.host.trim_end_matches('/'));
        client
            .post(url)
            .bearer_auth(invocation.credential.expose())
            .json(&Self::payload(invocation))
    }

    fn parse_response(&self, body: &Value) -> Result<ChatEvent, ChatError> {
        let content = body
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_array())
            .ok_or_else(|| malformed(self.kind(), "response has no message"))?;

        let text: String = content
            .iter()
            .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
            .collect();

        let mut event = ChatEvent::delta(text).finished();
        event.usage = Self::get_usage(body.get("usage"));
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
            "content-delta" => {
                let text = data
                    .pointer("/delta/message/content/text")
                    .and_then(|t| t.as_str())
                    .unwrap_or_default();
                Ok((!text.is_empty()).then(|| ChatEvent::delta(text)))
            }
            "message-end" => {
                let delta = data.get("delta");
                let finish_reason = delta
                    .and_then(|d| d.get("finish_reason"))
                    .and_then(|r| r.as_str())
                    .unwrap_or_default();
                if finish_reason == "ERROR" {
                    let message = delta
                        .and_then(|d| d.get("error"))
                        .and_then(|e| e.as_str())
                        .unwrap_or("generation failed");
                    return Err(ChatError::new(
                        ErrorKind::ProviderUnavailable,
                        format!("{}: {}", self.kind(), message),
                    )
                    .with_provider(self.kind()));
                }
                let mut event = ChatEvent::final_event();
                event.usage = Self::get_usage(delta.and_then(|d| d.get("usage")));
                Ok(Some(event))
            }
            _ => Ok(None),
        }
    }
}
