use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::factory::ProviderKind;
use super::sse::SseEvent;
use crate::errors::ChatError;
use crate::models::message::ChatMessage;
use crate::vault::Secret;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: Option<i32>,
    pub output_tokens: Option<i32>,
    pub total_tokens: Option<i32>,
}

impl Usage {
    pub fn new(
        input_tokens: Option<i32>,
        output_tokens: Option<i32>,
        total_tokens: Option<i32>,
    ) -> Self {
        let total_tokens = total_tokens.or(match (input_tokens, output_tokens) {
            (Some(input), Some(output)) => input.checked_add(output),
            _ => None,
        });
        Self {
            input_tokens,
            output_tokens,
            total_tokens,
        }
    }

    /// Fold a partial report into this one. Streams report input and output separately.
    pub fn merge(&mut self, other: &Usage) {
        let input_tokens = other.input_tokens.or(self.input_tokens);
        let output_tokens = other.output_tokens.or(self.output_tokens);
        let computed = match (input_tokens, output_tokens) {
            (Some(input), Some(output)) => input.checked_add(output),
            _ => None,
        };
        *self = Usage {
            input_tokens,
            output_tokens,
            total_tokens: other.total_tokens.or(computed).or(self.total_tokens),
        };
    }

    pub fn is_empty(&self) -> bool {
        self.input_tokens.is_none() && self.output_tokens.is_none() && self.total_tokens.is_none()
    }
}

/// One normalized increment of a model response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatEvent {
    pub delta: String,
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatEvent {
    pub fn delta<S: Into<String>>(text: S) -> Self {
        ChatEvent {
            delta: text.into(),
            is_final: false,
            usage: None,
        }
    }

    pub fn final_event() -> Self {
        ChatEvent {
            delta: String::new(),
            is_final: true,
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn finished(mut self) -> Self {
        self.is_final = true;
        self
    }
}

/// A complete, non-streamed model response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResult {
    pub provider: ProviderKind,
    pub model: String,
    pub content: String,
    pub usage: Usage,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
}

/// The normalized request handed to the provider proxy
#[derive(Debug, Clone)]
pub struct ChatInvocation {
    pub provider: ProviderKind,
    pub model: String,
    pub credential: Secret,
    pub messages: Vec<ChatMessage>,
    pub params: GenerationParams,
    pub stream: bool,
    /// Set when the caller is itself retrying; disables the proxy's own retry.
    pub is_retry: bool,
}

impl ChatInvocation {
    pub fn new<M: Into<String>>(provider: ProviderKind, model: M, credential: Secret) -> Self {
        ChatInvocation {
            provider,
            model: model.into(),
            credential,
            messages: Vec::new(),
            params: GenerationParams::default(),
            stream: false,
            is_retry: false,
        }
    }

    pub fn with_messages(mut self, messages: Vec<ChatMessage>) -> Self {
        self.messages = messages;
        self
    }

    pub fn with_message(mut self, message: ChatMessage) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn as_retry(mut self) -> Self {
        self.is_retry = true;
        self
    }
}

/// Base trait for provider wire formats (OpenAI, Anthropic, etc)
///
/// Implementations only translate; the proxy owns sending, timeouts and retries.
pub trait Provider {
    fn kind(&self) -> ProviderKind;

    /// Reject an invocation this provider cannot address, before anything is sent
    fn validate(&self, _invocation: &ChatInvocation) -> Result<(), ChatError> {
        Ok(())
    }

    /// Build the outbound request: endpoint, auth and payload
    fn build_request(&self, client: &Client, invocation: &ChatInvocation) -> RequestBuilder;

    /// Convert a complete (non-streaming) response body into a final event
    fn parse_response(&self, body: &Value) -> Result<ChatEvent, ChatError>;

    /// Convert one server-sent event into a normalized event, if it carries anything
    fn parse_stream_event(&self, event: &SseEvent) -> Result<Option<ChatEvent>, ChatError>;

    /// Human-readable error detail out of a provider error body
    fn error_detail(&self, body: &Value) -> Option<String> {
        super::utils::error_detail(body)
    }
}
