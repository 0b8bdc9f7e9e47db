use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

use super::anthropic::AnthropicProvider;
use super::base::{ChatEvent, ChatInvocation, Provider};
use super::cohere::CohereProvider;
use super::configs::ProviderConfigs;
use super::google::GoogleProvider;
use super::openai::OpenAiProvider;
use super::openrouter::OpenRouterProvider;
use super::sse::SseEvent;
use super::utils::map_status_error;
use crate::errors::ChatError;

/// Credentials with this prefix belong to the aggregator and are routed through it.
pub const AGGREGATOR_KEY_PREFIX: &str = "sk-or-";

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    #[serde(alias = "gemini")]
    #[strum(to_string = "google", serialize = "gemini")]
    Google,
    Cohere,
    OpenRouter,
    Mistral,
    Groq,
    DeepSeek,
    XAi,
}

impl ProviderKind {
    /// Vendor prefix the aggregator uses in model names, if it hosts this family
    pub fn aggregator_namespace(self) -> Option<&'static str> {
        match self {
            ProviderKind::OpenAi => Some("openai"),
            ProviderKind::Anthropic => Some("anthropic"),
            ProviderKind::Google => Some("google"),
            ProviderKind::Cohere => Some("cohere"),
            ProviderKind::Mistral => Some("mistralai"),
            ProviderKind::DeepSeek => Some("deepseek"),
            ProviderKind::XAi => Some("x-ai"),
            ProviderKind::OpenRouter | ProviderKind::Groq => None,
        }
    }
}

pub fn is_aggregator_key(credential: &str) -> bool {
    credential.starts_with(AGGREGATOR_KEY_PREFIX)
}

/// The closed set of provider wire formats
#[derive(Debug, Clone)]
pub enum ProviderAdapter {
    OpenAi(OpenAiProvider),
    Anthropic(AnthropicProvider),
    Google(GoogleProvider),
    Cohere(CohereProvider),
    OpenRouter(OpenRouterProvider),
}

impl ProviderAdapter {
    fn inner(&self) -> &dyn Provider {
        match self {
            ProviderAdapter::OpenAi(p) => p,
            ProviderAdapter::Anthropic(p) => p,
            ProviderAdapter::Google(p) => p,
            ProviderAdapter::Cohere(p) => p,
            ProviderAdapter::OpenRouter(p) => p,
        }
    }

    /// Classify a non-2xx response into the error taxonomy
    pub fn map_error(
        &self,
        status: StatusCode,
        headers: &HeaderMap,
        body: &str,
        secret: &str,
    ) -> ChatError {
        let detail = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|value| self.error_detail(&value));
        map_status_error(self.kind(), status, headers, body, detail, secret)
    }
}

impl Provider for ProviderAdapter {
    fn kind(&self) -> ProviderKind {
        self.inner().kind()
    }

    fn validate(&self, invocation: &ChatInvocation) -> Result<(), ChatError> {
        self.inner().validate(invocation)
    }

    fn build_request(&self, client: &Client, invocation: &ChatInvocation) -> RequestBuilder {
        self.inner().build_request(client, invocation)
    }

    fn parse_response(&self, body: &Value) -> Result<ChatEvent, ChatError> {
        self.inner().parse_response(body)
    }

    fn parse_stream_event(&self, event: &SseEvent) -> Result<Option<ChatEvent>, ChatError> {
        self.inner().parse_stream_event(event)
    }

    fn error_detail(&self, body: &Value) -> Option<String> {
        self.inner().error_detail(body)
    }
}

/// Select the adapter for an invocation.
///
/// Aggregator keys are routed through the aggregator whatever provider was declared.
pub fn get_provider(invocation: &ChatInvocation, configs: &ProviderConfigs) -> ProviderAdapter {
    let kind = invocation.provider;
    if kind != ProviderKind::OpenRouter && is_aggregator_key(invocation.credential.expose()) {
        tracing::debug!(provider = %kind, "routing aggregator credential through openrouter");
        return ProviderAdapter::OpenRouter(OpenRouterProvider::new(configs, Some(kind)));
    }

    match kind {
        ProviderKind::OpenAi
        | ProviderKind::Mistral
        | ProviderKind::Groq
        | ProviderKind::DeepSeek
        | ProviderKind::XAi => {
            ProviderAdapter::OpenAi(OpenAiProvider::new(kind, configs.host(kind)))
        }
        ProviderKind::Anthropic => ProviderAdapter::Anthropic(AnthropicProvider::new(
            configs.host(kind),
            &configs.anthropic_version,
        )),
        ProviderKind::Google => ProviderAdapter::Google(GoogleProvider::new(configs.host(kind))),
        ProviderKind::Cohere => ProviderAdapter::Cohere(CohereProvider::new(configs.host(kind))),
        ProviderKind::OpenRouter => {
            ProviderAdapter::OpenRouter(OpenRouterProvider::new(configs, None))
        }
    }
}
