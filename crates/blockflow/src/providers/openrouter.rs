use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};

use super::base::{ChatEvent, ChatInvocation, Provider};
use super::configs::ProviderConfigs;
use super::factory::ProviderKind;
use super::sse::SseEvent;
use super::utils::{
    apply_openai_params, messages_to_openai_spec, openai_response_to_event, openai_stream_event,
    stream_error,
};
use crate::errors::ChatError;

/// OpenRouter aggregator. Speaks the OpenAI format under `/api/v1`.
#[derive(Debug, Clone)]
pub struct OpenRouterProvider {
    host: String,
    app_url: String,
    app_title: String,
    /// The family the block declared, when an aggregator key rerouted it here
    routed_from: Option<ProviderKind>,
}

impl OpenRouterProvider {
    pub fn new(configs: &ProviderConfigs, routed_from: Option<ProviderKind>) -> Self {
        Self {
            host: configs.openrouter_host.clone(),
            app_url: configs.app_url.clone(),
            app_title: configs.app_title.clone(),
            routed_from,
        }
    }

    /// `gpt-4o` declared on an OpenAI block becomes `openai/gpt-4o`
    pub fn model_name(&self, model: &str) -> String {
        if model.contains('/') {
            return model.to_string();
        }
        match self.routed_from.and_then(ProviderKind::aggregator_namespace) {
            Some(namespace) => format!("{}/{}", namespace, model),
            None => model.to_string(),
        }
    }

    fn payload(&self, invocation: &ChatInvocation) -> Value {
        let mut payload = json!({
            "model": self.model_name(&invocation.model),
            "messages": messages_to_openai_spec(&invocation.messages),
        });
        apply_openai_params(&mut payload, &invocation.params);
        if invocation.stream {
            payload["stream"] = json!(true);
            payload["usage"] = json!({ "include": true });
        }
        payload
    }
}

impl Provider for OpenRouterProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenRouter
    }

    fn build_request(&self, client: &Client, invocation: &ChatInvocation) -> RequestBuilder {
        let url = format!("{}/api/v1/chat/completions", self.host.trim_end_matches('/'));
        client
            .post(url)
            .bearer_auth(invocation.credential.expose())
            .header("HTTP-Referer", &self.app_url)
            .header("X-Title", &self.app_title)
            .json(&self.payload(invocation))
    }

    fn parse_response(&self, body: &Value) -> Result<ChatEvent, ChatError> {
        if let Some(error) = body.get("error") {
            return Err(stream_error(self.kind(), error));
        }
        openai_response_to_event(self.kind(), body)
    }

    fn parse_stream_event(&self, event: &SseEvent) -> Result<Option<ChatEvent>, ChatError> {
        openai_stream_event(self.kind(), &event.data)
    }
}
