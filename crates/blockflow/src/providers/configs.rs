use serde::{Deserialize, Serialize};

use super::factory::ProviderKind;

pub const OPENAI_HOST: &str = "https://api.openai.com";
pub const ANTHROPIC_HOST: &str = "https://api.anthropic.com";
pub const GOOGLE_HOST: &str = "https://generativelanguage.googleapis.com";
pub const COHERE_HOST: &str = "https://api.cohere.com";
pub const OPENROUTER_HOST: &str = "https://openrouter.ai";
pub const MISTRAL_HOST: &str = "https://api.mistral.ai";
pub const GROQ_HOST: &str = "https://api.groq.com/openai";
pub const DEEPSEEK_HOST: &str = "https://api.deepseek.com";
pub const XAI_HOST: &str = "https://api.x.ai";

pub const ANTHROPIC_API_VERSION: &str = "2023-06-01";

/// Endpoints and attribution for every provider family.
///
/// Hosts are overridable so deployments can point at regional endpoints or test servers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfigs {
    pub openai_host: String,
    pub anthropic_host: String,
    pub google_host: String,
    pub cohere_host: String,
    pub openrouter_host: String,
    pub mistral_host: String,
    pub groq_host: String,
    pub deepseek_host: String,
    pub xai_host: String,
    pub anthropic_version: String,
    /// Sent as `HTTP-Referer` on aggregator requests
    pub app_url: String,
    /// Sent as `X-Title` on aggregator requests
    pub app_title: String,
}

impl Default for ProviderConfigs {
    fn default() -> Self {
        Self {
            openai_host: OPENAI_HOST.to_string(),
            anthropic_host: ANTHROPIC_HOST.to_string(),
            google_host: GOOGLE_HOST.to_string(),
            cohere_host: COHERE_HOST.to_string(),
            openrouter_host: OPENROUTER_HOST.to_string(),
            mistral_host: MISTRAL_HOST.to_string(),
            groq_host: GROQ_HOST.to_string(),
            deepseek_host: DEEPSEEK_HOST.to_string(),
            xai_host: XAI_HOST.to_string(),
            anthropic_version: ANTHROPIC_API_VERSION.to_string(),
            app_url: "https://blockflow.app".to_string(),
            app_title: "Blockflow".to_string(),
        }
    }
}

impl ProviderConfigs {
    pub fn host(&self, kind: ProviderKind) -> &str {
        match kind {
            ProviderKind::OpenAi => &self.openai_host,
            ProviderKind::Anthropic => &self.anthropic_host,
            ProviderKind::Google => &self.google_host,
            ProviderKind::Cohere => &self.cohere_host,
            ProviderKind::OpenRouter => &self.openrouter_host,
            ProviderKind::Mistral => &self.mistral_host,
            ProviderKind::Groq => &self.groq_host,
            ProviderKind::DeepSeek => &self.deepseek_host,
            ProviderKind::XAi => &self.xai_host,
        }
    }

    /// Point every provider at one host, e.g. a mock server
    pub fn with_all_hosts(mut self, host: &str) -> Self {
        for field in [
            &mut self.openai_host,
            &mut self.anthropic_host,
            &mut self.google_host,
            &mut self.cohere_host,
            &mut self.openrouter_host,
            &mut self.mistral_host,
            &mut self.groq_host,
            &mut self.deepseek_host,
            &mut self.xai_host,
        ] {
            *field = host.to_string();
        }
        self
    }
}
