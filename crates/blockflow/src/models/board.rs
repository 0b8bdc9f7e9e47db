use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::providers::factory::ProviderKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Board {
    pub id: Uuid,
    pub owner: String,
    pub title: String,
    #[serde(default)]
    pub is_public: bool,
}

impl Board {
    pub fn new<O: Into<String>, T: Into<String>>(owner: O, title: T) -> Self {
        Board {
            id: Uuid::new_v4(),
            owner: owner.into(),
            title: title.into(),
            is_public: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Position { x, y }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockType {
    #[default]
    Chat,
    Prompt,
    Custom,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelIdError {
    #[error("Model identifier '{0}' must look like '<provider>/<model>'")]
    Malformed(String),

    #[error("Unknown provider '{0}'")]
    UnknownProvider(String),
}

/// Provider plus provider-side model name, written as `<provider>/<model>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModelId {
    pub provider: ProviderKind,
    pub name: String,
}

impl ModelId {
    pub fn new<S: Into<String>>(provider: ProviderKind, name: S) -> Self {
        ModelId {
            provider,
            name: name.into(),
        }
    }
}

impl FromStr for ModelId {
    type Err = ModelIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Only the first segment names the provider; aggregator model names contain slashes.
        let (provider, name) = s
            .split_once('/')
            .filter(|(p, n)| !p.is_empty() && !n.is_empty())
            .ok_or_else(|| ModelIdError::Malformed(s.to_string()))?;
        let provider = provider
            .parse::<ProviderKind>()
            .map_err(|_| ModelIdError::UnknownProvider(provider.to_string()))?;
        Ok(ModelId::new(provider, name))
    }
}

impl TryFrom<String> for ModelId {
    type Error = ModelIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ModelId> for String {
    fn from(value: ModelId) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.name)
    }
}

/// Provenance of a block spawned from another block's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceContext {
    pub block_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: Uuid,
    pub board_id: Uuid,
    pub model: ModelId,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub position: Position,
    #[serde(default, rename = "type")]
    pub block_type: BlockType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_context: Option<SourceContext>,
}

impl Block {
    pub fn new(board_id: Uuid, model: ModelId) -> Self {
        Block {
            id: Uuid::new_v4(),
            board_id,
            model,
            system_prompt: String::new(),
            position: Position::default(),
            block_type: BlockType::Chat,
            source_context: None,
        }
    }

    pub fn with_system_prompt<S: Into<String>>(mut self, prompt: S) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.position = position;
        self
    }

    pub fn with_source_context(mut self, source: SourceContext) -> Self {
        self.source_context = Some(source);
        self
    }
}

/// Directed edge: the source block's output is available as context to the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub id: Uuid,
    pub source_block_id: Uuid,
    pub target_block_id: Uuid,
}

impl Connection {
    pub fn new(source_block_id: Uuid, target_block_id: Uuid) -> Self {
        Connection {
            id: Uuid::new_v4(),
            source_block_id,
            target_block_id,
        }
    }

    pub fn is_self_loop(&self) -> bool {
        self.source_block_id == self.target_block_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_model_id() {
        let id: ModelId = "openai/gpt-4o".parse().unwrap();
        assert_eq!(id.provider, ProviderKind::OpenAi);
        assert_eq!(id.name, "gpt-4o");

        let id: ModelId = "openrouter/meta-llama/llama-3.1-70b-instruct".parse().unwrap();
        assert_eq!(id.provider, ProviderKind::OpenRouter);
        assert_eq!(id.name, "meta-llama/llama-3.1-70b-instruct");
    }

    #[test]
    fn test_parse_model_id_errors() {
        assert_eq!(
            "acme/model-1".parse::<ModelId>(),
            Err(ModelIdError::UnknownProvider("acme".to_string()))
        );
        assert!(matches!(
            "gpt-4o".parse::<ModelId>(),
            Err(ModelIdError::Malformed(_))
        ));
        assert!(matches!(
            "openai/".parse::<ModelId>(),
            Err(ModelIdError::Malformed(_))
        ));
    }

    #[test]
    fn test_block_deserialization_rejects_unknown_provider() {
        let board_id = Uuid::new_v4();
        let block = json!({
            "id": Uuid::new_v4(),
            "board_id": board_id,
            "model": "nowhere/model",
        });
        assert!(serde_json::from_value::<Block>(block).is_err());
    }

    #[test]
    fn test_block_round_trips_model_as_string() -> anyhow::Result<()> {
        let block = Block::new(Uuid::new_v4(), ModelId::new(ProviderKind::Anthropic, "claude-3-5-sonnet"));
        let value = serde_json::to_value(&block)?;
        assert_eq!(value["model"], json!("anthropic/claude-3-5-sonnet"));
        assert_eq!(value["type"], json!("chat"));
        Ok(())
    }

    #[test]
    fn test_self_loop_detection() {
        let id = Uuid::new_v4();
        assert!(Connection::new(id, id).is_self_loop());
        assert!(!Connection::new(id, Uuid::new_v4()).is_self_loop());
    }
}
