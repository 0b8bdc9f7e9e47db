use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::role::Role;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub input_tokens: Option<i32>,
    pub output_tokens: Option<i32>,
    pub cost: Option<f64>,
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// One entry of a block's append-only message log
pub struct Message {
    pub id: Uuid,
    pub block_id: Uuid,
    pub role: Role,
    pub content: String,
    /// Set for `Role::Context`: the block the content was taken from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_block_id: Option<Uuid>,
    pub created: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

impl Message {
    fn new(block_id: Uuid, role: Role, source_block_id: Option<Uuid>) -> Self {
        Message {
            id: Uuid::new_v4(),
            block_id,
            role,
            content: String::new(),
            source_block_id,
            created: Utc::now().timestamp_millis(),
            metadata: None,
        }
    }

    /// Create a new user message with the current timestamp
    pub fn user(block_id: Uuid) -> Self {
        Self::new(block_id, Role::User, None)
    }

    /// Create a new assistant message with the current timestamp
    pub fn assistant(block_id: Uuid) -> Self {
        Self::new(block_id, Role::Assistant, None)
    }

    pub fn system(block_id: Uuid) -> Self {
        Self::new(block_id, Role::System, None)
    }

    /// Context messages always carry the block they were copied from
    pub fn context(block_id: Uuid, source_block_id: Uuid) -> Self {
        Self::new(block_id, Role::Context, Some(source_block_id))
    }

    /// Append text to the message
    pub fn with_text<S: AsRef<str>>(mut self, text: S) -> Self {
        self.content.push_str(text.as_ref());
        self
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn size_bytes(&self) -> usize {
        self.content.len()
    }

    pub fn to_chat_message(&self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            content: self.content.clone(),
            source_block_id: self.source_block_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Normalized `{role, content}` pair sent through the provider proxy
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_block_id: Option<Uuid>,
}

impl ChatMessage {
    pub fn new<S: Into<String>>(role: Role, content: S) -> Self {
        ChatMessage {
            role,
            content: content.into(),
            source_block_id: None,
        }
    }

    pub fn system<S: Into<String>>(content: S) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user<S: Into<String>>(content: S) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant<S: Into<String>>(content: S) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn context<S: Into<String>>(source_block_id: Uuid, content: S) -> Self {
        ChatMessage {
            role: Role::Context,
            content: content.into(),
            source_block_id: Some(source_block_id),
        }
    }
}
