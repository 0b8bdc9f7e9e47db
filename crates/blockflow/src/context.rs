//! Builds the bounded context a block sends to its model.
//!
//! Candidates are gathered in priority order: the block's own recent history, quoted
//! references, then the latest answer of each upstream block (breadth first). The
//! budget is filled greedily with whole items; the first item that does not fit ends
//! the payload, so lower-priority material never displaces higher-priority material.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::errors::ChatError;
use crate::models::message::{ChatMessage, Message};
use crate::models::reference::ChatReference;
use crate::models::role::Role;
use crate::store::{GraphStore, StoreError};

pub const DEFAULT_HISTORY_LIMIT: usize = 50;
/// Upper bound on upstream hops, even for transitive requests
pub const MAX_TRANSITIVE_DEPTH: usize = 3;
pub const CHARS_PER_TOKEN: usize = 4;

#[derive(Error, Debug)]
pub enum ContextError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRequest {
    pub block_id: Uuid,
    pub budget_chars: usize,
    #[serde(default)]
    pub references: Vec<ChatReference>,
    #[serde(default)]
    pub include_transitive: bool,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

impl ContextRequest {
    pub fn new(block_id: Uuid, budget_chars: usize) -> Self {
        ContextRequest {
            block_id,
            budget_chars,
            references: Vec::new(),
            include_transitive: false,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    pub fn with_references(mut self, references: Vec<ChatReference>) -> Self {
        self.references = references;
        self
    }

    pub fn transitive(mut self, include_transitive: bool) -> Self {
        self.include_transitive = include_transitive;
        self
    }

    pub fn with_history_limit(mut self, history_limit: usize) -> Self {
        self.history_limit = history_limit;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    History,
    Reference,
    Upstream,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    pub kind: SourceKind,
    pub role: Role,
    pub content: String,
    /// Block the text came from; the requesting block itself for history
    pub source_block_id: Uuid,
    pub message_id: Uuid,
    /// Upstream hop count; zero for history and references
    pub depth: usize,
}

impl ContextItem {
    fn history(message: &Message) -> Self {
        ContextItem {
            kind: SourceKind::History,
            role: message.role,
            content: message.content.clone(),
            source_block_id: message.source_block_id.unwrap_or(message.block_id),
            message_id: message.id,
            depth: 0,
        }
    }

    pub fn chars(&self) -> usize {
        self.content.chars().count()
    }
}

/// A provenance pointer that could not be resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnavailableSource {
    pub source_block_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextPayload {
    pub block_id: Uuid,
    pub budget_chars: usize,
    /// Included items, highest priority first
    pub items: Vec<ContextItem>,
    pub included_count: usize,
    pub truncated: bool,
    pub dropped_count: usize,
    pub total_chars: usize,
    pub estimated_tokens: usize,
    pub unavailable_sources: Vec<UnavailableSource>,
}

impl ContextPayload {
    /// Informational error to surface alongside the response when items were dropped
    pub fn budget_notice(&self) -> Option<ChatError> {
        self.truncated
            .then(|| ChatError::context_budget_exceeded(self.dropped_count, self.budget_chars))
    }

    /// Prompt layout: injected context first, then own history oldest to newest
    pub fn to_chat_messages(&self) -> Vec<ChatMessage> {
        let context = self
            .items
            .iter()
            .filter(|item| item.kind != SourceKind::History)
            .map(|item| ChatMessage::context(item.source_block_id, item.content.as_str()));

        let history = self
            .items
            .iter()
            .rev()
            .filter(|item| item.kind == SourceKind::History)
            .map(|item| match item.role {
                Role::Context => ChatMessage::context(item.source_block_id, item.content.as_str()),
                role => ChatMessage::new(role, item.content.as_str()),
            });

        context.chain(history).collect()
    }
}

#[derive(Clone)]
pub struct ContextAssembler {
    store: Arc<dyn GraphStore>,
}

impl ContextAssembler {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    pub async fn assemble(&self, request: &ContextRequest) -> Result<ContextPayload, ContextError> {
        // Fails for unknown blocks before anything else is read
        self.store.get_block(request.block_id).await?;

        let mut unavailable = Vec::new();
        let mut candidates = self.history(request).await?;
        candidates.extend(self.references(&request.references, &mut unavailable).await?);
        candidates.extend(self.upstream(request, &mut unavailable).await?);

        let payload = fit(request, candidates, unavailable);
        tracing::debug!(
            block_id = %request.block_id,
            included = payload.included_count,
            dropped = payload.dropped_count,
            total_chars = payload.total_chars,
            "context assembled"
        );
        Ok(payload)
    }

    async fn history(&self, request: &ContextRequest) -> Result<Vec<ContextItem>, ContextError> {
        let messages = self.store.list_messages(request.block_id).await?;
        Ok(messages
            .iter()
            .rev()
            .filter(|m| m.role != Role::System)
            .take(request.history_limit)
            .map(ContextItem::history)
            .collect())
    }

    async fn references(
        &self,
        references: &[ChatReference],
        unavailable: &mut Vec<UnavailableSource>,
    ) -> Result<Vec<ContextItem>, ContextError> {
        let mut items = Vec::new();
        for reference in references {
            let message = self
                .store
                .get_message(reference.source_block_id, reference.source_message_id)
                .await?;
            match message.as_ref().and_then(|m| reference.resolve(&m.content)) {
                Some(quote) => items.push(ContextItem {
                    kind: SourceKind::Reference,
                    role: Role::Context,
                    content: quote.to_string(),
                    source_block_id: reference.source_block_id,
                    message_id: reference.source_message_id,
                    depth: 0,
                }),
                None => unavailable.push(UnavailableSource {
                    source_block_id: reference.source_block_id,
                    message_id: Some(reference.source_message_id),
                }),
            }
        }
        Ok(items)
    }

    /// Breadth-first walk over incoming connections. The visited set starts with the
    /// requesting block, so cycles terminate and no block contributes twice.
    async fn upstream(
        &self,
        request: &ContextRequest,
        unavailable: &mut Vec<UnavailableSource>,
    ) -> Result<Vec<ContextItem>, ContextError> {
        let max_depth = if request.include_transitive {
            MAX_TRANSITIVE_DEPTH
        } else {
            1
        };

        let mut items = Vec::new();
        let mut visited = HashSet::from([request.block_id]);
        let mut frontier = vec![request.block_id];

        for depth in 1..=max_depth {
            let mut next = Vec::new();
            for block_id in frontier {
                for connection in self.store.list_connections(block_id).await? {
                    let source = connection.source_block_id;
                    if !visited.insert(source) {
                        continue;
                    }
                    let messages = match self.store.list_messages(source).await {
                        Ok(messages) => messages,
                        Err(StoreError::BlockNotFound(_)) => {
                            unavailable.push(UnavailableSource {
                                source_block_id: source,
                                message_id: None,
                            });
                            continue;
                        }
                        Err(err) => return Err(err.into()),
                    };
                    if let Some(latest) = messages.iter().rev().find(|m| m.role == Role::Assistant)
                    {
                        items.push(ContextItem {
                            kind: SourceKind::Upstream,
                            role: Role::Context,
                            content: latest.content.clone(),
                            source_block_id: source,
                            message_id: latest.id,
                            depth,
                        });
                    }
                    next.push(source);
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
        Ok(items)
    }
}

/// Greedy whole-item fit; stops at the first item that would overflow
fn fit(
    request: &ContextRequest,
    candidates: Vec<ContextItem>,
    unavailable_sources: Vec<UnavailableSource>,
) -> ContextPayload {
    let candidate_count = candidates.len();
    let mut total_chars = 0;
    let mut items = Vec::new();

    for item in candidates {
        let size = item.chars();
        if total_chars + size > request.budget_chars {
            break;
        }
        total_chars += size;
        items.push(item);
    }

    let included_count = items.len();
    ContextPayload {
        block_id: request.block_id,
        budget_chars: request.budget_chars,
        items,
        included_count,
        truncated: included_count < candidate_count,
        dropped_count: candidate_count - included_count,
        total_chars,
        estimated_tokens: total_chars / CHARS_PER_TOKEN,
        unavailable_sources,
    }
}
