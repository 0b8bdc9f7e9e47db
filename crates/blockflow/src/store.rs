//! Persistence boundary. The relational store is external; [`InMemoryStore`]
//! backs the server and tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use uuid::Uuid;

use crate::canvas::{DragTarget, Endpoint, PositionSink};
use crate::models::board::{Block, Board, Connection, Position};
use crate::models::credential::ProviderCredential;
use crate::models::message::Message;
use crate::models::role::Role;
use crate::webhook::{SubscriptionRecord, SubscriptionStore};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Board {0} not found")]
    BoardNotFound(Uuid),

    #[error("Block {0} not found")]
    BlockNotFound(Uuid),

    #[error("Connection {0} not found")]
    ConnectionNotFound(Uuid),

    #[error("Credential {0} not found")]
    CredentialNotFound(Uuid),

    #[error("A block cannot be connected to itself")]
    SelfLoop,

    #[error("Context messages must name their source block")]
    MissingContextSource,

    #[error("Storage backend failed: {0}")]
    Backend(String),
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn get_block(&self, block_id: Uuid) -> Result<Block, StoreError>;

    /// Connections whose target is `block_id`
    async fn list_connections(&self, block_id: Uuid) -> Result<Vec<Connection>, StoreError>;

    /// A block's messages in insertion order
    async fn list_messages(&self, block_id: Uuid) -> Result<Vec<Message>, StoreError>;

    async fn get_message(
        &self,
        block_id: Uuid,
        message_id: Uuid,
    ) -> Result<Option<Message>, StoreError>;

    async fn append_message(&self, message: Message) -> Result<(), StoreError>;

    async fn upsert_credential(&self, credential: ProviderCredential) -> Result<(), StoreError>;

    async fn get_credential(&self, credential_id: Uuid) -> Result<ProviderCredential, StoreError>;
}

#[derive(Debug, Default)]
struct Tables {
    boards: HashMap<Uuid, Board>,
    blocks: HashMap<Uuid, Block>,
    connections: Vec<Connection>,
    endpoints: HashMap<(Uuid, Endpoint), Position>,
    messages: HashMap<Uuid, Vec<Message>>,
    credentials: HashMap<Uuid, ProviderCredential>,
    subscriptions: HashMap<String, SubscriptionRecord>,
}

/// Locks are only taken inside synchronous sections and never held across an await.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_board(&self, board: Board) {
        self.write().boards.insert(board.id, board);
    }

    pub fn insert_block(&self, block: Block) -> Result<(), StoreError> {
        let mut tables = self.write();
        if !tables.boards.contains_key(&block.board_id) {
            return Err(StoreError::BoardNotFound(block.board_id));
        }
        tables.blocks.insert(block.id, block);
        Ok(())
    }

    /// Add an edge. Cycles are allowed, self-loops are not.
    pub fn connect(&self, connection: Connection) -> Result<(), StoreError> {
        if connection.is_self_loop() {
            return Err(StoreError::SelfLoop);
        }
        let mut tables = self.write();
        for id in [connection.source_block_id, connection.target_block_id] {
            if !tables.blocks.contains_key(&id) {
                return Err(StoreError::BlockNotFound(id));
            }
        }
        tables.connections.push(connection);
        Ok(())
    }

    /// Remove a block and its messages. Provenance pointers elsewhere are left
    /// dangling and resolve as unavailable.
    pub fn delete_block(&self, block_id: Uuid) -> Result<(), StoreError> {
        let mut tables = self.write();
        tables
            .blocks
            .remove(&block_id)
            .ok_or(StoreError::BlockNotFound(block_id))?;
        tables.messages.remove(&block_id);
        tables
            .connections
            .retain(|c| c.source_block_id != block_id && c.target_block_id != block_id);
        Ok(())
    }

    pub fn endpoint_position(&self, connection_id: Uuid, end: Endpoint) -> Option<Position> {
        self.read().endpoints.get(&(connection_id, end)).copied()
    }

    pub fn subscription(&self, subscription_id: &str) -> Option<SubscriptionRecord> {
        self.read().subscriptions.get(subscription_id).cloned()
    }
}

#[async_trait]
impl GraphStore for InMemoryStore {
    async fn get_block(&self, block_id: Uuid) -> Result<Block, StoreError> {
        self.read()
            .blocks
            .get(&block_id)
            .cloned()
            .ok_or(StoreError::BlockNotFound(block_id))
    }

    async fn list_connections(&self, block_id: Uuid) -> Result<Vec<Connection>, StoreError> {
        Ok(self
            .read()
            .connections
            .iter()
            .filter(|c| c.target_block_id == block_id)
            .cloned()
            .collect())
    }

    async fn list_messages(&self, block_id: Uuid) -> Result<Vec<Message>, StoreError> {
        let tables = self.read();
        if !tables.blocks.contains_key(&block_id) {
            return Err(StoreError::BlockNotFound(block_id));
        }
        Ok(tables.messages.get(&block_id).cloned().unwrap_or_default())
    }

    async fn get_message(
        &self,
        block_id: Uuid,
        message_id: Uuid,
    ) -> Result<Option<Message>, StoreError> {
        Ok(self
            .read()
            .messages
            .get(&block_id)
            .and_then(|messages| messages.iter().find(|m| m.id == message_id))
            .cloned())
    }

    async fn append_message(&self, message: Message) -> Result<(), StoreError> {
        if message.role == Role::Context && message.source_block_id.is_none() {
            return Err(StoreError::MissingContextSource);
        }
        let mut tables = self.write();
        if !tables.blocks.contains_key(&message.block_id) {
            return Err(StoreError::BlockNotFound(message.block_id));
        }
        tables
            .messages
            .entry(message.block_id)
            .or_default()
            .push(message);
        Ok(())
    }

    async fn upsert_credential(&self, credential: ProviderCredential) -> Result<(), StoreError> {
        self.write().credentials.insert(credential.id, credential);
        Ok(())
    }

    async fn get_credential(&self, credential_id: Uuid) -> Result<ProviderCredential, StoreError> {
        self.read()
            .credentials
            .get(&credential_id)
            .cloned()
            .ok_or(StoreError::CredentialNotFound(credential_id))
    }
}

#[async_trait]
impl PositionSink for InMemoryStore {
    async fn persist(&self, target: DragTarget, position: Position) -> Result<(), StoreError> {
        let mut tables = self.write();
        match target {
            DragTarget::Block(block_id) => {
                let block = tables
                    .blocks
                    .get_mut(&block_id)
                    .ok_or(StoreError::BlockNotFound(block_id))?;
                block.position = position;
            }
            DragTarget::ConnectionEndpoint { connection_id, end } => {
                if !tables.connections.iter().any(|c| c.id == connection_id) {
                    return Err(StoreError::ConnectionNotFound(connection_id));
                }
                tables.endpoints.insert((connection_id, end), position);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryStore {
    async fn upsert_subscription(&self, record: SubscriptionRecord) -> Result<(), StoreError> {
        self.write()
            .subscriptions
            .insert(record.subscription_id.clone(), record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::board::ModelId;
    use crate::providers::factory::ProviderKind;

    fn seeded() -> (InMemoryStore, Block, Block) {
        let store = InMemoryStore::new();
        let board = Board::new("owner", "Research");
        let a = Block::new(board.id, ModelId::new(ProviderKind::OpenAi, "gpt-4o"));
        let b = Block::new(board.id, ModelId::new(ProviderKind::Anthropic, "claude-3-5-sonnet"));
        store.insert_board(board);
        store.insert_block(a.clone()).unwrap();
        store.insert_block(b.clone()).unwrap();
        (store, a, b)
    }

    #[test]
    fn test_connect_rejects_self_loop_but_allows_cycles() {
        let (store, a, b) = seeded();
        assert_eq!(
            store.connect(Connection::new(a.id, a.id)),
            Err(StoreError::SelfLoop)
        );
        assert!(store.connect(Connection::new(a.id, b.id)).is_ok());
        assert!(store.connect(Connection::new(b.id, a.id)).is_ok());
    }

    #[tokio::test]
    async fn test_messages_keep_insertion_order() -> anyhow::Result<()> {
        let (store, a, _) = seeded();
        store.append_message(Message::user(a.id).with_text("one")).await?;
        store.append_message(Message::assistant(a.id).with_text("two")).await?;

        let contents: Vec<String> = store
            .list_messages(a.id)
            .await?
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["one", "two"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_context_message_requires_source() {
        let (store, a, b) = seeded();
        let mut message = Message::context(a.id, b.id).with_text("quoted");
        message.source_block_id = None;
        assert_eq!(
            store.append_message(message).await,
            Err(StoreError::MissingContextSource)
        );
    }

    #[tokio::test]
    async fn test_delete_block_drops_edges_and_messages() -> anyhow::Result<()> {
        let (store, a, b) = seeded();
        store.connect(Connection::new(a.id, b.id))?;
        let message = Message::assistant(a.id).with_text("gone soon");
        let message_id = message.id;
        store.append_message(message).await?;

        store.delete_block(a.id)?;
        assert!(store.list_connections(b.id).await?.is_empty());
        assert_eq!(store.get_message(a.id, message_id).await?, None);
        assert_eq!(
            store.get_block(a.id).await,
            Err(StoreError::BlockNotFound(a.id))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_persist_positions() -> anyhow::Result<()> {
        let (store, a, b) = seeded();
        let connection = Connection::new(a.id, b.id);
        let connection_id = connection.id;
        store.connect(connection)?;

        store
            .persist(DragTarget::Block(a.id), Position::new(300.0, 150.0))
            .await?;
        assert_eq!(store.get_block(a.id).await?.position, Position::new(300.0, 150.0));

        store
            .persist(
                DragTarget::ConnectionEndpoint {
                    connection_id,
                    end: Endpoint::Target,
                },
                Position::new(5.0, 6.0),
            )
            .await?;
        assert_eq!(
            store.endpoint_position(connection_id, Endpoint::Target),
            Some(Position::new(5.0, 6.0))
        );
        Ok(())
    }
}
