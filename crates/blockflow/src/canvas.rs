//! Arbitration between live drags and server sync on the canvas.
//!
//! A [`DragSession`] owns the suspension flag for as long as it lives. Intermediate
//! positions only touch memory; exactly one position is persisted on release, and
//! dropping the session without releasing discards the drag.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

use crate::models::board::Position;
use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    Source,
    Target,
}

/// Anything the user can drag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DragTarget {
    Block(Uuid),
    ConnectionEndpoint { connection_id: Uuid, end: Endpoint },
}

impl fmt::Display for DragTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DragTarget::Block(id) => write!(f, "block {}", id),
            DragTarget::ConnectionEndpoint { connection_id, end } => {
                write!(f, "{:?} end of connection {}", end, connection_id)
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum CanvasError {
    #[error("A drag of {active} is already in progress")]
    DragInProgress { active: DragTarget },

    #[error("Failed to persist the position of {target}: {source}")]
    PersistFailed {
        target: DragTarget,
        #[source]
        source: StoreError,
    },
}

/// Where committed positions go
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PositionSink: Send + Sync {
    async fn persist(&self, target: DragTarget, position: Position) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    Apply,
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    #[default]
    Normal,
    Critical,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub message: String,
    pub priority: Priority,
}

impl Notification {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Notification {
            message: message.into(),
            priority: Priority::Normal,
        }
    }

    pub fn critical<S: Into<String>>(message: S) -> Self {
        Notification {
            message: message.into(),
            priority: Priority::Critical,
        }
    }
}

/// Result of a committed drag
#[derive(Debug, Clone, PartialEq)]
pub struct Released {
    pub target: DragTarget,
    pub position: Position,
    /// Invalidations that arrived during the drag, deduplicated, in arrival order
    pub deferred: Vec<String>,
}

#[derive(Debug, Default)]
struct SyncState {
    active: Option<DragTarget>,
    positions: HashMap<DragTarget, Position>,
    deferred: Vec<String>,
}

struct Shared {
    sink: Arc<dyn PositionSink>,
    state: Mutex<SyncState>,
    suspended: watch::Sender<bool>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clear the active drag, leave `target` at `position` and lift the suspension.
    /// Deferred keys are handed back when `drain` is set and stay queued otherwise.
    ///
    /// The flag only changes under the state lock, so it always agrees with `active`.
    fn end_drag(&self, target: DragTarget, position: Position, drain: bool) -> Vec<String> {
        let mut state = self.lock();
        state.positions.insert(target, position);
        if state.active != Some(target) {
            return Vec::new();
        }
        state.active = None;
        self.suspended.send_replace(false);
        if drain {
            std::mem::take(&mut state.deferred)
        } else {
            Vec::new()
        }
    }
}

#[derive(Clone)]
pub struct CanvasSyncController {
    shared: Arc<Shared>,
}

impl fmt::Debug for CanvasSyncController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CanvasSyncController")
            .field("active", &self.active_drag())
            .finish_non_exhaustive()
    }
}

impl CanvasSyncController {
    pub fn new(sink: Arc<dyn PositionSink>) -> Self {
        let (suspended, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                sink,
                state: Mutex::new(SyncState::default()),
                suspended,
            }),
        }
    }

    /// Start dragging `target` from `origin`. Only one drag may be active.
    pub fn begin_drag(
        &self,
        target: DragTarget,
        origin: Position,
    ) -> Result<DragSession, CanvasError> {
        let mut state = self.shared.lock();
        if let Some(active) = state.active {
            return Err(CanvasError::DragInProgress { active });
        }
        state.active = Some(target);
        state.positions.insert(target, origin);
        self.shared.suspended.send_replace(true);
        drop(state);

        tracing::debug!(drag = %target, "drag started");
        Ok(DragSession {
            shared: Arc::clone(&self.shared),
            target,
            origin,
            current: origin,
            finished: false,
        })
    }

    /// Last known position, including uncommitted drag movement
    pub fn position(&self, target: DragTarget) -> Option<Position> {
        self.shared.lock().positions.get(&target).copied()
    }

    pub fn active_drag(&self) -> Option<DragTarget> {
        self.shared.lock().active
    }

    pub fn is_suspended(&self) -> bool {
        *self.shared.suspended.borrow()
    }

    /// Follow the suspension flag, e.g. to park a background sync task while dragging
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shared.suspended.subscribe()
    }

    pub fn should_refetch(&self) -> bool {
        !self.is_suspended()
    }

    /// A server-side change to `key`. While dragging it is queued for after release.
    pub fn on_server_invalidation<S: Into<String>>(&self, key: S) -> SyncDecision {
        let mut state = self.shared.lock();
        if state.active.is_none() {
            return SyncDecision::Apply;
        }
        let key = key.into();
        if !state.deferred.contains(&key) {
            state.deferred.push(key);
        }
        SyncDecision::Deferred
    }

    /// Drain invalidations left queued by a drag that was dropped without release
    pub fn take_deferred(&self) -> Vec<String> {
        let mut state = self.shared.lock();
        if state.active.is_some() {
            return Vec::new();
        }
        std::mem::take(&mut state.deferred)
    }

    /// Whether a notification should be shown now. Critical ones always are.
    pub fn notify(&self, notification: &Notification) -> bool {
        notification.priority == Priority::Critical || !self.is_suspended()
    }
}

/// An in-progress drag. Must be released to commit; dropping it cancels.
#[must_use = "dropping a drag session cancels the drag"]
pub struct DragSession {
    shared: Arc<Shared>,
    target: DragTarget,
    origin: Position,
    current: Position,
    finished: bool,
}

impl fmt::Debug for DragSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DragSession")
            .field("target", &self.target)
            .field("origin", &self.origin)
            .field("current", &self.current)
            .finish()
    }
}

impl DragSession {
    pub fn target(&self) -> DragTarget {
        self.target
    }

    pub fn current(&self) -> Position {
        self.current
    }

    /// Memory only; nothing is persisted until release
    pub fn move_to(&mut self, position: Position) {
        self.current = position;
        self.shared.lock().positions.insert(self.target, position);
    }

    /// Persist the final position, then end the drag.
    ///
    /// On failure the drag still ends, the position reverts to the origin and
    /// deferred keys are left for `take_deferred`.
    pub async fn release(mut self) -> Result<Released, CanvasError> {
        let position = self.current;
        let persisted = self.shared.sink.persist(self.target, position).await;

        self.finished = true;
        match persisted {
            Ok(()) => {
                let deferred = self.shared.end_drag(self.target, position, true);
                tracing::info!(drag = %self.target, x = position.x, y = position.y, "drag committed");
                Ok(Released {
                    target: self.target,
                    position,
                    deferred,
                })
            }
            Err(source) => {
                self.shared.end_drag(self.target, self.origin, false);
                tracing::warn!(drag = %self.target, error = %source, "drag commit failed");
                Err(CanvasError::PersistFailed {
                    target: self.target,
                    source,
                })
            }
        }
    }

    /// Abandon the drag and return the invalidations that were held back
    pub fn cancel(mut self) -> Vec<String> {
        self.finished = true;
        self.shared.end_drag(self.target, self.origin, true)
    }
}

impl Drop for DragSession {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Deferred keys stay queued for take_deferred
        self.shared.end_drag(self.target, self.origin, false);
        tracing::debug!(drag = %self.target, "drag abandoned");
    }
}
