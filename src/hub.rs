use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::protocol::{BroadcastMessage, MessageType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewerRole {
    Student,
    Admin,
}

/// What a connection is allowed to see. Students watch a single learner;
/// admins watch all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LearnerScope {
    Single(Uuid),
    All,
}

impl LearnerScope {
    fn covers(&self, learner_id: Uuid) -> bool {
        match self {
            LearnerScope::Single(id) => *id == learner_id,
            LearnerScope::All => true,
        }
    }
}

struct ConnectionEntry {
    role: ViewerRole,
    scope: LearnerScope,
    sender: mpsc::Sender<BroadcastMessage>,
}

/// Handle returned to the transport layer. Dropping the receiver is how a
/// dead connection eventually gets evicted.
pub struct Subscription {
    pub id: Uuid,
    pub receiver: mpsc::Receiver<BroadcastMessage>,
}

/// Fan-out registry for every live viewer connection. Single instance per
/// process; the aggregator writes, connections read. Sends never block:
/// a viewer that cannot keep up loses messages, a closed viewer loses its
/// registry entry, and neither stalls anyone else.
pub struct BroadcastHub {
    connections: RwLock<HashMap<Uuid, ConnectionEntry>>,
    capacity: usize,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Registers a connection and delivers its initial message. The entry
    /// is inserted and the initial message enqueued under one write lock,
    /// so no delta published concurrently can precede the snapshot.
    pub async fn subscribe(
        &self,
        role: ViewerRole,
        scope: LearnerScope,
        initial: BroadcastMessage,
    ) -> Subscription {
        debug_assert!(initial.kind.is_initial());
        let (sender, receiver) = mpsc::channel(self.capacity);
        let id = Uuid::new_v4();

        let mut connections = self.connections.write().await;
        // A freshly created channel with nonzero capacity always accepts
        // the first message.
        let _ = sender.try_send(initial);
        connections.insert(id, ConnectionEntry { role, scope, sender });
        debug!(connection = %id, ?role, total = connections.len(), "viewer subscribed");

        Subscription { id, receiver }
    }

    pub async fn unsubscribe(&self, id: Uuid) {
        let mut connections = self.connections.write().await;
        if connections.remove(&id).is_some() {
            debug!(connection = %id, total = connections.len(), "viewer unsubscribed");
        }
    }

    pub async fn publish_progress(&self, learner_id: Uuid, snapshot: serde_json::Value) {
        let message =
            BroadcastMessage::new(MessageType::ProgressUpdate, Some(learner_id), snapshot);
        self.fan_out(learner_id, message).await;
    }

    pub async fn publish_emotion(&self, learner_id: Uuid, emotion: serde_json::Value) {
        let message =
            BroadcastMessage::new(MessageType::NewEmotion, Some(learner_id), emotion);
        self.fan_out(learner_id, message).await;
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    async fn fan_out(&self, learner_id: Uuid, message: BroadcastMessage) {
        let mut closed = Vec::new();
        {
            let connections = self.connections.read().await;
            for (id, entry) in connections.iter() {
                let wants = match entry.role {
                    ViewerRole::Admin => true,
                    ViewerRole::Student => entry.scope.covers(learner_id),
                };
                if !wants {
                    continue;
                }
                match entry.sender.try_send(message.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        // Slow consumer: drop this message for this viewer
                        // rather than stall the writer.
                        warn!(connection = %id, "viewer channel full, dropping message");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        closed.push(*id);
                    }
                }
            }
        }
        if !closed.is_empty() {
            let mut connections = self.connections.write().await;
            for id in closed {
                connections.remove(&id);
                debug!(connection = %id, "evicted closed viewer connection");
            }
        }
    }
}
