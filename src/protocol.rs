use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

/// Server-to-client message vocabulary. Viewer connections are
/// receive-only; there is no client-to-server vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "INITIAL_SNAPSHOT")]
    InitialSnapshot,
    #[serde(rename = "INITIAL_STUDENT_DATA")]
    InitialStudentData,
    #[serde(rename = "PROGRESS_UPDATE")]
    ProgressUpdate,
    #[serde(rename = "NEW_EMOTION")]
    NewEmotion,
}

impl MessageType {
    /// Initial messages establish a viewer's full state; everything else
    /// is a delta against it.
    pub fn is_initial(&self) -> bool {
        matches!(
            self,
            MessageType::InitialSnapshot | MessageType::InitialStudentData
        )
    }
}

/// Wire envelope `{type, learner_id?, data}`. Exists only on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub learner_id: Option<Uuid>,
    pub data: serde_json::Value,
}

impl BroadcastMessage {
    pub fn new(kind: MessageType, learner_id: Option<Uuid>, data: serde_json::Value) -> Self {
        Self {
            kind,
            learner_id,
            data,
        }
    }

    pub fn encode(&self) -> Result<String, EngineError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Malformed text or an unknown type tag is a protocol error. Callers
    /// log and discard; a single bad message never tears a connection down.
    pub fn decode(raw: &str) -> Result<Self, EngineError> {
        Ok(serde_json::from_str(raw)?)
    }
}
