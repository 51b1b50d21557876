use thiserror::Error;

/// Engine error taxonomy. Signal-quality errors never surface to viewers;
/// nothing here is fatal to the process.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("signal quality: {0}")]
    SignalQuality(String),

    #[error("connection: {0}")]
    Connection(String),

    #[error("persistence: {0}")]
    Persistence(String),

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("config: {0}")]
    Config(String),
}

impl EngineError {
    /// Whether the error is recovered locally via retry/backoff rather
    /// than being reported to the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::Connection(_) | EngineError::Persistence(_)
        )
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persistence_and_connection_are_recoverable() {
        assert!(EngineError::Persistence("db down".into()).is_recoverable());
        assert!(EngineError::Connection("socket closed".into()).is_recoverable());
        assert!(!EngineError::Protocol("bad frame".into()).is_recoverable());
    }
}
