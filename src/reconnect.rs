use std::time::Duration;

use tracing::warn;

use crate::config::BackoffConfig;
use crate::error::EngineError;
use crate::protocol::BroadcastMessage;

/// Exponential backoff: base doubling per attempt, capped, bounded retry
/// count. Attempt numbering is 1-based.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
        }
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.base_delay(), config.max_delay(), config.max_attempts)
    }

    /// Delay before the given reconnect attempt, or `None` once the retry
    /// budget is exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let exp = attempt.saturating_sub(1).min(32);
        let delay = self
            .base
            .checked_mul(2u32.saturating_pow(exp))
            .unwrap_or(self.cap);
        Some(delay.min(self.cap))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Connecting,
    Open,
    Closed { clean: bool },
}

/// Client-side connection state machine. Transport-agnostic: the socket
/// implementation reports lifecycle edges and raw frames, and the machine
/// answers with reconnect delays and ordered messages ready to apply.
///
/// Deltas arriving before the initial snapshot are buffered and released
/// only after it lands, so a viewer can never observe partial state.
#[derive(Debug)]
pub struct ConnectionManager {
    policy: BackoffPolicy,
    state: SocketState,
    backoff_attempt: u32,
    synced: bool,
    pending: Vec<BroadcastMessage>,
}

impl ConnectionManager {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            state: SocketState::Connecting,
            backoff_attempt: 0,
            synced: false,
            pending: Vec::new(),
        }
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn backoff_attempt(&self) -> u32 {
        self.backoff_attempt
    }

    /// The socket opened. The attempt counter resets and the manager
    /// expects a fresh initial snapshot before trusting any delta.
    pub fn on_open(&mut self) {
        self.state = SocketState::Open;
        self.backoff_attempt = 0;
        self.synced = false;
        self.pending.clear();
    }

    /// The socket closed. Returns the delay before the next reconnect
    /// attempt, or `None` for a clean closure or an exhausted retry
    /// budget. A clean closure never reconnects.
    pub fn on_close(&mut self, clean: bool) -> Option<Duration> {
        self.state = SocketState::Closed { clean };
        self.synced = false;
        if clean {
            return None;
        }
        self.backoff_attempt += 1;
        let delay = self.policy.delay_for(self.backoff_attempt);
        if delay.is_some() {
            self.state = SocketState::Connecting;
        }
        delay
    }

    /// Consumes one raw frame and returns the messages now ready to apply,
    /// in order. A malformed frame is logged and discarded; the connection
    /// stays up.
    pub fn on_frame(&mut self, raw: &str) -> Vec<BroadcastMessage> {
        let message = match BroadcastMessage::decode(raw) {
            Ok(message) => message,
            Err(EngineError::Protocol(reason)) => {
                warn!(%reason, "discarding malformed broadcast frame");
                return Vec::new();
            }
            Err(err) => {
                warn!(error = %err, "discarding undecodable broadcast frame");
                return Vec::new();
            }
        };

        if message.kind.is_initial() {
            self.synced = true;
            let mut ready = Vec::with_capacity(1 + self.pending.len());
            ready.push(message);
            ready.append(&mut self.pending);
            return ready;
        }

        if !self.synced {
            self.pending.push(message);
            return Vec::new();
        }

        vec![message]
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }
}
