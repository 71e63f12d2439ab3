use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{error::SessionError, message::ChatMessage};

/// Externally visible connection phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    AwaitingGreeting,
    Ready,
    AwaitingResponse,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    /// `Closed` and `Failed` are final; a new session is needed afterwards.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::AwaitingGreeting => "awaiting greeting",
            SessionState::Ready => "ready",
            SessionState::AwaitingResponse => "awaiting response",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// The single outstanding user message awaiting a bot reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub text: String,
    pub sent_at: Instant,
    /// `None` when the patience is too large to represent; the request then
    /// waits without a watchdog.
    pub deadline: Option<Instant>,
}

impl PendingRequest {
    pub fn new(text: String, sent_at: Instant, patience: Duration) -> Self {
        Self {
            text,
            sent_at,
            deadline: deadline_after(sent_at, patience),
        }
    }
}

/// Deadline `patience` after `start`, or `None` if it lies beyond what an
/// `Instant` can hold.
pub(crate) fn deadline_after(start: Instant, patience: Duration) -> Option<Instant> {
    start.checked_add(patience)
}

/// One entry of the ordered feed a session publishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Message(ChatMessage),
    State { value: SessionState },
    Error { error: SessionError },
}

/// Internal phase. Watchdog deadlines live inside the phases they guard, so
/// leaving a phase disarms its watchdog and a pending request cannot outlive
/// `AwaitingResponse`.
#[derive(Debug)]
pub(crate) enum Phase {
    Idle,
    Connecting,
    AwaitingGreeting { deadline: Option<Instant> },
    Ready,
    AwaitingResponse(PendingRequest),
    Closing,
    Closed,
    Failed,
}

impl Phase {
    pub(crate) fn state(&self) -> SessionState {
        match self {
            Phase::Idle => SessionState::Idle,
            Phase::Connecting => SessionState::Connecting,
            Phase::AwaitingGreeting { .. } => SessionState::AwaitingGreeting,
            Phase::Ready => SessionState::Ready,
            Phase::AwaitingResponse(_) => SessionState::AwaitingResponse,
            Phase::Closing => SessionState::Closing,
            Phase::Closed => SessionState::Closed,
            Phase::Failed => SessionState::Failed,
        }
    }

    pub(crate) fn watchdog(&self) -> Option<Instant> {
        match self {
            Phase::AwaitingGreeting { deadline } => *deadline,
            Phase::AwaitingResponse(pending) => pending.deadline,
            _ => None,
        }
    }

    /// Phases in which the bot may deliver chat content.
    pub(crate) fn accepts_frames(&self) -> bool {
        matches!(
            self,
            Phase::AwaitingGreeting { .. } | Phase::Ready | Phase::AwaitingResponse(_)
        )
    }

    /// Phases in which a transport failure is unexpected.
    pub(crate) fn is_live(&self) -> bool {
        matches!(self, Phase::Connecting) || self.accepts_frames()
    }
}
