use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::state::SessionState;

/// Everything that can go wrong in a session. These are delivered as
/// [`SessionEvent::Error`](crate::state::SessionEvent::Error) on the event
/// feed rather than returned, except [`SessionError::Terminated`], which a
/// handle returns once the session task is gone.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionError {
    #[error("connection failed: {detail}")]
    Connection { detail: String },
    #[error("no greeting received within {waited:?}")]
    GreetingTimeout { waited: Duration },
    #[error("no response received within {waited:?}")]
    ResponseTimeout { waited: Duration },
    #[error("dropped malformed payload: {detail}")]
    MalformedPayload { detail: String },
    #[error("cannot send while {state}")]
    NotReady { state: SessionState },
    #[error("session already started ({state})")]
    AlreadyStarted { state: SessionState },
    #[error("session has ended")]
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Connection,
    ProtocolTimeout,
    MalformedPayload,
    Usage,
}

impl SessionError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SessionError::Connection { .. } => ErrorCategory::Connection,
            SessionError::GreetingTimeout { .. } | SessionError::ResponseTimeout { .. } => {
                ErrorCategory::ProtocolTimeout
            }
            SessionError::MalformedPayload { .. } => ErrorCategory::MalformedPayload,
            SessionError::NotReady { .. }
            | SessionError::AlreadyStarted { .. }
            | SessionError::Terminated => ErrorCategory::Usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_errors_name_the_current_state() {
        let err = SessionError::NotReady {
            state: SessionState::AwaitingResponse,
        };
        assert_eq!(err.category(), ErrorCategory::Usage);
        assert_eq!(err.to_string(), "cannot send while awaiting response");
    }

    #[test]
    fn serializes_with_kind_tag() {
        let err = SessionError::Connection {
            detail: "refused".into(),
        };
        let json = serde_json::to_value(&err).expect("serialize");
        assert_eq!(json["kind"], "connection");
        assert_eq!(json["detail"], "refused");
    }
}
