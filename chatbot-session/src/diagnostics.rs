//! Optional observability hook for a session.
//!
//! The session calls the hook on every state transition, every event it
//! publishes, every transport close, and every input that had no effect. Without a hook nothing is
//! logged about protocol flow.

use tracing::{debug, info};

use crate::state::{SessionEvent, SessionState};

#[derive(Debug)]
pub enum Diagnostic<'a> {
    Transition {
        from: SessionState,
        to: SessionState,
    },
    Emitted(&'a SessionEvent),
    /// The transport reported its final close, whatever the session made of it.
    TransportClosed {
        code: u16,
        reason: &'a str,
    },
    Ignored {
        input: &'static str,
        state: SessionState,
    },
}

pub type DiagnosticHook = Box<dyn FnMut(&Diagnostic<'_>) + Send>;

/// A hook that forwards diagnostics to `tracing`.
pub fn tracing_hook() -> DiagnosticHook {
    Box::new(log_diagnostic)
}

fn log_diagnostic(diagnostic: &Diagnostic<'_>) {
    match diagnostic {
        Diagnostic::Transition { from, to } => info!(%from, %to, "session state changed"),
        Diagnostic::Emitted(event) => debug!(?event, "session event"),
        Diagnostic::TransportClosed { code, reason } => info!(code, reason, "transport closed"),
        Diagnostic::Ignored { input, state } => debug!(input, %state, "input ignored"),
    }
}
