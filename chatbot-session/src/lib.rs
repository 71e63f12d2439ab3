//! Client-side session protocol for a WebSocket chatbot whose replies can
//! take minutes.
//!
//! See `README.md` for usage. Each module focuses on a concrete
//! responsibility:
//!
//! - [`transport`] wraps one socket connection as a command handle plus an
//!   ordered event stream, with a `tokio-tungstenite` implementation.
//! - [`message`] holds the chat timeline entries and decodes server frames
//!   (plain strings or `{"message": ...}` JSON).
//! - [`state`] defines session states, pending requests and feed events.
//! - [`session`] runs the state machine, its greeting and response watchdogs,
//!   and hands out [`session::SessionHandle`]s and [`session::EventFeed`]s.
//! - [`config`], [`error`] and [`diagnostics`] cover settings, the error
//!   taxonomy and the optional logging hook.
//! - [`cli`], [`client`] and [`probe`] are the terminal harnesses built on
//!   the public session API.
//!
//! Integration tests drive the session with a fake transport under a paused
//! clock, and the real transport against an in-process WebSocket bot.

pub mod cli;
pub mod client;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod message;
pub mod probe;
pub mod session;
pub mod state;
pub mod transport;

pub use config::{ResponseTimeoutPolicy, SessionConfig};
pub use error::SessionError;
pub use message::{ChatMessage, Sender};
pub use session::{EventFeed, Session, SessionHandle};
pub use state::{SessionEvent, SessionState};
