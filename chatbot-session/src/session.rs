//! The chat session state machine.
//!
//! A [`Session`] is spawned as a single tokio task that owns every piece of
//! mutable state. Caller commands, transport events and watchdog expiries
//! are folded into one ordered input stream, so transitions never race and
//! no locking is needed. Consumers interact through a cloneable
//! [`SessionHandle`] and read the outcome from an [`EventFeed`].
//!
//! ```text
//! Idle --start--> Connecting --opened--> AwaitingGreeting --message--> Ready
//! Ready --send--> AwaitingResponse --message / lenient timeout--> Ready
//! live phase --error/closed--> Failed      any --close--> Closing --> Closed
//! ```

use std::{
    pin::Pin,
    sync::{Arc, OnceLock},
    task::{Context, Poll},
};

use futures::Stream;
use tokio::{
    select,
    sync::{mpsc, watch},
    time::{Instant, sleep_until},
};

use crate::{
    config::{ResponseTimeoutPolicy, SessionConfig},
    diagnostics::{Diagnostic, DiagnosticHook},
    error::SessionError,
    message::{ChatMessage, decode_frame},
    state::{PendingRequest, Phase, SessionEvent, SessionState, deadline_after},
    transport::{
        ABNORMAL_CLOSURE, Connector, Frame, NORMAL_CLOSURE, TransportError, TransportEvent,
        TransportEvents, TransportHandle,
    },
};

/// An unstarted session. Call [`Session::spawn`] to obtain a handle.
pub struct Session<C: Connector> {
    config: SessionConfig,
    connector: C,
    diagnostics: Option<DiagnosticHook>,
}

impl<C: Connector> Session<C> {
    pub fn new(config: SessionConfig, connector: C) -> Self {
        Self {
            config,
            connector,
            diagnostics: None,
        }
    }

    /// Installs a callback invoked on every transition and published event.
    pub fn with_diagnostics<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&Diagnostic<'_>) + Send + 'static,
    {
        self.diagnostics = Some(Box::new(hook));
        self
    }

    /// Spawns the session task in the `Idle` state. Must be called from
    /// within a tokio runtime.
    pub fn spawn(self) -> SessionHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let archive = Arc::new(OnceLock::new());

        let actor = Actor {
            config: self.config,
            connector: self.connector,
            diagnostics: self.diagnostics,
            phase: Phase::Idle,
            link: None,
            commands: command_rx,
            accepting_commands: true,
            subscribers: Vec::new(),
            history: Vec::new(),
            state: state_tx,
            archive: Arc::clone(&archive),
        };
        tokio::spawn(actor.run());

        SessionHandle {
            commands: command_tx,
            state: state_rx,
            archive,
        }
    }
}

#[derive(Debug)]
enum Command {
    Start,
    Send(String),
    Close,
    Subscribe(mpsc::UnboundedSender<SessionEvent>),
}

/// Caller side of a running session. Cloning is cheap; when every clone is
/// dropped the session closes itself.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
    archive: Arc<OnceLock<Vec<SessionEvent>>>,
}

impl SessionHandle {
    /// Opens the transport. Only legal once, from `Idle`.
    pub fn start(&self) -> Result<(), SessionError> {
        self.submit(Command::Start)
    }

    /// Submits a user message. Blank text is ignored. Sending outside `Ready`
    /// is reported as [`SessionError::NotReady`] on the feed.
    pub fn send(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.submit(Command::Send(text.into()))
    }

    /// Closes the session. Idempotent, and silent once the session has ended.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    /// Returns a feed that replays every event published so far, then
    /// follows live events until the session ends. Subscribing after the end
    /// replays the complete timeline.
    pub fn subscribe(&self) -> EventFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Err(mpsc::error::SendError(Command::Subscribe(tx))) =
            self.commands.send(Command::Subscribe(tx))
        {
            // The actor archives its history before it stops taking commands.
            if let Some(history) = self.archive.get() {
                replay(history, &tx);
            }
        }
        EventFeed { events: rx }
    }

    /// The most recently published state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn submit(&self, command: Command) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::Terminated)
    }
}

/// Ordered, append-only sequence of session events. Ends once the session
/// reaches `Closed` or `Failed` and its transport has been released.
#[derive(Debug)]
pub struct EventFeed {
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl EventFeed {
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }
}

impl Stream for EventFeed {
    type Item = SessionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

struct Link<H> {
    handle: H,
    events: TransportEvents,
    close_requested: bool,
}

enum Input {
    Command(Option<Command>),
    Transport(Option<TransportEvent>),
    WatchdogExpired,
}

struct Actor<C: Connector> {
    config: SessionConfig,
    connector: C,
    diagnostics: Option<DiagnosticHook>,
    phase: Phase,
    link: Option<Link<C::Handle>>,
    commands: mpsc::UnboundedReceiver<Command>,
    accepting_commands: bool,
    subscribers: Vec<mpsc::UnboundedSender<SessionEvent>>,
    history: Vec<SessionEvent>,
    state: watch::Sender<SessionState>,
    archive: Arc<OnceLock<Vec<SessionEvent>>>,
}

impl<C: Connector> Actor<C> {
    async fn run(mut self) {
        while !self.finished() {
            let input = self.next_input().await;
            self.handle(input);
        }
        self.retire();
    }

    /// Publishes the final history for late subscribers, then serves the
    /// subscriptions that were already queued.
    fn retire(&mut self) {
        let history = std::mem::take(&mut self.history);
        let history = self.archive.get_or_init(|| history);
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Subscribe(subscriber) = command {
                replay(history, &subscriber);
            }
        }
    }

    fn finished(&self) -> bool {
        self.phase.state().is_terminal() && self.link.is_none()
    }

    async fn next_input(&mut self) -> Input {
        let deadline = self.phase.watchdog();
        let accepting = self.accepting_commands;
        let transport = self.link.as_mut().map(|link| &mut link.events);

        // Transport first: a reply that lands together with its deadline wins.
        select! {
            biased;
            event = next_transport_event(transport) => Input::Transport(event),
            _ = expire(deadline) => Input::WatchdogExpired,
            command = self.commands.recv(), if accepting => Input::Command(command),
        }
    }

    fn handle(&mut self, input: Input) {
        match input {
            Input::Command(Some(command)) => self.on_command(command),
            Input::Command(None) => {
                self.accepting_commands = false;
                self.close();
            }
            Input::Transport(Some(event)) => self.on_transport(event),
            Input::Transport(None) => self.on_closed(
                ABNORMAL_CLOSURE,
                "transport ended without a close event".to_string(),
            ),
            Input::WatchdogExpired => self.on_watchdog(),
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Start => self.start(),
            Command::Send(text) => self.send(text),
            Command::Close => self.close(),
            Command::Subscribe(subscriber) => self.subscribe(subscriber),
        }
    }

    fn start(&mut self) {
        if !matches!(self.phase, Phase::Idle) {
            let state = self.phase.state();
            self.emit(SessionEvent::Error {
                error: SessionError::AlreadyStarted { state },
            });
            return;
        }

        let (handle, events) = self.connector.connect(&self.config.url);
        self.link = Some(Link {
            handle,
            events,
            close_requested: false,
        });
        self.transition(Phase::Connecting);
    }

    fn send(&mut self, text: String) {
        if text.trim().is_empty() {
            self.ignored("blank send");
            return;
        }

        if self.link.is_none() || !matches!(self.phase, Phase::Ready) {
            let state = self.phase.state();
            self.emit(SessionEvent::Error {
                error: SessionError::NotReady { state },
            });
            return;
        }

        self.emit(SessionEvent::Message(ChatMessage::user(text.clone())));
        if let Some(link) = self.link.as_ref() {
            link.handle.send(text.clone());
        }
        let pending = PendingRequest::new(text, Instant::now(), self.config.response_timeout);
        self.transition(Phase::AwaitingResponse(pending));
    }

    fn close(&mut self) {
        if matches!(self.phase, Phase::Closing | Phase::Closed | Phase::Failed) {
            self.ignored("close");
            return;
        }

        self.transition(Phase::Closing);
        if self.link.is_some() {
            self.release_transport(NORMAL_CLOSURE, "client closed");
        } else {
            self.transition(Phase::Closed);
        }
    }

    fn subscribe(&mut self, subscriber: mpsc::UnboundedSender<SessionEvent>) {
        if replay(&self.history, &subscriber) {
            self.subscribers.push(subscriber);
        }
    }

    fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => self.on_opened(),
            TransportEvent::Message(frame) => self.on_frame(frame),
            TransportEvent::Error(error) => self.on_transport_error(error),
            TransportEvent::Closed { code, reason } => self.on_closed(code, reason),
        }
    }

    fn on_opened(&mut self) {
        if !matches!(self.phase, Phase::Connecting) {
            self.ignored("opened");
            return;
        }
        let deadline = deadline_after(Instant::now(), self.config.greeting_timeout);
        self.transition(Phase::AwaitingGreeting { deadline });
    }

    fn on_frame(&mut self, frame: Frame) {
        if !self.phase.accepts_frames() {
            self.ignored("message");
            return;
        }

        match decode_frame(frame) {
            Ok(content) => {
                self.emit(SessionEvent::Message(ChatMessage::bot(content)));
                if !matches!(self.phase, Phase::Ready) {
                    self.transition(Phase::Ready);
                }
            }
            Err(error) => self.emit(SessionEvent::Error { error }),
        }
    }

    fn on_transport_error(&mut self, error: TransportError) {
        if !self.phase.is_live() {
            self.ignored("transport error");
            return;
        }
        self.fail(SessionError::Connection {
            detail: error.to_string(),
        });
    }

    fn on_closed(&mut self, code: u16, reason: String) {
        self.link = None;
        self.diagnose(&Diagnostic::TransportClosed {
            code,
            reason: &reason,
        });

        if matches!(self.phase, Phase::Closing) {
            self.transition(Phase::Closed);
        } else if self.phase.is_live() {
            let detail = if reason.is_empty() {
                format!("connection closed (code {code})")
            } else {
                format!("connection closed (code {code}: {reason})")
            };
            self.fail(SessionError::Connection { detail });
        } else {
            self.ignored("closed");
        }
    }

    fn on_watchdog(&mut self) {
        match self.phase {
            Phase::AwaitingGreeting { .. } => {
                let waited = self.config.greeting_timeout;
                self.fail(SessionError::GreetingTimeout { waited });
                self.release_transport(NORMAL_CLOSURE, "no greeting");
            }
            Phase::AwaitingResponse(_) => {
                let waited = self.config.response_timeout;
                self.emit(SessionEvent::Error {
                    error: SessionError::ResponseTimeout { waited },
                });
                match self.config.response_timeout_policy {
                    ResponseTimeoutPolicy::Lenient => self.transition(Phase::Ready),
                    ResponseTimeoutPolicy::Strict => {
                        self.transition(Phase::Failed);
                        self.release_transport(NORMAL_CLOSURE, "response timed out");
                    }
                }
            }
            _ => self.ignored("watchdog"),
        }
    }

    fn fail(&mut self, error: SessionError) {
        self.emit(SessionEvent::Error { error });
        self.transition(Phase::Failed);
    }

    /// Asks the transport to close, at most once per connection.
    fn release_transport(&mut self, code: u16, reason: &str) {
        if let Some(link) = self.link.as_mut() {
            if !link.close_requested {
                link.close_requested = true;
                link.handle.close(Some(code), Some(reason.to_string()));
            }
        }
    }

    fn transition(&mut self, next: Phase) {
        let from = self.phase.state();
        self.phase = next;
        let to = self.phase.state();

        self.diagnose(&Diagnostic::Transition { from, to });
        self.state.send_replace(to);
        self.emit(SessionEvent::State { value: to });
    }

    fn emit(&mut self, event: SessionEvent) {
        self.diagnose(&Diagnostic::Emitted(&event));
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
        self.history.push(event);
    }

    fn ignored(&mut self, input: &'static str) {
        let state = self.phase.state();
        self.diagnose(&Diagnostic::Ignored { input, state });
    }

    fn diagnose(&mut self, diagnostic: &Diagnostic<'_>) {
        if let Some(hook) = self.diagnostics.as_mut() {
            hook(diagnostic);
        }
    }
}

/// Sends `history` to `subscriber`; false once the subscriber is gone.
fn replay(history: &[SessionEvent], subscriber: &mpsc::UnboundedSender<SessionEvent>) -> bool {
    history
        .iter()
        .all(|event| subscriber.send(event.clone()).is_ok())
}

async fn next_transport_event(events: Option<&mut TransportEvents>) -> Option<TransportEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
