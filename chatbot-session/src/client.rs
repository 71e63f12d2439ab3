use anyhow::{Context, Result, bail};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin},
    select,
};
use tracing::warn;

use crate::{
    cli::{ChatArgs, SessionArgs},
    diagnostics::tracing_hook,
    error::SessionError,
    session::{EventFeed, Session, SessionHandle},
    state::{SessionEvent, SessionState},
};

/// Spawns a WebSocket-backed session configured from the command line.
pub fn spawn_session(args: &SessionArgs) -> SessionHandle {
    Session::new(args.session_config(), args.connector())
        .with_diagnostics(tracing_hook())
        .spawn()
}

pub async fn run(args: ChatArgs) -> Result<()> {
    let session = spawn_session(&args.session);
    let mut feed = session.subscribe();
    session.start().context("session ended before it started")?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let last_state = run_client_loop(&session, &mut feed, &mut stdin, args.session.json).await?;

    if last_state == SessionState::Failed {
        bail!("chat session failed");
    }
    Ok(())
}

/// Multiplexes stdin and session events until the session's feed ends.
async fn run_client_loop(
    session: &SessionHandle,
    feed: &mut EventFeed,
    stdin: &mut Lines<BufReader<Stdin>>,
    json: bool,
) -> Result<SessionState> {
    let mut last_state = session.state();
    let mut stdin_open = true;

    loop {
        select! {
            event = feed.recv() => {
                let Some(event) = event else {
                    break;
                };
                if let SessionEvent::State { value } = &event {
                    last_state = *value;
                }
                render_event(&event, json).await?;
            }
            line = stdin.next_line(), if stdin_open => {
                if !handle_stdin_input(line, session).await? {
                    stdin_open = false;
                    session.close();
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                session.close();
            }
        }
    }

    Ok(last_state)
}

async fn handle_stdin_input(line: io::Result<Option<String>>, session: &SessionHandle) -> Result<bool> {
    let Some(line) = line? else {
        return Ok(false);
    };

    let text = line.trim_end();
    if text.trim().is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    match session.send(text) {
        Ok(()) => Ok(true),
        Err(SessionError::Terminated) => Ok(false),
        Err(error) => Err(error.into()),
    }
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

pub(crate) async fn render_event(event: &SessionEvent, json: bool) -> io::Result<()> {
    if json {
        let line = serde_json::to_string(event).map_err(io::Error::other)?;
        return write_stdout(&line).await;
    }

    match event {
        SessionEvent::Message(message) => {
            write_stdout(&format!("<{}> {}", message.sender(), message.content())).await
        }
        SessionEvent::State { value } => write_stdout(&format!("*** {value}")).await,
        SessionEvent::Error { error } => write_stderr(&format!("!!! {error}")).await,
    }
}

pub(crate) async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

pub(crate) async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
