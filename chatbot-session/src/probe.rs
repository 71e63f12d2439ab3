//! Patient smoke test against a live chatbot endpoint.
//!
//! Waits for the greeting, asks one question and keeps the operator informed
//! while the backend works through a slow inference. Exits with an error on
//! anything but a reply.

use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tokio::{
    select,
    time::{Instant, MissedTickBehavior, interval_at},
};

use crate::{
    cli::ProbeArgs,
    client::{render_event, spawn_session, write_stdout},
    error::ErrorCategory,
    message::Sender,
    session::{EventFeed, SessionHandle},
    state::SessionEvent,
};

#[derive(Debug)]
struct Reply {
    content: String,
    elapsed: Duration,
}

pub async fn run(args: ProbeArgs) -> Result<()> {
    let session = spawn_session(&args.session);
    let mut feed = session.subscribe();
    session.start().context("session ended before it started")?;
    write_stdout(&format!("*** probing {}", args.session.url)).await?;

    let outcome = await_reply(&session, &mut feed, &args).await;

    session.close();
    drain(&mut feed, args.session.json).await?;

    let reply = outcome?;
    write_stdout(&format!(
        "*** reply received after {:.1}s ({} chars)",
        reply.elapsed.as_secs_f64(),
        reply.content.chars().count()
    ))
    .await?;
    Ok(())
}

async fn await_reply(session: &SessionHandle, feed: &mut EventFeed, args: &ProbeArgs) -> Result<Reply> {
    let reminder = Duration::from_secs(args.reminder_secs);
    let mut reminders = interval_at(Instant::now() + reminder, reminder);
    reminders.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut asked_at: Option<Instant> = None;

    loop {
        select! {
            event = feed.recv() => {
                let event = event.ok_or_else(|| anyhow!("session ended before the bot replied"))?;
                render_event(&event, args.session.json).await?;

                match event {
                    SessionEvent::Message(message) if message.sender() == Sender::Bot => {
                        if let Some(asked_at) = asked_at {
                            return Ok(Reply {
                                content: message.content().to_string(),
                                elapsed: asked_at.elapsed(),
                            });
                        }
                        session.send(args.question.clone())?;
                        asked_at = Some(Instant::now());
                        reminders.reset();
                        write_stdout("*** greeting received, question sent").await?;
                    }
                    SessionEvent::Error { error } => match error.category() {
                        ErrorCategory::MalformedPayload => {}
                        _ => bail!("probe failed: {error}"),
                    },
                    SessionEvent::State { value } if value.is_terminal() => {
                        bail!("session {value} before the bot replied");
                    }
                    _ => {}
                }
            }
            _ = reminders.tick(), if asked_at.is_some() => {
                let waited = asked_at.map(|at| at.elapsed()).unwrap_or_default();
                write_stdout(&format!("*** still waiting for a reply ({}s elapsed)", waited.as_secs())).await?;
            }
        }
    }
}

/// Prints whatever the session publishes while it shuts down.
async fn drain(feed: &mut EventFeed, json: bool) -> Result<()> {
    while let Some(event) = feed.recv().await {
        render_event(&event, json).await?;
    }
    Ok(())
}
