use std::{net::SocketAddr, path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use chatbot_session::{
    Sender, Session, SessionConfig, SessionError, SessionEvent, SessionState,
    session::EventFeed, transport::WebSocketConnector,
};
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

const READ_TIMEOUT: Duration = Duration::from_secs(5);
const GREETING: &str = "Hello! I'm your AI assistant. Ask me anything!";

/// Payload shapes seen from different backend versions.
#[derive(Debug, Clone, Copy)]
enum ReplyStyle {
    Json,
    Plain,
}

impl ReplyStyle {
    fn encode(self, text: &str) -> String {
        match self {
            ReplyStyle::Json => serde_json::json!({ "message": text, "model": "granite" }).to_string(),
            ReplyStyle::Plain => text.to_string(),
        }
    }
}

/// Starts a bot that greets every connection and echoes each question.
async fn spawn_bot(style: ReplyStyle) -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_bot_connection(stream, style));
        }
    });
    Ok(addr)
}

async fn serve_bot_connection(stream: TcpStream, style: ReplyStyle) {
    let Ok(mut socket) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    if socket
        .send(Message::Text(style.encode(GREETING)))
        .await
        .is_err()
    {
        return;
    }

    // Keep reading after a close frame so the reply gets flushed.
    while let Some(Ok(frame)) = socket.next().await {
        if let Message::Text(question) = frame {
            let answer = style.encode(&format!("echo: {question}"));
            if socket.send(Message::Text(answer)).await.is_err() {
                break;
            }
        }
    }
}

fn endpoint(addr: SocketAddr) -> Url {
    Url::parse(&format!("ws://{addr}/caton/chatbot")).expect("endpoint url")
}

async fn next(feed: &mut EventFeed) -> Result<SessionEvent> {
    timeout(READ_TIMEOUT, feed.recv())
        .await
        .context("timed out waiting for session event")?
        .context("feed ended unexpectedly")
}

async fn expect_state(feed: &mut EventFeed, expected: SessionState) -> Result<()> {
    match next(feed).await? {
        SessionEvent::State { value } if value == expected => Ok(()),
        other => Err(anyhow!("expected state {expected:?}, got {other:?}")),
    }
}

async fn expect_bot(feed: &mut EventFeed, expected: &str) -> Result<()> {
    match next(feed).await? {
        SessionEvent::Message(message)
            if message.sender() == Sender::Bot && message.content() == expected =>
        {
            Ok(())
        }
        other => Err(anyhow!("expected bot message '{expected}', got {other:?}")),
    }
}

async fn converse_with(style: ReplyStyle) -> Result<()> {
    let addr = spawn_bot(style).await?;
    let session = Session::new(SessionConfig::new(endpoint(addr)), WebSocketConnector::new()).spawn();
    let mut feed = session.subscribe();

    session.start()?;
    expect_state(&mut feed, SessionState::Connecting).await?;
    expect_state(&mut feed, SessionState::AwaitingGreeting).await?;
    expect_bot(&mut feed, GREETING).await?;
    expect_state(&mut feed, SessionState::Ready).await?;

    session.send("What is Infinispan?")?;
    match next(&mut feed).await? {
        SessionEvent::Message(message) => assert_eq!(message.sender(), Sender::User),
        other => return Err(anyhow!("expected user message, got {other:?}")),
    }
    expect_state(&mut feed, SessionState::AwaitingResponse).await?;
    expect_bot(&mut feed, "echo: What is Infinispan?").await?;
    expect_state(&mut feed, SessionState::Ready).await?;

    session.close();
    expect_state(&mut feed, SessionState::Closing).await?;
    expect_state(&mut feed, SessionState::Closed).await?;
    assert_eq!(timeout(READ_TIMEOUT, feed.recv()).await?, None);
    Ok(())
}

#[tokio::test]
async fn session_round_trip_with_json_backend() -> Result<()> {
    converse_with(ReplyStyle::Json).await
}

#[tokio::test]
async fn session_round_trip_with_plain_text_backend() -> Result<()> {
    converse_with(ReplyStyle::Plain).await
}

#[tokio::test]
async fn refused_connection_fails_the_session() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);

    let session = Session::new(SessionConfig::new(endpoint(addr)), WebSocketConnector::new()).spawn();
    let mut feed = session.subscribe();
    session.start()?;

    expect_state(&mut feed, SessionState::Connecting).await?;
    match next(&mut feed).await? {
        SessionEvent::Error {
            error: SessionError::Connection { .. },
        } => {}
        other => return Err(anyhow!("expected connection error, got {other:?}")),
    }
    expect_state(&mut feed, SessionState::Failed).await?;
    assert_eq!(timeout(READ_TIMEOUT, feed.recv()).await?, None);
    Ok(())
}

#[tokio::test]
async fn probe_reports_the_reply() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("chatbot_session");
    let addr = spawn_bot(ReplyStyle::Json).await?;

    let mut cmd = Command::new(binary);
    cmd.arg("probe")
        .arg("--url")
        .arg(endpoint(addr).as_str())
        .arg("--question")
        .arg("Is anyone there?")
        .env("RUST_LOG", "warn")
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let output = timeout(Duration::from_secs(15), cmd.output())
        .await
        .context("probe did not finish in time")??;
    let stdout = String::from_utf8(output.stdout)?;

    assert!(output.status.success(), "probe failed:\n{stdout}");
    assert!(stdout.contains(&format!("<Bot> {GREETING}")));
    assert!(stdout.contains("<You> Is anyone there?"));
    assert!(stdout.contains("<Bot> echo: Is anyone there?"));
    assert!(stdout.contains("*** reply received after"));
    Ok(())
}

#[tokio::test]
async fn probe_fails_when_nobody_listens() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("chatbot_session");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);

    let mut cmd = Command::new(binary);
    cmd.arg("probe")
        .arg("--url")
        .arg(endpoint(addr).as_str())
        .env("RUST_LOG", "off")
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    let status = timeout(Duration::from_secs(15), cmd.status())
        .await
        .context("probe did not finish in time")??;
    assert!(!status.success());
    Ok(())
}

#[tokio::test]
async fn chat_client_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("chatbot_session");
    let addr = spawn_bot(ReplyStyle::Json).await?;

    let mut chat = spawn_chat(binary, addr).await?;

    for expected in [
        "*** connecting".to_string(),
        "*** awaiting greeting".to_string(),
        format!("<Bot> {GREETING}"),
        "*** ready".to_string(),
    ] {
        let line = read_line_expect(&mut chat.stdout, "waiting for greeting").await?;
        assert_eq!(line, expected);
    }

    chat.send_line("hello bot").await?;
    for expected in [
        "<You> hello bot",
        "*** awaiting response",
        "<Bot> echo: hello bot",
        "*** ready",
    ] {
        let line = read_line_expect(&mut chat.stdout, "waiting for reply").await?;
        assert_eq!(line, expected);
    }

    chat.send_line("/quit").await?;
    for expected in ["*** leaving chat", "*** closing", "*** closed"] {
        let line = read_line_expect(&mut chat.stdout, "waiting for shutdown").await?;
        assert_eq!(line, expected);
    }

    let status = timeout(READ_TIMEOUT, chat.child.wait())
        .await
        .context("chat client did not exit")??;
    assert!(status.success(), "chat exited with {status}");
    Ok(())
}

struct ChatProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ChatProcess {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to send line '{line}'"))?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }
}

async fn spawn_chat(binary: &Path, addr: SocketAddr) -> Result<ChatProcess> {
    let mut cmd = Command::new(binary);
    cmd.arg("chat")
        .arg("--url")
        .arg(endpoint(addr).as_str())
        .env("RUST_LOG", "warn")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd.spawn().context("failed to spawn chat client")?;
    let stdin = child.stdin.take().context("chat stdin missing after spawn")?;
    let stdout = child
        .stdout
        .take()
        .context("chat stdout missing after spawn")?;

    Ok(ChatProcess {
        child,
        stdin,
        stdout: BufReader::new(stdout),
    })
}

async fn read_line_expect(reader: &mut BufReader<ChildStdout>, description: &str) -> Result<String> {
    let mut line = String::new();
    let bytes = timeout(READ_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| anyhow!("{description}: timed out waiting for line"))?
        .with_context(|| format!("{description}: failed to read line"))?;
    if bytes == 0 {
        return Err(anyhow!("{description}: stream closed"));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
