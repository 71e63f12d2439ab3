use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use url::Url;

use crate::{
    config::{
        DEFAULT_GREETING_TIMEOUT, DEFAULT_RESPONSE_TIMEOUT, DEFAULT_URL, ResponseTimeoutPolicy,
        SessionConfig, parse_endpoint,
    },
    transport::{DEFAULT_CONNECT_TIMEOUT, WebSocketConnector},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Chat with the bot interactively from the terminal.
    Chat(ChatArgs),
    /// Ask one question and wait patiently for the answer.
    Probe(ProbeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct SessionArgs {
    /// WebSocket endpoint of the chatbot.
    #[arg(long, env = "CHATBOT_URL", default_value = DEFAULT_URL, value_parser = parse_endpoint)]
    pub url: Url,

    /// Seconds to wait for the bot's greeting after connecting.
    #[arg(long, env = "CHATBOT_GREETING_TIMEOUT_SECS", default_value_t = DEFAULT_GREETING_TIMEOUT.as_secs())]
    pub greeting_timeout_secs: u64,

    /// Seconds to wait for each reply. Slow inference can take minutes.
    #[arg(long, env = "CHATBOT_RESPONSE_TIMEOUT_SECS", default_value_t = DEFAULT_RESPONSE_TIMEOUT.as_secs())]
    pub response_timeout_secs: u64,

    /// Whether a reply timeout keeps the connection (lenient) or fails it (strict).
    #[arg(long, value_enum, default_value_t = ResponseTimeoutPolicy::Lenient)]
    pub timeout_policy: ResponseTimeoutPolicy,

    /// Seconds allowed for the WebSocket handshake. 0 waits indefinitely.
    #[arg(long, default_value_t = DEFAULT_CONNECT_TIMEOUT.as_secs())]
    pub connect_timeout_secs: u64,

    /// Print every session event as a JSON line instead of chat text.
    #[arg(long)]
    pub json: bool,
}

impl SessionArgs {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::new(self.url.clone())
            .with_greeting_timeout(Duration::from_secs(self.greeting_timeout_secs))
            .with_response_timeout(Duration::from_secs(self.response_timeout_secs))
            .with_response_timeout_policy(self.timeout_policy)
    }

    pub fn connector(&self) -> WebSocketConnector {
        let connect_timeout =
            (self.connect_timeout_secs > 0).then(|| Duration::from_secs(self.connect_timeout_secs));
        WebSocketConnector::new().with_connect_timeout(connect_timeout)
    }
}

#[derive(Args, Debug, Clone)]
pub struct ChatArgs {
    #[command(flatten)]
    pub session: SessionArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ProbeArgs {
    #[command(flatten)]
    pub session: SessionArgs,

    /// Question sent once the greeting arrives.
    #[arg(long, default_value = "What is Infinispan?")]
    pub question: String,

    /// Seconds between "still waiting" notices while the reply is pending.
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..=86_400))]
    pub reminder_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_defaults_follow_session_defaults() {
        let cli = Cli::try_parse_from(["chatbot_session", "probe"]).expect("parse");
        let Command::Probe(args) = cli.command else {
            panic!("expected probe command");
        };
        let config = args.session.session_config();
        assert_eq!(config.response_timeout, DEFAULT_RESPONSE_TIMEOUT);
        assert_eq!(config.response_timeout_policy, ResponseTimeoutPolicy::Lenient);
        assert_eq!(args.question, "What is Infinispan?");
    }

    #[test]
    fn strict_policy_and_custom_url() {
        let cli = Cli::try_parse_from([
            "chatbot_session",
            "chat",
            "--url",
            "ws://127.0.0.1:9000/app/chatbot",
            "--timeout-policy",
            "strict",
        ])
        .expect("parse");
        let Command::Chat(args) = cli.command else {
            panic!("expected chat command");
        };
        assert_eq!(args.session.url.port(), Some(9000));
        assert_eq!(args.session.timeout_policy, ResponseTimeoutPolicy::Strict);
    }

    #[test]
    fn non_websocket_url_is_rejected() {
        let result = Cli::try_parse_from(["chatbot_session", "chat", "--url", "http://localhost/"]);
        assert!(result.is_err());
    }

    #[test]
    fn reminder_interval_must_be_a_sane_period() {
        for secs in ["0", "18446744073709551615"] {
            let result = Cli::try_parse_from(["chatbot_session", "probe", "--reminder-secs", secs]);
            assert!(result.is_err(), "accepted --reminder-secs {secs}");
        }
    }

    #[test]
    fn huge_session_timeouts_are_accepted() {
        let cli = Cli::try_parse_from([
            "chatbot_session",
            "chat",
            "--greeting-timeout-secs",
            "18446744073709551615",
            "--response-timeout-secs",
            "18446744073709551615",
        ])
        .expect("parse");
        let Command::Chat(args) = cli.command else {
            panic!("expected chat command");
        };
        let config = args.session.session_config();
        assert_eq!(config.greeting_timeout, Duration::from_secs(u64::MAX));
        assert_eq!(config.response_timeout, Duration::from_secs(u64::MAX));
    }
}
