use anyhow::Result;
use clap::Parser;

use chatbot_session::{
    cli::{Cli, Command},
    client, probe,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Chat output owns stdout; logs go to stderr.
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Chat(args) => client::run(args).await?,
        Command::Probe(args) => probe::run(args).await?,
    }

    Ok(())
}
