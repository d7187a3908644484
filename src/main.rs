//! Terminal chat shell.
//!
//! ```bash
//! # interactive
//! cargo run
//!
//! # single message
//! cargo run -- --prompt "What is the capital of France?"
//! ```
//!
//! Reads `API_KEY` and optionally `BASE_URL` from the environment or a
//! `.env` file. Set `RUST_LOG=debug` for request logs on stderr.

use std::io;

use agent_shell::cli::Shell;
use agent_shell::tui::{Console, Theme, Tui};
use agent_shell::Agent;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "agent-shell", about = "Chat with an LLM from the terminal")]
struct Cli {
    /// Send a single message and exit
    #[arg(long)]
    prompt: Option<String>,

    /// Print raw response text instead of rendered markdown
    #[arg(long)]
    no_markdown: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let agent = Agent::from_env()?;
    let tui = Tui::new(Console::stdout(Theme::default())).with_markdown(!cli.no_markdown);
    let shell = Shell::new(agent, tui);

    match cli.prompt {
        Some(prompt) => {
            shell.run_single(&prompt).await?;
        }
        None => {
            shell.run_interactive(io::stdin().lock()).await?;
        }
    }

    Ok(())
}
