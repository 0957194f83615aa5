//! Yu Zhong CLI
//!
//! Runs the engine behind a console transport: every stdin line is a message
//! in an always-active local channel.

use clap::Parser;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use yuzhong::{AdminCommand, Engine, InboundMessage, YuzhongConfig};

const CONSOLE_CHANNEL: &str = "console";

/// Yu Zhong - stateful chat agent
#[derive(Parser, Debug)]
#[command(name = "yuzhong")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// State directory (defaults to $YUZHONG_HOME or ~/.yuzhong)
    #[arg(long)]
    home: Option<PathBuf>,

    /// Config file (defaults to <home>/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Verbose output: debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Display name used for console messages
    #[arg(long, default_value = "Traveler")]
    user: String,

    /// Scope (server id) for console messages; omit for direct-message scope
    #[arg(long)]
    scope: Option<String>,
}

/// A parsed console line
#[derive(Debug, PartialEq, Eq)]
enum ConsoleInput {
    Chat(String),
    Admin(AdminCommand),
    Patch,
    Search(String),
    Greet(String),
}

fn parse_line(line: &str) -> Option<ConsoleInput> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let input = match line.split_once(char::is_whitespace) {
        Some(("/search", query)) => ConsoleInput::Search(query.trim().to_string()),
        Some(("/greet", name)) => ConsoleInput::Greet(name.trim().to_string()),
        _ => match line {
            "/arise" => ConsoleInput::Admin(AdminCommand::Activate),
            "/stop" => ConsoleInput::Admin(AdminCommand::Deactivate),
            "/reset" => ConsoleInput::Admin(AdminCommand::ResetScope),
            "/forget" => ConsoleInput::Admin(AdminCommand::Reset),
            "/patch" => ConsoleInput::Patch,
            "/search" => ConsoleInput::Search(String::new()),
            _ => ConsoleInput::Chat(line.to_string()),
        },
    };
    Some(input)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let config = YuzhongConfig::load(cli.home.clone(), cli.config.clone()).await?;
    info!("Starting Yu Zhong");
    info!("Home: {:?}", config.home);

    let flush_interval = config.flush_interval;
    let engine = Engine::from_config(config).await?;
    let flusher = engine.memory().clone().spawn_periodic_flush(flush_interval);

    // Console channel is always active
    engine.activation().activate(CONSOLE_CHANNEL).await;

    let (line_tx, mut line_rx) = mpsc::channel::<String>(32);
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if line_tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    eprintln!("Error reading stdin: {}", e);
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            line = line_rx.recv() => {
                let Some(line) = line else { break };
                let Some(input) = parse_line(&line) else { continue };
                if let Some(reply) = handle(&engine, &cli, input).await {
                    if let Err(e) = writeln!(io::stdout(), "{}", reply) {
                        error!("Error writing stdout: {}", e);
                        break;
                    }
                    let _ = io::stdout().flush();
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    flusher.abort();
    engine.shutdown().await;
    info!("Yu Zhong shutting down...");
    Ok(())
}

async fn handle(engine: &Engine, cli: &Cli, input: ConsoleInput) -> Option<String> {
    let user_id = cli.user.to_lowercase();
    let message = |text: String| InboundMessage {
        scope_id: cli.scope.clone(),
        channel_id: CONSOLE_CHANNEL.to_string(),
        user_id: user_id.clone(),
        display_name: cli.user.clone(),
        text,
        is_administrator: true,
        mentions_agent: false,
        has_attachments: false,
    };

    match input {
        ConsoleInput::Chat(text) => engine.on_inbound_message(&message(text)).await,
        ConsoleInput::Admin(command) => Some(
            engine
                .on_admin_command(command, CONSOLE_CHANNEL, cli.scope.as_deref(), &user_id, true)
                .await,
        ),
        ConsoleInput::Patch => Some(engine.patch_summary().await),
        ConsoleInput::Search(query) => Some(engine.search(&message(String::new()), &query).await),
        ConsoleInput::Greet(name) => engine.greet(&name).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        assert_eq!(parse_line("   "), None);
        assert_eq!(parse_line("hello there"), Some(ConsoleInput::Chat("hello there".into())));
        assert_eq!(parse_line("/arise"), Some(ConsoleInput::Admin(AdminCommand::Activate)));
        assert_eq!(parse_line("/reset"), Some(ConsoleInput::Admin(AdminCommand::ResetScope)));
        assert_eq!(parse_line("/patch"), Some(ConsoleInput::Patch));
        assert_eq!(
            parse_line("/search  best  jungler "),
            Some(ConsoleInput::Search("best  jungler".into()))
        );
        assert_eq!(parse_line("/greet Layla"), Some(ConsoleInput::Greet("Layla".into())));
        assert_eq!(
            parse_line("!imagine a dragon"),
            Some(ConsoleInput::Chat("!imagine a dragon".into()))
        );
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::parse_from(["yuzhong", "--user", "Kai", "--scope", "42", "-v"]);
        assert_eq!(cli.user, "Kai");
        assert_eq!(cli.scope.as_deref(), Some("42"));
        assert!(cli.verbose);
    }
}
