mod logging;
mod pidfile;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use dock_agents::AgentCatalog;
use dock_core::{default_state_dir, BridgeConfig, CliOverrides};
use dock_types::AgentKind;

#[derive(Parser, Debug)]
#[command(name = "prompt-dock")]
#[command(about = "Local bridge daemon connecting browser apps to on-machine coding agents")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the bridge in the foreground.
    Start {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        agent: Option<String>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        verbose: bool,
        #[arg(long, default_value_t = false)]
        no_open: bool,
        #[arg(long, env = "PROMPT_DOCK_HUB")]
        hub: Option<String>,
    },
    /// Signal a running daemon to shut down.
    Stop,
    /// Query the running daemon's health endpoint.
    Status,
    /// Tail the daemon's JSONL log.
    Logs {
        #[arg(short = 'n', default_value_t = 50)]
        lines: usize,
        #[arg(short = 'f', default_value_t = false)]
        follow: bool,
    },
    /// Print the effective configuration.
    Config,
    /// Locate an agent binary and probe its version.
    TestAgent { kind: String },
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let state_dir = default_state_dir();

    match cli.command {
        Command::Start {
            port,
            agent,
            config,
            verbose,
            no_open,
            hub,
        } => {
            let _guard = logging::init(&state_dir, verbose)?;
            let config_path = config.unwrap_or_else(|| state_dir.join("config.json"));
            let overrides = CliOverrides { port, agent, hub };
            let config =
                BridgeConfig::load(&config_path, &overrides).context("loading configuration")?;

            if !no_open {
                info!(
                    "pair new apps at http://127.0.0.1:{}/api/pairing/generate",
                    config.port
                );
            }

            let state = dock_server::build_state(config, &state_dir).await?;
            pidfile::write(&state_dir).context("writing pid file")?;
            let result = dock_server::serve(state).await;
            pidfile::remove(&state_dir);
            result?;
        }
        Command::Stop => {
            if pidfile::stop(&state_dir)? {
                println!("stopped");
            } else {
                println!("not running");
                std::process::exit(1);
            }
        }
        Command::Status => {
            let config =
                BridgeConfig::load(&state_dir.join("config.json"), &CliOverrides::default())?;
            let url = format!("http://127.0.0.1:{}/health", config.port);
            match reqwest::get(&url).await {
                Ok(response) => {
                    let body: serde_json::Value = response.json().await?;
                    println!(
                        "running: version={} uptime={}s sessions={}",
                        body["version"].as_str().unwrap_or("?"),
                        body["uptime"].as_u64().unwrap_or(0),
                        body["activeSessions"].as_u64().unwrap_or(0),
                    );
                }
                Err(_) => {
                    println!("not running");
                    std::process::exit(1);
                }
            }
        }
        Command::Logs { lines, follow } => {
            tail_logs(&state_dir, lines, follow).await?;
        }
        Command::Config => {
            let config =
                BridgeConfig::load(&state_dir.join("config.json"), &CliOverrides::default())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Command::TestAgent { kind } => {
            let Some(kind) = AgentKind::parse(&kind) else {
                eprintln!("unknown agent kind: {kind}");
                std::process::exit(1);
            };
            let config = BridgeConfig::load(&state_dir.join("config.json"), &CliOverrides::default())
                .unwrap_or_default();
            let catalog = AgentCatalog::new(config.agents.paths);
            match catalog.locate(kind).await {
                Ok(binary) => {
                    println!("{}: {} ({})", binary.name, binary.version, binary.path);
                }
                Err(error) => {
                    eprintln!("{error}");
                    std::process::exit(1);
                }
            }
        }
        Command::Version => {
            println!("prompt-dock {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

async fn tail_logs(state_dir: &std::path::Path, lines: usize, follow: bool) -> anyhow::Result<()> {
    let Some(path) = logging::latest_log_file(state_dir) else {
        println!("no log files yet");
        return Ok(());
    };

    let content = tokio::fs::read_to_string(&path).await?;
    let tail: Vec<&str> = content.lines().rev().take(lines).collect();
    for line in tail.into_iter().rev() {
        println!("{line}");
    }

    if !follow {
        return Ok(());
    }
    let mut offset = content.len() as u64;
    loop {
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        let metadata = tokio::fs::metadata(&path).await?;
        if metadata.len() > offset {
            use tokio::io::{AsyncReadExt, AsyncSeekExt};
            let mut file = tokio::fs::File::open(&path).await?;
            file.seek(std::io::SeekFrom::Start(offset)).await?;
            let mut fresh = String::new();
            file.read_to_string(&mut fresh).await?;
            print!("{fresh}");
            offset = metadata.len();
        }
    }
}
