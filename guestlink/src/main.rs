use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use guestlink::protocol::PowerRequest;
use guestlink::{sha256_hex, AgentAddress, AgentClient, ClientConfig};

#[derive(Parser)]
#[command(name = "guestlink", about = "Talk to a guestlink agent from the host")]
struct Cli {
    /// Agent address: unix:/path/to/socket or vsock:CID[:PORT].
    #[arg(long, short)]
    address: AgentAddress,
    /// Client config file (TOML).
    #[arg(long, short)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the agent answers.
    Ping,
    /// Run a shell command in the guest.
    Exec {
        command: String,
        /// Seconds before the agent kills the command.
        #[arg(long, default_value = "60")]
        timeout: u64,
    },
    /// Show the agent's version and capabilities.
    Caps,
    /// List a directory.
    Ls { path: String },
    /// Print a file to stdout.
    Cat { path: String },
    /// Copy a host file into the guest.
    Put {
        local: PathBuf,
        remote: String,
        #[arg(long, value_parser = parse_mode)]
        mode: Option<u32>,
    },
    /// Freeze filesystems for a snapshot.
    Quiesce {
        mount_points: Vec<String>,
        /// Seconds until the agent thaws on its own.
        #[arg(long, default_value = "60")]
        auto_thaw: u64,
    },
    /// Thaw filesystems frozen by `quiesce`.
    Thaw {
        #[arg(long)]
        token: Option<String>,
    },
    /// Push a new agent binary.
    Update { binary: PathBuf, version: String },
    /// Power the guest off.
    Shutdown {
        #[arg(long, default_value = "0")]
        delay: u64,
        #[arg(long)]
        force: bool,
    },
    /// Print unsolicited events as JSON lines until interrupted.
    Watch,
}

fn parse_mode(s: &str) -> std::result::Result<u32, String> {
    u32::from_str_radix(s.trim_start_matches("0o"), 8).map_err(|e| format!("invalid octal mode {s}: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::default(),
    };
    let client = AgentClient::connect(&cli.address, config)
        .await
        .with_context(|| format!("connecting to {}", cli.address))?;

    match cli.command {
        Commands::Ping => {
            let pong = client.ping().await?;
            println!("agent {} up {}s", pong.version, pong.uptime_secs);
        }
        Commands::Exec { command, timeout } => {
            let result = client
                .execute(&command, Duration::from_secs(timeout), None)
                .await?;
            print!("{}", result.stdout);
            eprint!("{}", result.stderr);
            if result.timed_out {
                anyhow::bail!("command timed out after {timeout}s");
            }
            std::process::exit(result.exit_code.unwrap_or(1));
        }
        Commands::Caps => {
            let caps = client.get_capabilities().await?;
            println!("{}", serde_json::to_string_pretty(&caps)?);
        }
        Commands::Ls { path } => {
            for entry in client.list_directory_all(&path).await? {
                println!("{} {:>12} {}", entry.permissions, entry.size, entry.name);
            }
        }
        Commands::Cat { path } => {
            use std::io::Write;
            let data = client.read_file(&path).await?;
            std::io::stdout().write_all(&data)?;
        }
        Commands::Put { local, remote, mode } => {
            let data = std::fs::read(&local).with_context(|| format!("reading {}", local.display()))?;
            let info = client.write_file(&remote, &data, mode).await?;
            println!("{} {} bytes {}", info.path, info.size, info.permissions);
        }
        Commands::Quiesce {
            mount_points,
            auto_thaw,
        } => {
            let result = client
                .quiesce(mount_points, Duration::from_secs(auto_thaw))
                .await?;
            println!("token {}", result.token);
            for mp in &result.frozen {
                println!("frozen {mp}");
            }
            println!("auto thaw at {}", result.auto_thaw_at);
        }
        Commands::Thaw { token } => {
            let result = client.thaw(token).await?;
            println!("thawed {} filesystems after {} ms", result.thawed.len(), result.frozen_ms);
        }
        Commands::Update { binary, version } => {
            let data = std::fs::read(&binary).with_context(|| format!("reading {}", binary.display()))?;
            let digest = sha256_hex(&data);
            for state in client.push_update(&data, &version, &digest).await? {
                println!("{}", state.name());
            }
        }
        Commands::Shutdown { delay, force } => {
            client
                .shutdown(PowerRequest {
                    delay_secs: delay,
                    message: None,
                    force,
                })
                .await?;
            println!("shutdown accepted");
        }
        Commands::Watch => {
            let mut events = client.subscribe_events();
            while let Some(event) = events.recv().await {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
    }
    Ok(())
}
