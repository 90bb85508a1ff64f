//! Relay Tunnel Client
//!
//! Logs a device in to the cloud relay and keeps its tunnels paired:
//! - Requests pairing for every configured tunnel until the relay assigns one
//! - Answers tunnel requests from peers for the allowed local ports
//! - Re-pairs after the relay reports a peer offline or the connection drops
//!
//! The same binary runs the one-shot account administration requests
//! (`traffic`, `account-set`, `account-exists`).

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use signal_hook::consts::{SIGINT, SIGTERM};

use relay_session::{Action, Config, StopReason};

mod client;
mod forward;

use client::Client;

#[derive(Parser, Debug)]
#[command(name = "tunnel-client")]
#[command(version, about = "Relay tunnel client - device pairing and tunnel negotiation")]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(short, long, default_value = "tunnel-client.json")]
    config: PathBuf,

    /// Relay host, overriding the configuration file.
    #[arg(long)]
    host: Option<String>,

    /// Relay port, overriding the configuration file.
    #[arg(long)]
    port: Option<u16>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Keep tunnels paired until interrupted (default).
    Run,
    /// Print per-device traffic counters for the account.
    Traffic,
    /// Create or update an account.
    AccountSet {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Ask whether an account exists.
    AccountExists {
        #[arg(long)]
        email: String,
    },
}

impl Command {
    fn into_action(self) -> Action {
        match self {
            Command::Run => Action::Tunnels,
            Command::Traffic => Action::TrafficGet,
            Command::AccountSet { email, password } => Action::AccountSet { email, password },
            Command::AccountExists { email } => Action::AccountExists { email },
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let mut config = Config::load(&args.config)?;
    if let Some(host) = args.host {
        config.upstream.host = host;
    }
    if let Some(port) = args.port {
        config.upstream.port = port;
    }
    config.validate()?;

    let action = args.command.map_or(Action::Tunnels, Command::into_action);

    log::info!("Relay tunnel client starting...");
    log::info!("  Relay:   {}:{}", config.upstream.host, config.upstream.port);
    log::info!(
        "  Device:  {}@{}",
        config.account.username,
        config.account.device
    );
    log::info!("  Mode:    {}", config.mode());
    log::info!("  Tunnels: {}", config.tunnels.len());
    log::info!("  Allowed: {:?}", config.allowed);

    // Handlers only set the flag; the loop does the shutdown work
    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&shutdown))?;

    let mut client = Client::new(&config, action, shutdown)?;
    match client.run()? {
        StopReason::Requested => {
            log::info!("Relay tunnel client stopped");
            Ok(())
        }
        StopReason::ActionComplete(status) => {
            log::debug!("Request finished: {}", status);
            Ok(())
        }
        StopReason::LoginRejected(status) => Err(format!("login rejected: {}", status).into()),
        StopReason::ActionFailed(reason) => Err(format!("request failed: {}", reason).into()),
    }
}
