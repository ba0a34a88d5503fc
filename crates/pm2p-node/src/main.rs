use anyhow::{Context, Result};
use clap::Parser;
use pm2p_node::config::{NodeConfig, Overrides, prepare_state_dir, resolve_state_dir};
use pm2p_node::console::{self, Console};
use pm2p_node::handler::NodeState;
use pm2p_node::manager::ConnectionManager;
use pm2p_node::observer::EventObserver;
use pm2p_store::{BackendKind, MessageStore};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about = "PM peer-to-peer messaging node")]
struct Args {
    /// Address to listen on (default: 0.0.0.0:1123).
    #[arg(long)]
    listen: Option<String>,

    /// Identifier announced on outgoing connections.
    #[arg(long)]
    identifier: Option<String>,

    /// State directory for node data (default: $PM2P_STATE_DIR, then
    /// ~/.local/state/pm2p).
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Message store backend: log or sqlite.
    #[arg(long)]
    backend: Option<BackendKind>,

    /// Drop a connection after this many seconds without a line.
    #[arg(long)]
    idle_timeout_secs: Option<u64>,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            listen: self.listen.clone(),
            identifier: self.identifier.clone(),
            backend: self.backend,
            idle_timeout_secs: self.idle_timeout_secs,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pm2p_node=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let state_dir = resolve_state_dir(args.state_dir.clone())?;
    prepare_state_dir(&state_dir)?;

    let mut config = NodeConfig::load(&state_dir)?;
    config.apply(args.overrides())?;

    let store = MessageStore::open(config.backend.open(&state_dir)?)?;
    tracing::info!(
        state_dir = %state_dir.display(),
        backend = %config.backend,
        messages = store.len(),
        "message store ready"
    );

    let observer = Arc::new(EventObserver::default());
    let events = observer.subscribe();
    let state = NodeState::new(store, observer, config.session_settings());
    let manager = ConnectionManager::bind(state.clone(), config.listen.as_str()).await?;

    tokio::spawn(console::print_events(events));
    let console = Console::new(manager.clone(), state, config.identifier.clone());

    tokio::select! {
        result = console::run(console, tokio::io::stdin()) => {
            result.context("console failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
    }

    manager.shutdown();
    tracing::info!("pm2p-node shut down");
    Ok(())
}
