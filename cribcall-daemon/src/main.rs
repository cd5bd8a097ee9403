//! Daemon entry point

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use cribcall_daemon::{DaemonConfig, DaemonEvent, MonitorServer, NoopPushSender};
use cribcall_protocol::{Identity, MemoryTrustStore};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cribcalld", about = "CribCall monitor daemon", version)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "cribcall.toml")]
    config: PathBuf,

    /// Override the monitor name from the config
    #[arg(long)]
    name: Option<String>,

    /// Stable device id; a random one is generated when omitted
    #[arg(long)]
    device_id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut config = DaemonConfig::load(&args.config)?;
    if let Some(name) = args.name {
        config.monitor_name = name;
    }

    let device_id = args
        .device_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let identity = Arc::new(Identity::generate(&device_id)?);
    info!(
        device_id = %device_id,
        fingerprint = %identity.fingerprint(),
        "monitor identity ready"
    );

    // Trusted peers and subscriptions are handed in by the persistence
    // collaborator; standalone runs start empty.
    let trust = Arc::new(MemoryTrustStore::new());
    let push = Arc::new(NoopPushSender);

    let server = MonitorServer::start(config, identity, trust, push).await?;

    let mut events = server.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                DaemonEvent::PairingCode {
                    device_name, code, ..
                } => {
                    info!(remote = %device_name, code = %code, "confirm this code on both devices");
                }
                DaemonEvent::ChannelDown {
                    fingerprint,
                    failure: Some(failure),
                    ..
                } => {
                    warn!(peer = %fingerprint, "channel failed: {failure}");
                }
                other => {
                    info!(?other, "daemon event");
                }
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.shutdown().await;
    Ok(())
}
