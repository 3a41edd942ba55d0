//! FxDK dev server supervisor
//!
//! Reads control commands from stdin and writes events to stdout, one JSON object per line.
//! Logs go to stderr.

mod args;

use anyhow::{Result, bail};
use args::Cli;
use clap::Parser;
use fxdk_server::{
    ControlBus, ExecutableResolver, FixedExecutable, ResourceLinker, Supervisor,
    SupervisorConfig, VersionedInstall, transport,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn build_config(cli: &Cli) -> SupervisorConfig {
    let mut config = SupervisorConfig::default();
    if let Some(bridge) = &cli.bridge_resource {
        config.bridge_resource = bridge.clone();
    }
    if let Some(name) = &cli.ipc_name {
        config.ipc_name = name.clone();
    }
    if let Some(endpoint) = &cli.endpoint {
        config.endpoint = endpoint.clone();
    }
    if let Some(max_clients) = cli.max_clients {
        config.max_clients = max_clients;
    }
    config.onesync = !cli.no_onesync;
    config.lan = !cli.no_lan;
    config
}

fn build_resolver(cli: &Cli) -> Result<Arc<dyn ExecutableResolver>> {
    if let Some(executable) = &cli.executable {
        return Ok(Arc::new(FixedExecutable(executable.clone())));
    }
    match (&cli.install_root, &cli.server_version) {
        (Some(root), Some(version)) => Ok(Arc::new(VersionedInstall::new(root, version))),
        _ => bail!("Either --executable or --install-root with --server-version is required"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = build_config(&cli);
    let resolver = build_resolver(&cli)?;
    if resolver.resolve().is_none() {
        warn!("Server executable not found yet; start requests are ignored until it exists");
    }

    let linker = ResourceLinker::from_config(&config);
    let supervisor = Arc::new(Supervisor::new(config, ControlBus::new(), linker, resolver)?);
    info!("FxDK supervisor ready");

    let teardown = supervisor.spawn_teardown_hook();
    tokio::select! {
        result = transport::stdio::run(supervisor.clone()) => {
            if let Err(e) = result {
                warn!("Control surface stopped: {}", e);
            }
        }
        _ = teardown => {}
    }

    supervisor.shutdown().await;
    info!("FxDK supervisor stopped");
    Ok(())
}
