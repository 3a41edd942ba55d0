use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "fxdk-supervisor")]
#[command(version)]
#[command(about = "Local FXServer supervisor for FxDK projects", long_about = None)]
pub(crate) struct Cli {
    /// Server executable to launch. Takes precedence over --install-root.
    #[arg(long, env = "FXDK_SERVER_EXECUTABLE")]
    pub executable: Option<PathBuf>,

    /// Root of the versioned server installs (<root>/<version>/FXServer)
    #[arg(long, env = "FXDK_INSTALL_ROOT", requires = "server_version")]
    pub install_root: Option<PathBuf>,

    /// Server version to launch from --install-root
    #[arg(long, env = "FXDK_SERVER_VERSION")]
    pub server_version: Option<String>,

    /// Directory of the bridge resource linked into every server
    #[arg(long, env = "FXDK_BRIDGE_RESOURCE")]
    pub bridge_resource: Option<PathBuf>,

    /// Local socket name the bridge resource connects to
    #[arg(long, env = "FXDK_IPC_NAME")]
    pub ipc_name: Option<String>,

    /// TCP and UDP endpoint for the server (default: 127.0.0.1:30120)
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Client limit (default: 48)
    #[arg(long)]
    pub max_clients: Option<u32>,

    /// Disable OneSync
    #[arg(long)]
    pub no_onesync: bool,

    /// Disable LAN mode
    #[arg(long)]
    pub no_lan: bool,

    /// Log filter, overridden by RUST_LOG (e.g. info, fxdk_server=debug)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}
