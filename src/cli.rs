use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// Calendar server command-line flags. Every field is an override of
/// whatever [`crate::config::Config`] already loaded from its TOML file and
/// environment; a field left unset here keeps the config's own value.
#[derive(Parser)]
#[command(name = "ots-calendard")]
#[command(about = "OpenTimestamps calendar server", long_about = None)]
#[command(version)]
pub struct ServerCli {
    /// Path to a TOML configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Directory holding the calendar's journal and store.
    #[arg(long)]
    pub datadir: Option<PathBuf>,

    /// Address the HTTP server binds to.
    #[arg(long)]
    pub bind: Option<SocketAddr>,

    /// Bitcoin node RPC endpoint, e.g. `http://127.0.0.1:8332`.
    #[arg(long)]
    pub bitcoin_rpc_url: Option<String>,

    /// Bitcoin node RPC username.
    #[arg(long)]
    pub bitcoin_rpc_user: Option<String>,

    /// Bitcoin node RPC password.
    #[arg(long)]
    pub bitcoin_rpc_password: Option<String>,

    /// This calendar's own URI, embedded in `Pending` attestations. Only
    /// takes effect the first time `datadir` is initialized.
    #[arg(long)]
    pub uri: Option<String>,

    /// Run as a read-only mirror of a remote calendar instead of running
    /// this process's own aggregator and stamper. May be given multiple
    /// times to mirror more than one remote.
    #[arg(long = "mirror-of")]
    pub mirror_of: Vec<String>,
}
