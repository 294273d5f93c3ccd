//! dockfleet - list Docker containers across the hosts of an ssh config
//! and tunnel their ports to this machine.

use clap::Parser;
use dockfleet::config::{
    default_ssh_config, expand_tilde, Config, InventoryMode, TunnelSelection, TunnelTarget,
    DEFAULT_REMOTE_SOCKET,
};
use dockfleet::errors::{display_chain, Result};
use dockfleet::registry::{RegistryOptions, SshConfigRegistry};
use dockfleet::render::TablePresenter;
use dockfleet::session::{Credentials, SshConnector};
use dockfleet::PollLoop;
use log::{error, info, warn};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Inventory Docker containers on every host of an ssh config
#[derive(Parser, Debug)]
#[command(name = "dockfleet")]
#[command(version)]
struct Args {
    /// Private key used to authenticate
    #[arg(short, long, env = "DOCKFLEET_KEY")]
    key: Option<PathBuf>,

    /// Passphrase of the private key
    #[arg(long, env = "DOCKFLEET_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,

    /// Do not fall back to the ssh agent
    #[arg(long, env = "DOCKFLEET_NO_AGENT")]
    no_agent: bool,

    /// ssh client config listing the hosts [default: ~/.ssh/config]
    #[arg(short, long, env = "DOCKFLEET_CONFIG")]
    config: Option<PathBuf>,

    /// Users whose hosts are inventoried
    #[arg(short, long = "user", env = "DOCKFLEET_USERS", value_delimiter = ',', default_value = "root")]
    users: Vec<String>,

    /// Host aliases ending with this marker are ignored
    #[arg(long, env = "DOCKFLEET_EXCLUDE_MARKER", default_value = "_")]
    exclude_marker: String,

    /// List stopped containers too
    #[arg(short, long, env = "DOCKFLEET_ALL")]
    all: bool,

    /// Tunnel every container with a connectable port
    #[arg(long, env = "DOCKFLEET_TUNNEL_ALL", conflicts_with_all = ["tunnel", "tunnel_file"])]
    tunnel_all: bool,

    /// Tunnel the named containers
    #[arg(short, long, env = "DOCKFLEET_TUNNEL", value_delimiter = ',', conflicts_with = "tunnel_file")]
    tunnel: Vec<String>,

    /// File of container names to tunnel, one per line
    #[arg(long, env = "DOCKFLEET_TUNNEL_FILE")]
    tunnel_file: Option<PathBuf>,

    /// Connect tunnels to the published or the container network address
    #[arg(long, env = "DOCKFLEET_TUNNEL_TARGET", default_value = "public")]
    tunnel_target: TunnelTarget,

    /// Query the Docker API over a forwarded socket, or run `docker ps`
    #[arg(short, long, env = "DOCKFLEET_MODE", default_value = "socket")]
    mode: InventoryMode,

    /// Seconds between refreshes
    #[arg(short, long, env = "DOCKFLEET_INTERVAL", default_value = "10")]
    interval: u64,

    /// Seconds allowed for all hosts to connect
    #[arg(long, env = "DOCKFLEET_CONNECT_TIMEOUT", default_value = "10")]
    connect_timeout: u64,

    /// Seconds allowed for one round of container listings
    #[arg(long, env = "DOCKFLEET_FETCH_TIMEOUT", default_value = "10")]
    fetch_timeout: u64,

    /// Seconds allowed to open a forward
    #[arg(long, env = "DOCKFLEET_FORWARD_TIMEOUT", default_value = "5")]
    forward_timeout: u64,

    /// Seconds allowed to close everything on exit
    #[arg(long, env = "DOCKFLEET_SHUTDOWN_TIMEOUT", default_value = "5")]
    shutdown_timeout: u64,

    /// Directory for the forwarded control sockets [default: $XDG_RUNTIME_DIR/dockfleet-$USER]
    #[arg(long, env = "DOCKFLEET_SOCKET_DIR")]
    socket_dir: Option<PathBuf>,

    /// Docker control socket on the remote hosts
    #[arg(long, env = "DOCKFLEET_REMOTE_SOCKET", default_value = DEFAULT_REMOTE_SOCKET)]
    remote_socket: String,

    /// First local address handed out to tunnels
    #[arg(long, env = "DOCKFLEET_POOL_START", default_value = "127.0.0.2")]
    pool_start: Ipv4Addr,

    /// Last local address handed out to tunnels
    #[arg(long, env = "DOCKFLEET_POOL_END", default_value = "127.0.0.254")]
    pool_end: Ipv4Addr,
}

impl Args {
    fn into_config(self) -> Result<Config> {
        let tunnels = if self.tunnel_all {
            TunnelSelection::All
        } else if let Some(path) = &self.tunnel_file {
            TunnelSelection::from_file(&expand_tilde(path))?
        } else {
            TunnelSelection::from_names(self.tunnel)
        };
        let defaults = Config::default();
        Ok(Config {
            ssh_config: self
                .config
                .map(|p| expand_tilde(&p))
                .unwrap_or_else(default_ssh_config),
            registry: RegistryOptions {
                allowed_users: self.users.into_iter().collect(),
                exclusion_marker: self.exclude_marker,
                ..defaults.registry
            },
            credentials: Credentials {
                private_key: self.key.map(|p| expand_tilde(&p)),
                passphrase: self.passphrase,
                use_agent: !self.no_agent,
            },
            include_all: self.all,
            interval: Duration::from_secs(self.interval),
            connect_timeout: Duration::from_secs(self.connect_timeout),
            fetch_timeout: Duration::from_secs(self.fetch_timeout),
            forward_timeout: Duration::from_secs(self.forward_timeout),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout),
            pool_start: self.pool_start,
            pool_end: self.pool_end,
            socket_dir: self.socket_dir.unwrap_or(defaults.socket_dir),
            remote_socket: self.remote_socket,
            inventory: self.mode,
            tunnels,
            tunnel_target: self.tunnel_target,
        })
    }
}

/// Cancelled on the first SIGINT or SIGTERM; a second one exits at once.
///
/// Both handlers are registered before this returns, so a signal arriving
/// while hosts are still connecting is not lost.
fn install_shutdown() -> Result<CancellationToken> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => info!("interrupted"),
            _ = terminate.recv() => info!("terminated"),
        }
        cancel.cancel();
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        warn!("forced exit");
        process::exit(130);
    });
    Ok(token)
}

async fn run(args: Args) -> Result<()> {
    let shutdown = install_shutdown()?;
    let config = args.into_config()?;
    let registry = SshConfigRegistry::new(&config.ssh_config, config.registry.clone());
    let connector = SshConnector::new(config.credentials.clone(), config.connect_timeout);
    let presenter = TablePresenter::new(
        std::io::stdout(),
        config.tunnels.is_enabled(),
        config.include_all,
    );
    PollLoop::new(config, connector, presenter)
        .run(&registry, shutdown.cancelled_owned())
        .await
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if let Err(err) = run(args).await {
        error!("{}", display_chain(&err));
        process::exit(1);
    }
}
