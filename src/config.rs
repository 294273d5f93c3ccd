//! Run configuration.

use crate::allocator::{DEFAULT_POOL_END, DEFAULT_POOL_START};
use crate::errors::{Error, Result};
use crate::registry::{HostTarget, RegistryOptions};
use crate::session::Credentials;
use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// The default remote Docker control socket.
pub static DEFAULT_REMOTE_SOCKET: &str = "/var/run/docker.sock";

/// How container inventories are collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InventoryMode {
    /// Forward each host's control socket and query the Engine API.
    #[default]
    Socket,
    /// Run `docker ps` over the session.
    Command,
}

impl FromStr for InventoryMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "socket" => Ok(InventoryMode::Socket),
            "command" => Ok(InventoryMode::Command),
            other => Err(format!("unknown inventory mode {other:?} (socket|command)")),
        }
    }
}

/// Which side of a container's port mapping a tunnel connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TunnelTarget {
    /// Host-published address and port.
    #[default]
    Public,
    /// Container network address and port.
    Private,
}

impl fmt::Display for TunnelTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            TunnelTarget::Public => "public",
            TunnelTarget::Private => "private",
        })
    }
}

impl FromStr for TunnelTarget {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "public" => Ok(TunnelTarget::Public),
            "private" => Ok(TunnelTarget::Private),
            other => Err(format!("unknown tunnel target {other:?} (public|private)")),
        }
    }
}

/// Containers to tunnel on the first cycle.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TunnelSelection {
    #[default]
    None,
    All,
    Names(BTreeSet<String>),
}

impl TunnelSelection {
    /// Read container names, one per line. Blank lines and `#` comments are skipped.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::from_names(
            text.lines()
                .map(|l| l.split('#').next().unwrap_or("").trim())
                .filter(|l| !l.is_empty()),
        ))
    }

    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: BTreeSet<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            TunnelSelection::None
        } else {
            TunnelSelection::Names(names)
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, TunnelSelection::None)
    }

    pub fn matches(&self, container: &str) -> bool {
        match self {
            TunnelSelection::None => false,
            TunnelSelection::All => true,
            TunnelSelection::Names(names) => names.contains(container),
        }
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_owned(),
    }
}

/// `~/.ssh/config`
pub fn default_ssh_config() -> PathBuf {
    expand_tilde(Path::new("~/.ssh/config"))
}

/// `$XDG_RUNTIME_DIR/dockfleet-<user>`, or the same name under the system
/// temp dir when there is no runtime dir. Created with mode 0700 on first use.
pub fn default_socket_dir() -> PathBuf {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "dockfleet".to_owned());
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(format!("dockfleet-{user}"))
}

#[derive(Debug, Clone)]
pub struct Config {
    pub ssh_config: PathBuf,
    pub registry: RegistryOptions,
    pub credentials: Credentials,
    /// List stopped containers as well as running ones.
    pub include_all: bool,
    pub interval: Duration,
    pub connect_timeout: Duration,
    pub fetch_timeout: Duration,
    pub forward_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub pool_start: Ipv4Addr,
    pub pool_end: Ipv4Addr,
    /// Where local control sockets are created. Must be private to the
    /// current user.
    pub socket_dir: PathBuf,
    pub remote_socket: String,
    pub inventory: InventoryMode,
    pub tunnels: TunnelSelection,
    pub tunnel_target: TunnelTarget,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ssh_config: default_ssh_config(),
            registry: RegistryOptions::default(),
            credentials: Credentials {
                use_agent: true,
                ..Default::default()
            },
            include_all: false,
            interval: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            fetch_timeout: Duration::from_secs(10),
            forward_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
            pool_start: DEFAULT_POOL_START,
            pool_end: DEFAULT_POOL_END,
            socket_dir: default_socket_dir(),
            remote_socket: DEFAULT_REMOTE_SOCKET.to_owned(),
            inventory: InventoryMode::default(),
            tunnels: TunnelSelection::default(),
            tunnel_target: TunnelTarget::default(),
        }
    }
}

impl Config {
    /// Local socket forwarded to `target`'s control socket.
    pub fn socket_path(&self, target: &HostTarget) -> PathBuf {
        self.socket_dir
            .join(format!("dockfleet-{}@{}.sock", target.user, target.host))
    }

    /// Reject settings the poll loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| Error::ConfigParse {
            line: 0,
            message: message.to_owned(),
        };
        if self.interval.is_zero() {
            return Err(invalid("poll interval must be positive"));
        }
        if u32::from(self.pool_end) < u32::from(self.pool_start) && self.tunnels.is_enabled() {
            return Err(invalid("forwarding address pool is empty"));
        }
        Ok(())
    }
}
