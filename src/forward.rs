//! Local-to-remote forwards over an established session.
//!
//! A [`Forward`] owns a local listener (Unix socket or TCP) and proxies every
//! accepted connection through a fresh channel opened by a [`Dialer`]. Each
//! forward is established independently; batches of them go through
//! [`run_batch`] so one failure never affects its siblings.

use crate::allocator::ForwardAllocator;
use crate::batch::run_batch;
use crate::config::TunnelTarget;
use crate::container::{Container, Tunnel};
use crate::errors::{display_chain, Error, Result};
use crate::registry::HostTarget;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UnixListener};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Opens a bidirectional stream to a remote endpoint.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn dial(&self, remote: &RemoteEndpoint) -> Result<Self::Stream>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForwardKind {
    UnixSocket,
    TcpPort,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LocalEndpoint {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl fmt::Display for LocalEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LocalEndpoint::Unix(path) => write!(f, "{}", path.display()),
            LocalEndpoint::Tcp(addr) => write!(f, "{addr}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RemoteEndpoint {
    Unix(String),
    Tcp { host: String, port: u16 },
}

impl fmt::Display for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RemoteEndpoint::Unix(path) => write!(f, "{path}"),
            RemoteEndpoint::Tcp { host, port } => write!(f, "{host}:{port}"),
        }
    }
}

enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl Listener {
    fn bind(local: &LocalEndpoint) -> Result<Self> {
        Self::bind_io(local).map_err(|source| Error::Bind {
            endpoint: local.to_string(),
            source,
        })
    }

    fn bind_io(local: &LocalEndpoint) -> io::Result<Self> {
        match local {
            LocalEndpoint::Unix(path) => {
                remove_socket_file(path)?;
                Ok(Listener::Unix(UnixListener::bind(path)?))
            }
            LocalEndpoint::Tcp(addr) => {
                let socket = match addr.ip() {
                    IpAddr::V4(_) => tokio::net::TcpSocket::new_v4()?,
                    IpAddr::V6(_) => tokio::net::TcpSocket::new_v6()?,
                };
                socket.set_reuseaddr(true)?;
                socket.bind(*addr)?;
                Ok(Listener::Tcp(socket.listen(128)?))
            }
        }
    }
}

fn remove_socket_file(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

/// One active tunnel.
#[derive(Debug)]
pub struct Forward {
    kind: ForwardKind,
    local: LocalEndpoint,
    remote: RemoteEndpoint,
    owner: HostTarget,
    stop_accept: CancellationToken,
    abort: CancellationToken,
    tracker: TaskTracker,
}

impl Forward {
    pub fn kind(&self) -> ForwardKind {
        self.kind
    }

    pub fn local(&self) -> &LocalEndpoint {
        &self.local
    }

    pub fn remote(&self) -> &RemoteEndpoint {
        &self.remote
    }

    /// Host whose session carries this forward.
    pub fn owner(&self) -> &HostTarget {
        &self.owner
    }

    /// True once the listener is gone and every proxied connection ended.
    pub fn is_closed(&self) -> bool {
        self.stop_accept.is_cancelled() && self.tracker.is_closed() && self.tracker.is_empty()
    }

    /// Stop accepting and wait for in-flight connections.
    ///
    /// Connections still open after `grace` are shut down. Closing an already
    /// closed forward returns immediately.
    pub async fn close(&self, grace: Duration) -> Result<()> {
        self.stop_accept.cancel();
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            debug!(
                "{} connections still open on {}, shutting them down",
                self.tracker.len(),
                self.local
            );
            self.abort.cancel();
            self.tracker.wait().await;
        }
        if let LocalEndpoint::Unix(path) = &self.local {
            remove_socket_file(path)?;
        }
        debug!("closed forward {} -> {}", self.local, self.remote);
        Ok(())
    }
}

impl Drop for Forward {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }
        // dropped without close(): stop the accept loop and every connection
        self.stop_accept.cancel();
        self.abort.cancel();
        self.tracker.close();
        if let LocalEndpoint::Unix(path) = &self.local {
            if let Err(err) = remove_socket_file(path) {
                debug!("removing {}: {err}", path.display());
            }
        }
        debug!("dropped forward {} -> {}", self.local, self.remote);
    }
}

impl fmt::Display for Forward {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} -> {} via {}", self.local, self.remote, self.owner)
    }
}

/// Shared state of one forward's accept loop and its connections.
struct Proxy<D: Dialer> {
    dialer: Arc<D>,
    remote: RemoteEndpoint,
    dial_timeout: Duration,
    stop_accept: CancellationToken,
    abort: CancellationToken,
    tracker: TaskTracker,
}

impl<D: Dialer> Proxy<D> {
    async fn accept_unix(self: Arc<Self>, listener: UnixListener) {
        loop {
            tokio::select! {
                _ = self.stop_accept.cancelled() => break,
                res = listener.accept() => match res {
                    Ok((stream, _)) => self.clone().spawn_conn(stream),
                    Err(err) => warn!("accept on unix forward to {} failed: {err}", self.remote),
                },
            }
        }
    }

    async fn accept_tcp(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.stop_accept.cancelled() => break,
                res = listener.accept() => match res {
                    Ok((stream, peer)) => {
                        debug!("{peer} connected, forwarding to {}", self.remote);
                        self.clone().spawn_conn(stream)
                    }
                    Err(err) => warn!("accept on tcp forward to {} failed: {err}", self.remote),
                },
            }
        }
    }

    fn spawn_conn<S>(self: Arc<Self>, local: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let tracker = self.tracker.clone();
        tracker.spawn(async move {
            if let Err(err) = self.proxy(local).await {
                debug!("connection to {} ended: {}", self.remote, display_chain(&err));
            }
        });
    }

    async fn proxy<S>(&self, mut local: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut remote = match tokio::time::timeout(self.dial_timeout, self.dialer.dial(&self.remote)).await {
            Ok(res) => res?,
            Err(_) => return Err(Error::timeout(format!("dial {}", self.remote), self.dial_timeout)),
        };
        tokio::select! {
            res = tokio::io::copy_bidirectional(&mut local, &mut remote) => {
                let (up, down) = res?;
                debug!("{} closed after {up} bytes up, {down} bytes down", self.remote);
            }
            _ = self.abort.cancelled() => {
                let _ = remote.shutdown().await;
                let _ = local.shutdown().await;
            }
        }
        Ok(())
    }
}

/// Socket file of an attempt that has not become a [`Forward`] yet. Removed
/// unless disarmed, including when the attempt is cancelled.
struct Unbound(Option<PathBuf>);

impl Unbound {
    fn new(local: &LocalEndpoint) -> Self {
        match local {
            LocalEndpoint::Unix(path) => Unbound(Some(path.clone())),
            LocalEndpoint::Tcp(_) => Unbound(None),
        }
    }

    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for Unbound {
    fn drop(&mut self) {
        if let Some(path) = &self.0 {
            let _ = remove_socket_file(path);
        }
    }
}

/// Bind `local`, check that `remote` accepts a channel, then start proxying.
async fn establish<D: Dialer>(
    dialer: Arc<D>,
    owner: &HostTarget,
    kind: ForwardKind,
    local: LocalEndpoint,
    remote: RemoteEndpoint,
    timeout: Duration,
) -> Result<Forward> {
    let label = format!("{local} -> {remote} on {owner}");
    let unbound = Unbound::new(&local);
    let attempt = async {
        let listener = Listener::bind(&local)?;
        let mut check = dialer.dial(&remote).await?;
        let _ = check.shutdown().await;
        Ok::<_, Error>(listener)
    };
    let listener = match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok(listener)) => listener,
        Ok(Err(err)) => return Err(Error::forward(label, err)),
        Err(_) => return Err(Error::forward(label.clone(), Error::timeout(label, timeout))),
    };
    unbound.disarm();

    let tracker = TaskTracker::new();
    let proxy = Arc::new(Proxy {
        dialer,
        remote: remote.clone(),
        dial_timeout: timeout,
        stop_accept: CancellationToken::new(),
        abort: CancellationToken::new(),
        tracker: tracker.clone(),
    });
    let (stop_accept, abort) = (proxy.stop_accept.clone(), proxy.abort.clone());
    match listener {
        Listener::Unix(l) => tracker.spawn(proxy.accept_unix(l)),
        Listener::Tcp(l) => tracker.spawn(proxy.accept_tcp(l)),
    };
    info!("forwarding {label}");
    Ok(Forward {
        kind,
        local,
        remote,
        owner: owner.clone(),
        stop_accept,
        abort,
        tracker,
    })
}

/// Expose the remote Docker control socket as a local Unix socket.
pub async fn forward_control_socket<D: Dialer>(
    dialer: Arc<D>,
    owner: &HostTarget,
    local_path: &Path,
    remote_path: &str,
    timeout: Duration,
) -> Result<Forward> {
    establish(
        dialer,
        owner,
        ForwardKind::UnixSocket,
        LocalEndpoint::Unix(local_path.to_owned()),
        RemoteEndpoint::Unix(remote_path.to_owned()),
        timeout,
    )
    .await
}

/// Expose `remote_host:remote_port`, as seen from the Docker host, on `local_addr`.
pub async fn forward_container_port<D: Dialer>(
    dialer: Arc<D>,
    owner: &HostTarget,
    local_addr: SocketAddr,
    remote_host: &str,
    remote_port: u16,
    timeout: Duration,
) -> Result<Forward> {
    establish(
        dialer,
        owner,
        ForwardKind::TcpPort,
        LocalEndpoint::Tcp(local_addr),
        RemoteEndpoint::Tcp {
            host: remote_host.to_owned(),
            port: remote_port,
        },
        timeout,
    )
    .await
}

/// Whether a container address is reachable from outside its network namespace.
pub fn is_connectable(host: &str) -> bool {
    !matches!(host, "" | "0.0.0.0" | "::" | "[::]")
}

/// A container tunnel ready to be established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelPlan {
    pub owner: HostTarget,
    pub container: String,
    pub tunnel: Tunnel,
}

impl fmt::Display for TunnelPlan {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{} ({})", self.owner.host, self.container, self.tunnel)
    }
}

/// Work out which of `containers` can be tunnelled and where.
///
/// Containers without a connectable address are skipped before any network
/// attempt. If the allocator is exhausted the host gets no tunnels at all.
pub fn plan_tunnels<'a>(
    owner: &HostTarget,
    containers: impl IntoIterator<Item = &'a Container>,
    allocator: &ForwardAllocator,
    target: TunnelTarget,
) -> Vec<TunnelPlan> {
    let mut plans = Vec::new();
    for container in containers {
        let Some((remote_host, remote_port)) = container.endpoint(target) else {
            debug!(
                "{}/{}: no connectable {target} endpoint, not tunnelling",
                owner.host, container.name
            );
            continue;
        };
        let local_ip = match allocator.address_for(&owner.host) {
            Ok(ip) => ip,
            Err(err) => {
                warn!("no tunnels for {}: {err}", owner.host);
                return Vec::new();
            }
        };
        plans.push(TunnelPlan {
            owner: owner.clone(),
            container: container.name.clone(),
            tunnel: Tunnel {
                local: SocketAddr::new(IpAddr::V4(local_ip), remote_port),
                remote_host: remote_host.to_owned(),
                remote_port,
            },
        });
    }
    plans
}

/// Establish every planned tunnel concurrently; returns the ones that came up.
pub async fn establish_tunnels<D: Dialer>(
    plans: Vec<(TunnelPlan, Arc<D>)>,
    timeout: Duration,
) -> Vec<(TunnelPlan, Forward)> {
    let ops = plans.into_iter().map(|(plan, dialer)| {
        let fut = {
            let plan = plan.clone();
            async move {
                forward_container_port(
                    dialer,
                    &plan.owner,
                    plan.tunnel.local,
                    &plan.tunnel.remote_host,
                    plan.tunnel.remote_port,
                    timeout,
                )
                .await
            }
        };
        (plan, fut)
    });
    // each attempt carries its own timeout; the slack covers scheduling
    run_batch("tunnel", ops, timeout + Duration::from_secs(1))
        .await
        .successes()
}

/// Close `forwards` concurrently, giving each `grace` to drain.
///
/// Returns how many confirmed closure before `deadline`.
pub async fn close_all(forwards: &[Forward], grace: Duration, deadline: Duration) -> usize {
    let ops = forwards.iter().map(|fwd| (fwd.to_string(), fwd.close(grace)));
    let outcome = run_batch("close", ops, deadline).await;
    outcome.ok.len()
}
