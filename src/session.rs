//! SSH connection pool.
//!
//! `connect_all` dials every target at once and keeps whatever answered
//! before the batch deadline. Sessions are handed to the caller, which owns
//! closing them.

use crate::batch::run_batch;
use crate::channel::{retry, ChannelStream, POLL_INTERVAL};
use crate::errors::{Error, Result};
use crate::forward::{Dialer, RemoteEndpoint};
use crate::registry::HostTarget;
use async_trait::async_trait;
use log::{debug, info};
use std::collections::HashMap;
use std::io::{self, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Key material used for every host.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub private_key: Option<PathBuf>,
    pub passphrase: Option<String>,
    /// Fall back to keys held by a running ssh-agent.
    pub use_agent: bool,
}

/// Captured result of a remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

/// What the poll loop needs from an established session.
#[async_trait]
pub trait RemoteSession: Dialer {
    async fn exec(&self, command: &str) -> Result<CommandOutput>;

    /// Send one keepalive message so idle sessions survive NAT and server
    /// timeouts.
    async fn keepalive(&self) -> Result<()>;

    /// Disconnect. Calling it twice is harmless.
    async fn close(&self) -> Result<()>;
}

/// Opens sessions to single targets.
#[async_trait]
pub trait Connector: Send + Sync {
    type Session: RemoteSession;

    async fn connect(&self, target: &HostTarget) -> Result<Self::Session>;
}

/// Connect to every target concurrently.
///
/// Targets that fail or miss the deadline are logged and left out; absence
/// from the returned map means "unreachable for now".
pub async fn connect_all<C: Connector>(
    connector: &C,
    targets: &[HostTarget],
    timeout: Duration,
) -> HashMap<HostTarget, Arc<C::Session>> {
    let ops = targets.iter().map(|target| {
        (target.clone(), async move {
            connector
                .connect(target)
                .await
                .map_err(|err| Error::connection(&target.host, err))
        })
    });
    let outcome = run_batch("connect", ops, timeout).await;
    info!(
        "{} of {} hosts reachable",
        outcome.ok.len(),
        targets.len()
    );
    outcome
        .ok
        .into_iter()
        .map(|(target, session)| (target, Arc::new(session)))
        .collect()
}

/// Connector using libssh2.
#[derive(Debug, Clone)]
pub struct SshConnector {
    credentials: Credentials,
    /// Bound on each blocking step of the handshake.
    io_timeout: Duration,
    keepalive: u32,
}

impl SshConnector {
    pub fn new(credentials: Credentials, io_timeout: Duration) -> Self {
        Self {
            credentials,
            io_timeout,
            keepalive: 30,
        }
    }

    fn connect_blocking(&self, target: &HostTarget) -> Result<ssh2::Session> {
        let addr = (target.host.as_str(), target.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                Error::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no address for {}", target.host),
                ))
            })?;
        let tcp = TcpStream::connect_timeout(&addr, self.io_timeout)?;
        tcp.set_read_timeout(Some(self.io_timeout))?;
        tcp.set_write_timeout(Some(self.io_timeout))?;

        let mut session = ssh2::Session::new()?;
        session.set_timeout(self.io_timeout.as_millis() as u32);
        session.set_tcp_stream(tcp);
        session.handshake()?;
        self.authenticate(&session, &target.user)?;
        session.set_keepalive(true, self.keepalive);
        session.set_timeout(0);
        session.set_blocking(false);
        Ok(session)
    }

    fn authenticate(&self, session: &ssh2::Session, user: &str) -> Result<()> {
        if let Some(key) = &self.credentials.private_key {
            let res = session.userauth_pubkey_file(
                user,
                None,
                key,
                self.credentials.passphrase.as_deref(),
            );
            match res {
                Ok(()) if session.authenticated() => return Ok(()),
                Ok(()) => {}
                Err(err) => debug!("key {} rejected for {user}: {err}", key.display()),
            }
        }
        if self.credentials.use_agent
            && session.userauth_agent(user).is_ok()
            && session.authenticated()
        {
            return Ok(());
        }
        Err(Error::AuthFailed {
            user: user.to_owned(),
        })
    }
}

#[async_trait]
impl Connector for SshConnector {
    type Session = SshSession;

    async fn connect(&self, target: &HostTarget) -> Result<SshSession> {
        let this = self.clone();
        let owned = target.clone();
        let session =
            tokio::task::spawn_blocking(move || this.connect_blocking(&owned)).await??;
        debug!("connected to {target}");
        Ok(SshSession {
            target: target.clone(),
            inner: session,
        })
    }
}

/// An authenticated, non-blocking libssh2 session.
pub struct SshSession {
    target: HostTarget,
    inner: ssh2::Session,
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // ssh2::Session is !Debug
        f.debug_struct("SshSession")
            .field("target", &self.target)
            .finish()
    }
}

#[async_trait]
impl Dialer for SshSession {
    type Stream = ChannelStream;

    async fn dial(&self, remote: &RemoteEndpoint) -> Result<ChannelStream> {
        let channel = match remote {
            RemoteEndpoint::Tcp { host, port } => {
                retry(|| self.inner.channel_direct_tcpip(host, *port, None)).await?
            }
            RemoteEndpoint::Unix(path) => {
                retry(|| self.inner.channel_direct_streamlocal(path, None)).await?
            }
        };
        Ok(ChannelStream::new(channel))
    }
}

/// Drain one of the channel's streams into `out`; `Ok(true)` once it hit EOF.
fn pump(reader: &mut dyn Read, out: &mut Vec<u8>) -> io::Result<bool> {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => return Ok(true),
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(err) => return Err(err),
        }
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        let mut channel = retry(|| self.inner.channel_session()).await?;
        retry(|| channel.exec(command)).await?;

        let (mut stdout, mut stderr) = (Vec::new(), Vec::new());
        loop {
            let out_done = pump(&mut channel, &mut stdout)?;
            pump(&mut channel.stderr(), &mut stderr)?;
            if out_done {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        retry(|| channel.wait_close()).await?;
        Ok(CommandOutput {
            status: channel.exit_status()?,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    async fn keepalive(&self) -> Result<()> {
        let next = retry(|| self.inner.keepalive_send()).await?;
        debug!("keepalive sent to {}, next due in {next}s", self.target);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Err(err) = retry(|| self.inner.disconnect(None, "dockfleet shutting down", None)).await {
            // the transport may already be gone
            debug!("disconnect from {} failed: {err}", self.target);
        } else {
            debug!("disconnected from {}", self.target);
        }
        Ok(())
    }
}
