//! In-process stand-ins for SSH sessions used by unit tests.
#![cfg(test)]

use crate::errors::{Error, Result};
use crate::forward::{Dialer, RemoteEndpoint};
use crate::registry::HostTarget;
use crate::session::{CommandOutput, Connector, RemoteSession};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};

/// Session whose channels all lead to a local TCP echo server.
pub struct EchoDialer {
    addr: SocketAddr,
    reject: bool,
    hang_dial: bool,
    dialed: Mutex<Vec<RemoteEndpoint>>,
    /// stdout of exec call `i`; the last entry repeats.
    listings: Vec<String>,
    hang_on: HashSet<usize>,
    execs: AtomicUsize,
    dials: Arc<AtomicUsize>,
    keepalives: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl EchoDialer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut rd, mut wr) = stream.split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });
        Self {
            addr,
            reject: false,
            hang_dial: false,
            dialed: Mutex::new(Vec::new()),
            listings: Vec::new(),
            hang_on: HashSet::new(),
            execs: AtomicUsize::new(0),
            dials: Arc::new(AtomicUsize::new(0)),
            keepalives: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn reject_all(mut self) -> Self {
        self.reject = true;
        self
    }

    /// Every dial waits forever.
    pub fn hang_dials(mut self) -> Self {
        self.hang_dial = true;
        self
    }

    pub fn dialed(&self) -> Vec<RemoteEndpoint> {
        self.dialed.lock().unwrap().clone()
    }

    pub fn execs(&self) -> usize {
        self.execs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for EchoDialer {
    type Stream = TcpStream;

    async fn dial(&self, remote: &RemoteEndpoint) -> Result<TcpStream> {
        self.dialed.lock().unwrap().push(remote.clone());
        self.dials.fetch_add(1, Ordering::SeqCst);
        if self.hang_dial {
            std::future::pending::<()>().await;
        }
        if self.reject {
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused).into());
        }
        Ok(TcpStream::connect(self.addr).await?)
    }
}

#[async_trait]
impl RemoteSession for EchoDialer {
    async fn exec(&self, _command: &str) -> Result<CommandOutput> {
        let call = self.execs.fetch_add(1, Ordering::SeqCst);
        if self.hang_on.contains(&call) {
            std::future::pending::<()>().await;
        }
        let stdout = self
            .listings
            .get(call)
            .or_else(|| self.listings.last())
            .cloned()
            .unwrap_or_default();
        Ok(CommandOutput {
            status: 0,
            stdout,
            stderr: String::new(),
        })
    }

    async fn keepalive(&self) -> Result<()> {
        self.keepalives.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Connector whose behaviour is scripted per host.
#[derive(Default)]
pub struct FakeConnector {
    refuse: HashSet<String>,
    hang: HashSet<String>,
    reject_dial: HashSet<String>,
    hang_dial: HashSet<String>,
    listings: HashMap<String, Vec<String>>,
    hang_exec: HashMap<String, HashSet<usize>>,
    /// Channels opened across every session.
    pub dials: Arc<AtomicUsize>,
    pub keepalives: Arc<AtomicUsize>,
    /// Sessions closed so far.
    pub closed: Arc<AtomicUsize>,
}

impl FakeConnector {
    pub fn refuse(mut self, host: &str) -> Self {
        self.refuse.insert(host.to_owned());
        self
    }

    pub fn hang(mut self, host: &str) -> Self {
        self.hang.insert(host.to_owned());
        self
    }

    /// Every channel opened on `host` is refused.
    pub fn reject_dial(mut self, host: &str) -> Self {
        self.reject_dial.insert(host.to_owned());
        self
    }

    /// Every channel opened on `host` never completes.
    pub fn hang_dial(mut self, host: &str) -> Self {
        self.hang_dial.insert(host.to_owned());
        self
    }

    /// `docker ps` output returned by every exec on `host`.
    pub fn listing(self, host: &str, stdout: &str) -> Self {
        self.script(host, &[stdout])
    }

    /// `docker ps` output per exec call on `host`; the last one repeats.
    pub fn script(mut self, host: &str, stdouts: &[&str]) -> Self {
        self.listings.insert(
            host.to_owned(),
            stdouts.iter().map(|s| s.to_string()).collect(),
        );
        self
    }

    /// Make the `call`-th exec (zero based) on `host` never finish.
    pub fn hang_exec(mut self, host: &str, call: usize) -> Self {
        self.hang_exec.entry(host.to_owned()).or_default().insert(call);
        self
    }
}

#[async_trait]
impl Connector for FakeConnector {
    type Session = EchoDialer;

    async fn connect(&self, target: &HostTarget) -> Result<EchoDialer> {
        if self.refuse.contains(&target.host) {
            return Err(Error::AuthFailed {
                user: target.user.clone(),
            });
        }
        if self.hang.contains(&target.host) {
            std::future::pending::<()>().await;
        }
        let mut session = EchoDialer::start().await;
        session.reject = self.reject_dial.contains(&target.host);
        session.hang_dial = self.hang_dial.contains(&target.host);
        session.listings = self.listings.get(&target.host).cloned().unwrap_or_default();
        session.hang_on = self.hang_exec.get(&target.host).cloned().unwrap_or_default();
        session.dials = self.dials.clone();
        session.keepalives = self.keepalives.clone();
        session.closed = self.closed.clone();
        Ok(session)
    }
}
