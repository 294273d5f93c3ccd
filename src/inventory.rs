//! Container inventory collection.
//!
//! Two sources exist: the Engine API reached through a forwarded control
//! socket, and `docker ps` executed over the session itself.

use crate::container::Container;
use crate::docker::Docker;
use crate::errors::{Error, Result};
use crate::options::{ContainerListOptions, LISTING_SEPARATOR};
use crate::registry::HostTarget;
use crate::session::RemoteSession;
use async_trait::async_trait;
use log::debug;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Lists the containers of one reachable host.
#[async_trait]
pub trait InventorySource: Send + Sync {
    async fn list_containers(&self, host: &HostTarget, include_all: bool) -> Result<Vec<Container>>;
}

/// Queries each host's Docker API through its forwarded control socket.
#[derive(Debug, Default)]
pub struct SocketInventory {
    sockets: HashMap<HostTarget, PathBuf>,
}

impl SocketInventory {
    pub fn new(sockets: HashMap<HostTarget, PathBuf>) -> Self {
        Self { sockets }
    }
}

#[async_trait]
impl InventorySource for SocketInventory {
    async fn list_containers(&self, host: &HostTarget, include_all: bool) -> Result<Vec<Container>> {
        let socket = self.sockets.get(host).ok_or_else(|| {
            Error::inventory(
                &host.host,
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no control socket forwarded",
                )),
            )
        })?;
        let docker = Docker::connect_with_unix(socket);
        let summaries = docker
            .list_containers(&ContainerListOptions::include_all(include_all))
            .await
            .map_err(|err| Error::inventory(&host.host, err))?;
        Ok(summaries.into_iter().map(Container::from).collect())
    }
}

/// Runs `docker ps` on each host over its session.
pub struct CommandInventory<S> {
    sessions: HashMap<HostTarget, Arc<S>>,
}

impl<S> CommandInventory<S> {
    pub fn new(sessions: HashMap<HostTarget, Arc<S>>) -> Self {
        Self { sessions }
    }
}

/// Parse `docker ps` output produced by [`ContainerListOptions::to_ps_command`].
pub fn parse_listing(stdout: &str) -> Result<Vec<Container>> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| Container::from_listing_line(line, LISTING_SEPARATOR))
        .collect()
}

#[async_trait]
impl<S: RemoteSession> InventorySource for CommandInventory<S> {
    async fn list_containers(&self, host: &HostTarget, include_all: bool) -> Result<Vec<Container>> {
        let session = self.sessions.get(host).ok_or_else(|| {
            Error::inventory(
                &host.host,
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "no session",
                )),
            )
        })?;
        let command = ContainerListOptions::include_all(include_all).to_ps_command();
        debug!("{host}: {command}");
        let output = session
            .exec(&command)
            .await
            .map_err(|err| Error::inventory(&host.host, err))?;
        if output.status != 0 {
            return Err(Error::inventory(
                &host.host,
                Error::CommandFailed {
                    status: output.status,
                    stderr: output.stderr.trim().to_owned(),
                },
            ));
        }
        parse_listing(&output.stdout).map_err(|err| Error::inventory(&host.host, err))
    }
}
