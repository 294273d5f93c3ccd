use std::error::Error as StdError;
use std::io;
use std::time::Duration;

use thiserror::Error;

/// Type of general docker error response
#[derive(Debug, serde::Deserialize, Error)]
#[error("{message}")]
pub struct DockerError {
    pub message: String,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error")]
    Io(#[source] io::Error),
    #[error("ssh error")]
    Ssh(#[from] ssh2::Error),
    #[error("hyper error")]
    Hyper(#[source] hyper::Error),
    #[error("connection refused")]
    ConnectionRefused(#[source] Box<dyn StdError + Send + Sync>),
    #[error("connection reset")]
    ConnectionReset(#[source] Box<dyn StdError + Send + Sync>),
    #[error("json error")]
    Json(#[from] serde_json::Error),
    #[error("docker error")]
    Docker(#[from] DockerError),
    #[error("http error")]
    Http(#[from] http::Error),
    #[error("could not connect to {host}")]
    Connection { host: String, source: Box<Error> },
    #[error("could not bind {endpoint}")]
    Bind {
        endpoint: String,
        source: io::Error,
    },
    #[error("could not forward {endpoint}")]
    Forward { endpoint: String, source: Box<Error> },
    #[error("could not list containers on {host}")]
    Inventory { host: String, source: Box<Error> },
    #[error("no forwarding address left for {host} (pool of {capacity})")]
    PoolExhausted { host: String, capacity: usize },
    #[error("config parse error at line {line}: {message}")]
    ConfigParse { line: usize, message: String },
    #[error("no eligible hosts in ssh config")]
    EmptyRegistry,
    #[error("no usable local socket directory or endpoint")]
    NoLocalEndpoint,
    #[error("{what} timed out after {after:?}")]
    Timeout { what: String, after: Duration },
    #[error("remote command exited with {status}: {stderr}")]
    CommandFailed { status: i32, stderr: String },
    #[error("malformed listing line: {line}")]
    MalformedListing { line: String },
    #[error("ssh authentication failed for {user}")]
    AuthFailed { user: String },
    #[error("poison error: {}", message)]
    Poison { message: String },
    #[error("background task failed")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn connection(host: &str, err: Error) -> Self {
        Error::Connection {
            host: host.to_owned(),
            source: Box::new(err),
        }
    }

    pub fn forward(endpoint: impl Into<String>, err: Error) -> Self {
        Error::Forward {
            endpoint: endpoint.into(),
            source: Box::new(err),
        }
    }

    pub fn inventory(host: &str, err: Error) -> Self {
        Error::Inventory {
            host: host.to_owned(),
            source: Box::new(err),
        }
    }

    pub fn timeout(what: impl Into<String>, after: Duration) -> Self {
        Error::Timeout {
            what: what.into(),
            after,
        }
    }

    /// Whether the failure is local to one host or operation.
    ///
    /// Only an empty registry and an unusable local socket setup stop the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::EmptyRegistry | Error::NoLocalEndpoint)
    }

    /// Whether a forward failed on the local side, before any remote work.
    pub fn is_local_bind(&self) -> bool {
        match self {
            Error::Bind { .. } => true,
            Error::Forward { source, .. } => source.is_local_bind(),
            _ => false,
        }
    }
}

impl From<hyper::Error> for Error {
    fn from(err: hyper::Error) -> Self {
        if err.is_connect() {
            return match err
                .source()
                .and_then(|e| e.downcast_ref::<io::Error>())
                .map(|e| e.kind())
            {
                Some(io::ErrorKind::ConnectionRefused) => Error::ConnectionRefused(Box::new(err)),
                Some(io::ErrorKind::ConnectionReset) => Error::ConnectionReset(Box::new(err)),
                _ => Error::Hyper(err),
            };
        }
        Error::Hyper(err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Error::ConnectionRefused(Box::new(err)),
            io::ErrorKind::ConnectionReset => Error::ConnectionReset(Box::new(err)),
            _ => Error::Io(err),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Poison {
            message: err.to_string(),
        }
    }
}

/// Render an error with its whole `source()` chain on one line.
pub fn display_chain(err: &(dyn StdError + 'static)) -> String {
    let mut out = err.to_string();
    let mut cur = err.source();
    while let Some(e) = cur {
        out.push_str(": ");
        out.push_str(&e.to_string());
        cur = e.source();
    }
    out
}
