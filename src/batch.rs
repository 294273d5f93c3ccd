//! Runs a batch of independent fallible operations concurrently.
//!
//! Every operation in a batch shares one deadline. Successes are collected in
//! completion order; failures and operations still running at the deadline
//! are logged and reported separately, never propagated.

use crate::errors::{display_chain, Error, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, warn};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Successes and failures of one batch.
#[derive(Debug)]
pub struct BatchOutcome<K, T> {
    /// Completed operations, in completion order.
    pub ok: Vec<(K, T)>,
    pub failed: Vec<(K, Error)>,
}

impl<K, T> BatchOutcome<K, T> {
    pub fn successes(self) -> Vec<(K, T)> {
        self.ok
    }
}

impl<K, T> Default for BatchOutcome<K, T> {
    fn default() -> Self {
        Self {
            ok: Vec::new(),
            failed: Vec::new(),
        }
    }
}

/// Run `ops` concurrently, bounded by a single `timeout` for the whole batch.
///
/// `what` names the operation in log lines (`"connect"`, `"forward"`, ...).
pub async fn run_batch<K, T, F, I>(what: &str, ops: I, timeout: Duration) -> BatchOutcome<K, T>
where
    I: IntoIterator<Item = (K, F)>,
    F: Future<Output = Result<T>>,
    K: Display,
{
    let deadline = Instant::now() + timeout;
    let mut pending: FuturesUnordered<_> = ops
        .into_iter()
        .map(|(key, fut)| async move {
            let res = match tokio::time::timeout_at(deadline, fut).await {
                Ok(res) => res,
                Err(_) => Err(Error::timeout(format!("{what} {key}"), timeout)),
            };
            (key, res)
        })
        .collect();
    debug!("{what}: {} operations in flight", pending.len());

    let mut outcome = BatchOutcome::default();
    while let Some((key, res)) = pending.next().await {
        match res {
            Ok(value) => outcome.ok.push((key, value)),
            Err(err) => {
                warn!("{what} {key} failed: {}", display_chain(&err));
                outcome.failed.push((key, err));
            }
        }
    }
    debug!(
        "{what}: {} succeeded, {} failed",
        outcome.ok.len(),
        outcome.failed.len()
    );
    outcome
}
