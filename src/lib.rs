//! Docker container inventory and tunnelling across a fleet of SSH hosts

pub mod allocator;
pub mod batch;
mod channel;
pub mod config;
pub mod container;
mod docker;
pub mod errors;
pub mod forward;
mod http_client;
mod hyper_client;
pub mod inventory;
mod options;
pub mod poll;
pub mod registry;
pub mod render;
pub mod session;
#[cfg(test)]
mod testutil;

pub use docker::Docker;
pub use options::*;
pub use poll::{PollCycleResult, PollLoop};
