//! Assigns each remote host its own local forwarding address.
//!
//! Container tunnels bind `<address>:<remote port>` locally, so two hosts
//! publishing the same port never collide as long as they get different
//! addresses. Assignments are claimed on first use and never change for the
//! lifetime of the allocator.

use crate::errors::{Error, Result};
use log::debug;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

/// Default pool: the loopback range above `127.0.0.1`.
pub const DEFAULT_POOL_START: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 2);
pub const DEFAULT_POOL_END: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 254);

#[derive(Debug, Default)]
struct Claims {
    next: u64,
    by_host: HashMap<String, Ipv4Addr>,
}

/// Fixed pool of contiguous IPv4 addresses handed out per host.
#[derive(Debug)]
pub struct ForwardAllocator {
    start: u32,
    capacity: u64,
    claims: Mutex<Claims>,
}

impl ForwardAllocator {
    /// Pool covering `start..=end`. An inverted range yields an empty pool.
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Self {
        let (s, e) = (u32::from(start), u32::from(end));
        let capacity = if e >= s { u64::from(e - s) + 1 } else { 0 };
        Self {
            start: s,
            capacity,
            claims: Mutex::new(Claims::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Address assigned to `host`, claiming the next free one on first call.
    pub fn address_for(&self, host: &str) -> Result<Ipv4Addr> {
        let mut claims = self.claims.lock()?;
        if let Some(addr) = claims.by_host.get(host) {
            return Ok(*addr);
        }
        if claims.next >= self.capacity {
            return Err(Error::PoolExhausted {
                host: host.to_owned(),
                capacity: self.capacity(),
            });
        }
        // next < capacity, so the sum stays within the pool
        let addr = Ipv4Addr::from(self.start + claims.next as u32);
        claims.next += 1;
        claims.by_host.insert(host.to_owned(), addr);
        debug!("forwarding address {addr} assigned to {host}");
        Ok(addr)
    }

    /// Current assignment for `host`, without claiming.
    pub fn assigned(&self, host: &str) -> Option<Ipv4Addr> {
        self.claims
            .lock()
            .ok()
            .and_then(|claims| claims.by_host.get(host).copied())
    }
}

impl Default for ForwardAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_START, DEFAULT_POOL_END)
    }
}
