//! Auxiliary port allocation for probe tunnels
//!
//! The range is carved into consecutive (SOCKS, HTTP) pairs. A pair is
//! claimed through a [`PortLease`] and returns to the pool when the lease is
//! dropped, whichever way the probe ends.

use crate::config::AuxiliaryConfig;
use crate::tunnel::{port_is_free, ListenPorts};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
struct Inner {
    host: IpAddr,
    pairs: Vec<(u16, u16)>,
    claimed: Mutex<BTreeSet<u16>>,
}

/// Shared allocator over the auxiliary range
#[derive(Debug, Clone)]
pub struct AuxPortPool {
    inner: Arc<Inner>,
}

impl AuxPortPool {
    pub fn new(config: &AuxiliaryConfig) -> Self {
        let pairs = (0..config.pair_count())
            .map(|i| {
                let socks = config.port_start + (i as u16) * 2;
                (socks, socks + 1)
            })
            .collect();

        AuxPortPool {
            inner: Arc::new(Inner {
                host: config.host,
                pairs,
                claimed: Mutex::new(BTreeSet::new()),
            }),
        }
    }

    /// Total number of pairs in the range
    pub fn capacity(&self) -> usize {
        self.inner.pairs.len()
    }

    /// Number of pairs currently leased out
    pub fn in_use(&self) -> usize {
        self.inner.claimed.lock().len()
    }

    /// Claim the first pair that is neither leased nor bound by someone else
    pub fn claim(&self) -> Option<PortLease> {
        let mut claimed = self.inner.claimed.lock();
        for &(socks, http) in &self.inner.pairs {
            if claimed.contains(&socks) {
                continue;
            }
            if !port_is_free(self.inner.host, socks) || !port_is_free(self.inner.host, http) {
                debug!("Auxiliary pair {}/{} is bound externally, skipping", socks, http);
                continue;
            }
            claimed.insert(socks);
            return Some(PortLease {
                ports: ListenPorts::new(self.inner.host, socks, http),
                pool: self.inner.clone(),
            });
        }
        None
    }
}

/// Exclusive claim on one auxiliary pair
#[derive(Debug)]
pub struct PortLease {
    ports: ListenPorts,
    pool: Arc<Inner>,
}

impl PortLease {
    pub fn ports(&self) -> ListenPorts {
        self.ports
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.pool.claimed.lock().remove(&self.ports.socks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, TcpListener};

    /// A free even-aligned block of `len` ports on loopback
    fn free_range(len: u16) -> AuxiliaryConfig {
        for start in (40000u16..60000).step_by(usize::from(len) + 10) {
            if (start..start + len).all(|p| port_is_free(IpAddr::V4(Ipv4Addr::LOCALHOST), p)) {
                return AuxiliaryConfig {
                    host: IpAddr::V4(Ipv4Addr::LOCALHOST),
                    port_start: start,
                    port_end: start + len - 1,
                };
            }
        }
        panic!("no free port block");
    }

    #[test]
    fn test_claims_are_exclusive_and_released_on_drop() {
        let pool = AuxPortPool::new(&free_range(4));
        assert_eq!(pool.capacity(), 2);

        let a = pool.claim().unwrap();
        let b = pool.claim().unwrap();
        assert_ne!(a.ports().socks, b.ports().socks);
        assert_eq!(a.ports().http, a.ports().socks + 1);
        assert!(pool.claim().is_none());
        assert_eq!(pool.in_use(), 2);

        let released = a.ports();
        drop(a);
        assert_eq!(pool.in_use(), 1);
        let c = pool.claim().unwrap();
        assert_eq!(c.ports(), released);
    }

    #[test]
    fn test_skips_externally_bound_pair() {
        let config = free_range(4);
        let _squatter = TcpListener::bind(("127.0.0.1", config.port_start + 1)).unwrap();
        let pool = AuxPortPool::new(&config);

        let lease = pool.claim().unwrap();
        assert_eq!(lease.ports().socks, config.port_start + 2);
        assert!(pool.claim().is_none());
    }
}
