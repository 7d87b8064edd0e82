// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Port allocation for preview dev servers.
//!
//! A reservation row can outlive the process that held it, and an unrelated
//! program may hold a port we never reserved, so every candidate is checked
//! against both the reservation table and a real bind on each interface.

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::PreviewError;
use crate::store::Store;

const PROBE_ADDRS: [IpAddr; 4] = [
    IpAddr::V4(Ipv4Addr::LOCALHOST),
    IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    IpAddr::V6(Ipv6Addr::LOCALHOST),
    IpAddr::V6(Ipv6Addr::UNSPECIFIED),
];

/// Whether nothing is listening on `port` on any local interface.
///
/// Interfaces the host does not have (no IPv6) count as free.
pub fn is_port_free(port: u16) -> bool {
    PROBE_ADDRS.iter().all(|ip| {
        match TcpListener::bind(SocketAddr::new(*ip, port)) {
            Ok(_) => true,
            Err(e) => matches!(
                e.kind(),
                ErrorKind::AddrNotAvailable | ErrorKind::Unsupported
            ) || e.raw_os_error() == Some(EAFNOSUPPORT),
        }
    })
}

#[cfg(target_os = "linux")]
const EAFNOSUPPORT: i32 = 97;
#[cfg(not(target_os = "linux"))]
const EAFNOSUPPORT: i32 = 47;

/// Hands out ports from an inclusive range. Cheap to clone.
#[derive(Clone)]
pub struct PortAllocator {
    store: Store,
    range: (u16, u16),
    lock: Arc<Mutex<()>>,
}

impl PortAllocator {
    pub fn new(store: Store, range: (u16, u16)) -> Self {
        let (a, b) = range;
        Self {
            store,
            range: (a.min(b), a.max(b)),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn range(&self) -> (u16, u16) {
        self.range
    }

    /// Reserve the first usable port for `preview_id`.
    ///
    /// Probe, reserve, then probe again; a port that became busy in between
    /// is released and the scan moves on.
    pub async fn allocate(&self, preview_id: &str) -> Result<u16, PreviewError> {
        let _guard = self.lock.lock().await;
        let (start, end) = self.range;
        for port in start..=end {
            if self.store.port_owner(port).await?.is_some() {
                continue;
            }
            if !is_port_free(port) {
                debug!(port, "Port busy outside the reservation table");
                continue;
            }
            if !self.store.reserve_port(port, preview_id).await? {
                continue;
            }
            if !is_port_free(port) {
                self.store.release_port(port).await?;
                continue;
            }
            debug!(port, preview_id, "Allocated port");
            return Ok(port);
        }
        Err(PreviewError::PortRangeExhausted { start, end })
    }

    /// Release one port. Unreserved ports are ignored.
    pub async fn release(&self, port: u16) -> Result<(), PreviewError> {
        self.store.release_port(port).await?;
        Ok(())
    }

    /// Release everything held by `preview_id`.
    pub async fn release_for(&self, preview_id: &str) -> Result<usize, PreviewError> {
        Ok(self.store.release_ports_for(preview_id).await?)
    }

    /// Free reservations whose preview is gone or already terminal.
    pub async fn reclaim_stale(&self) -> Result<Vec<u16>, PreviewError> {
        let _guard = self.lock.lock().await;
        let mut reclaimed = Vec::new();
        for allocation in self.store.list_port_allocations().await? {
            let stale = match self.store.find_preview(&allocation.preview_id).await? {
                Some(preview) => preview.status.is_terminal(),
                None => true,
            };
            if stale {
                self.store.release_port(allocation.port).await?;
                reclaimed.push(allocation.port);
            }
        }
        if !reclaimed.is_empty() {
            info!(ports = ?reclaimed, "Reclaimed stale port reservations");
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AgentKind, PreviewStatus, RefType};

    /// A small range unlikely to collide with other tests.
    fn free_range(len: u16) -> (u16, u16) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let base = listener.local_addr().unwrap().port();
        drop(listener);
        let start = base.clamp(20_000, 60_000 - len);
        (start, start + len - 1)
    }

    #[tokio::test]
    async fn test_allocate_skips_reserved_and_bound() {
        let store = Store::open_in_memory().unwrap();
        let (start, end) = free_range(3);
        let allocator = PortAllocator::new(store.clone(), (start, end));

        store.reserve_port(start, "other").await.unwrap();
        let first = allocator.allocate("p1").await.unwrap();
        assert_ne!(first, start);
        assert_eq!(store.port_owner(first).await.unwrap().as_deref(), Some("p1"));

        allocator.release(first).await.unwrap();
        allocator.release(first).await.unwrap();
        assert_eq!(store.port_owner(first).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_range_exhausted() {
        let store = Store::open_in_memory().unwrap();
        let (start, end) = free_range(2);
        let allocator = PortAllocator::new(store, (start, end));
        allocator.allocate("a").await.unwrap();
        allocator.allocate("b").await.unwrap();
        let err = allocator.allocate("c").await.unwrap_err();
        assert!(matches!(
            err,
            PreviewError::PortRangeExhausted { start: s, end: e } if s == start && e == end
        ));
    }

    #[tokio::test]
    async fn test_bound_port_is_not_free() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!is_port_free(port));
    }

    #[tokio::test]
    async fn test_reclaim_stale() {
        let store = Store::open_in_memory().unwrap();
        store.create_execution("E1", AgentKind::Claude, "p").await.unwrap();
        store.insert_preview("live", "E1", RefType::Mutate, "app").await.unwrap();
        store.insert_preview("dead", "E1", RefType::Mutate, "web").await.unwrap();
        store
            .update_preview_status("dead", PreviewStatus::Failed, Some("crashed"))
            .await
            .unwrap();
        store.reserve_port(41001, "live").await.unwrap();
        store.reserve_port(41002, "dead").await.unwrap();
        store.reserve_port(41003, "missing").await.unwrap();

        let allocator = PortAllocator::new(store.clone(), (41001, 41003));
        let mut reclaimed = allocator.reclaim_stale().await.unwrap();
        reclaimed.sort();
        assert_eq!(reclaimed, vec![41002, 41003]);
        assert_eq!(store.port_owner(41001).await.unwrap().as_deref(), Some("live"));
    }
}
