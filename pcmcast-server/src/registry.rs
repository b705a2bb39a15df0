//! Client registry
//!
//! The set of UDP peers currently subscribed to the relay. Clients join with
//! `START` and leave with `STOP`; there is no liveness timeout, so a peer that
//! vanishes silently stays registered until a send to it fails during an
//! all-clients broadcast.
//!
//! Every operation takes the same lock and holds it only for one set
//! mutation or copy. Broadcast runs iterate a [`ClientRegistry::snapshot`],
//! never the live set.

use std::collections::HashSet;
use std::net::SocketAddr;
use tokio::sync::Mutex;

/// Concurrency-safe set of client addresses, shared by `Arc`
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: Mutex<HashSet<SocketAddr>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `addr`. Returns `true` if it was not registered before.
    pub async fn add(&self, addr: SocketAddr) -> bool {
        self.clients.lock().await.insert(addr)
    }

    /// Register `addr` and return whether it is new, along with the size
    /// after insertion, both observed under one lock.
    pub async fn add_counted(&self, addr: SocketAddr) -> (bool, usize) {
        let mut clients = self.clients.lock().await;
        let is_new = clients.insert(addr);
        (is_new, clients.len())
    }

    /// Unregister `addr`. Returns `true` if it was registered.
    pub async fn remove(&self, addr: &SocketAddr) -> bool {
        self.clients.lock().await.remove(addr)
    }

    /// Unregister `addr` and return whether it was present, along with the
    /// remaining size.
    pub async fn remove_counted(&self, addr: &SocketAddr) -> (bool, usize) {
        let mut clients = self.clients.lock().await;
        let removed = clients.remove(addr);
        (removed, clients.len())
    }

    /// Independent copy of the current membership
    pub async fn snapshot(&self) -> Vec<SocketAddr> {
        self.clients.lock().await.iter().copied().collect()
    }

    pub async fn size(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn contains(&self, addr: &SocketAddr) -> bool {
        self.clients.lock().await.contains(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let registry = ClientRegistry::new();

        assert!(registry.add(addr(5000)).await);
        assert_eq!(registry.size().await, 1);

        // Second add reports "not new" and leaves the size unchanged
        assert!(!registry.add(addr(5000)).await);
        assert_eq!(registry.size().await, 1);
    }

    #[tokio::test]
    async fn test_same_host_different_port_is_distinct() {
        let registry = ClientRegistry::new();

        assert!(registry.add(addr(5000)).await);
        assert!(registry.add(addr(5001)).await);
        assert_eq!(registry.size().await, 2);
    }

    #[tokio::test]
    async fn test_remove() {
        let registry = ClientRegistry::new();
        registry.add(addr(5000)).await;

        assert!(registry.remove(&addr(5000)).await);
        assert!(!registry.contains(&addr(5000)).await);

        // Removing an unknown address is a no-op
        assert!(!registry.remove(&addr(5000)).await);
        assert_eq!(registry.size().await, 0);
    }

    #[tokio::test]
    async fn test_counted_variants() {
        let registry = ClientRegistry::new();

        assert_eq!(registry.add_counted(addr(1)).await, (true, 1));
        assert_eq!(registry.add_counted(addr(2)).await, (true, 2));
        assert_eq!(registry.add_counted(addr(1)).await, (false, 2));
        assert_eq!(registry.remove_counted(&addr(1)).await, (true, 1));
        assert_eq!(registry.remove_counted(&addr(1)).await, (false, 1));
    }

    #[tokio::test]
    async fn test_snapshot_unaffected_by_later_removal() {
        let registry = ClientRegistry::new();
        for port in 1..=5 {
            registry.add(addr(port)).await;
        }

        let snapshot = registry.snapshot().await;
        let mut seen = Vec::new();
        for client in &snapshot {
            // Remove entries while iterating the snapshot
            registry.remove(client).await;
            registry.remove(&addr(3)).await;
            seen.push(*client);
        }

        seen.sort();
        assert_eq!(seen, (1..=5).map(addr).collect::<Vec<_>>());
        assert_eq!(registry.size().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_remove_during_snapshot_iteration() {
        let registry = Arc::new(ClientRegistry::new());
        for port in 1..=200 {
            registry.add(addr(port)).await;
        }

        let snapshot = registry.snapshot().await;

        let remover = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                for port in (1..=200).step_by(2) {
                    registry.remove(&addr(port)).await;
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut count = 0;
        for client in &snapshot {
            assert!(client.port() >= 1 && client.port() <= 200);
            count += 1;
            tokio::task::yield_now().await;
        }
        remover.await.unwrap();

        assert_eq!(count, 200);
        let mut unique = snapshot.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 200);
        assert_eq!(registry.size().await, 100);
    }
}
