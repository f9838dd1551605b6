use crate::routes::RouteTable;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Per-route traffic counters (bytes)
#[derive(Debug, Default)]
pub struct TrafficCounters {
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
    tunnels: AtomicU64,
}

impl TrafficCounters {
    /// Bytes received from clients.
    pub fn add_rx(&self, n: u64) { self.rx_bytes.fetch_add(n, Ordering::Relaxed); }
    /// Bytes sent back to clients.
    pub fn add_tx(&self, n: u64) { self.tx_bytes.fetch_add(n, Ordering::Relaxed); }
    pub fn add_tunnel(&self) { self.tunnels.fetch_add(1, Ordering::Relaxed); }
    pub fn rx(&self) -> u64 { self.rx_bytes.load(Ordering::Relaxed) }
    pub fn tx(&self) -> u64 { self.tx_bytes.load(Ordering::Relaxed) }
    pub fn tunnels(&self) -> u64 { self.tunnels.load(Ordering::Relaxed) }
}

/// Counters for every route, keyed by route path. Built once from the route
/// table, so lookups never insert.
#[derive(Debug, Default)]
pub struct TrafficRegistry {
    by_path: HashMap<String, Arc<TrafficCounters>>,
}

impl TrafficRegistry {
    pub fn for_routes(routes: &RouteTable) -> Self {
        let by_path = routes
            .entries()
            .iter()
            .map(|e| (e.path.clone(), Arc::new(TrafficCounters::default())))
            .collect();
        Self { by_path }
    }

    pub fn counters(&self, path: &str) -> Option<Arc<TrafficCounters>> {
        self.by_path.get(path).cloned()
    }

    /// Snapshot of all counters as (path, tunnels, rx, tx), sorted by path.
    pub fn snapshot(&self) -> Vec<(String, u64, u64, u64)> {
        let mut rows: Vec<_> = self
            .by_path
            .iter()
            .map(|(p, c)| (p.clone(), c.tunnels(), c.rx(), c.tx()))
            .collect();
        rows.sort();
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::{ProtocolKind, RouteEntry};

    #[test]
    fn counts_per_route() {
        let routes = RouteTable::new(vec![
            RouteEntry {
                path: "/a".into(),
                backend_port: 10000,
                kind: ProtocolKind::Vless,
                client_id: "id".into(),
            },
            RouteEntry {
                path: "/b".into(),
                backend_port: 10001,
                kind: ProtocolKind::Vmess,
                client_id: "id".into(),
            },
        ])
        .unwrap();
        let registry = TrafficRegistry::for_routes(&routes);

        let a = registry.counters("/a").unwrap();
        a.add_tunnel();
        a.add_rx(10);
        a.add_tx(20);
        assert!(registry.counters("/missing").is_none());

        assert_eq!(
            registry.snapshot(),
            vec![("/a".to_string(), 1, 10, 20), ("/b".to_string(), 0, 0, 0)]
        );
    }
}
