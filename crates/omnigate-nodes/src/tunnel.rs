//! In-process view of the reverse tunnels nodes hold open to this worker.
//!
//! The manager's "has tunnel" answer is authoritative only for tunnels that
//! terminate in this worker; multi-worker deployments must not infer
//! offline from a missing local tunnel.

use std::collections::HashMap;
use std::sync::Mutex;

use time::OffsetDateTime;

#[derive(Debug, Clone)]
pub struct TunnelInfo {
    pub node_id: i64,
    pub opened_at: OffsetDateTime,
    pub requests_routed: u64,
}

#[derive(Default)]
pub struct TunnelManager {
    tunnels: Mutex<HashMap<i64, TunnelInfo>>,
}

impl TunnelManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tunnel_opened(&self, node_id: i64) {
        let mut tunnels = self.tunnels.lock().expect("tunnel map poisoned");
        tunnels.insert(
            node_id,
            TunnelInfo {
                node_id,
                opened_at: OffsetDateTime::now_utc(),
                requests_routed: 0,
            },
        );
    }

    pub fn tunnel_closed(&self, node_id: i64) -> bool {
        let mut tunnels = self.tunnels.lock().expect("tunnel map poisoned");
        tunnels.remove(&node_id).is_some()
    }

    pub fn has_tunnel(&self, node_id: i64) -> bool {
        let tunnels = self.tunnels.lock().expect("tunnel map poisoned");
        tunnels.contains_key(&node_id)
    }

    pub fn note_routed(&self, node_id: i64) {
        let mut tunnels = self.tunnels.lock().expect("tunnel map poisoned");
        if let Some(info) = tunnels.get_mut(&node_id) {
            info.requests_routed += 1;
        }
    }

    pub fn active(&self) -> Vec<TunnelInfo> {
        let tunnels = self.tunnels.lock().expect("tunnel map poisoned");
        tunnels.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_close_round_trip() {
        let manager = TunnelManager::new();
        assert!(!manager.has_tunnel(1));
        manager.tunnel_opened(1);
        assert!(manager.has_tunnel(1));
        manager.note_routed(1);
        assert_eq!(manager.active()[0].requests_routed, 1);
        assert!(manager.tunnel_closed(1));
        assert!(!manager.has_tunnel(1));
        assert!(!manager.tunnel_closed(1));
    }
}
