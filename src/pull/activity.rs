use std::collections::HashMap;

use crate::model::{LOCAL_CONN_ID, PeerConnection};

/// Outstanding request counters per peer, used to spread block fetches
/// over the peers that actually hold a file.
#[derive(Debug, Default)]
pub struct ActivityMap {
    outstanding: HashMap<String, usize>,
}

impl ActivityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Picks the connected peer with the fewest outstanding requests among
    /// those whose availability bit is set, skipping the local node. Ties
    /// break by iteration order of `connections`. The winner's counter is
    /// incremented.
    pub fn least_busy_peer(
        &mut self,
        availability: u64,
        connections: &[PeerConnection],
    ) -> Option<String> {
        let mut low = usize::MAX;
        let mut selected: Option<&str> = None;
        for conn in connections {
            if conn.id == LOCAL_CONN_ID || conn.id >= 64 {
                continue;
            }
            if availability & (1u64 << conn.id) == 0 {
                continue;
            }
            let usage = self.outstanding.get(&conn.name).copied().unwrap_or(0);
            if usage < low {
                low = usage;
                selected = Some(&conn.name);
            }
        }
        let peer = selected?.to_string();
        *self.outstanding.entry(peer.clone()).or_insert(0) += 1;
        Some(peer)
    }

    /// Saturating decrement, so a completion attributed to a stale peer
    /// can never drive the counter negative.
    pub fn decrease(&mut self, peer: &str) {
        if let Some(n) = self.outstanding.get_mut(peer) {
            *n = n.saturating_sub(1);
        }
    }

    pub fn outstanding(&self, peer: &str) -> usize {
        self.outstanding.get(peer).copied().unwrap_or(0)
    }

    /// True when no peer has requests in flight.
    pub fn is_idle(&self) -> bool {
        self.outstanding.values().all(|&n| n == 0)
    }
}
