//! Server manager: the list of configured upstreams, which one is
//! active, and their latency/connection stats. Spec §4.5/§4.6.
//!
//! Ground: teacher `proxy.rs`'s `ClientProxyManager` (an `RwLock`-guarded
//! collection shared across tasks via `Arc`, mutated by message rather
//! than by direct concurrent writers) adapted from a connection table to
//! a small fixed server list; the override index is an `AtomicUsize`-backed
//! `Option` the way the teacher uses atomics for its connection-id counter.

use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use pegas_shared::{ServerDescriptor, ServerStats, StatDelta, StatKind, STAT_UNHEALTHY};

const NO_OVERRIDE: isize = -1;

/// Owns the immutable server list, the active-server selection, and
/// mutable per-server stats. Stats are written solely by
/// [`ServerManager::apply_delta`], called only from the helper thread
/// that drains the stat MPSC queue (spec §4.6: "per-server mutable
/// stats, single-writer via helper thread"); reads (by workers selecting
/// a server, or the control plane) may happen concurrently from any
/// thread.
pub struct ServerManager {
    servers: Vec<ServerDescriptor>,
    /// `-1` means no administrative override is in effect and
    /// [`Self::active_index`] falls back to [`Self::auto_index`]'s
    /// published lowest-g204-latency selection (spec §4.5: "default is
    /// lowest-g204-latency; ties broken by index").
    override_index: AtomicIsize,
    /// Lowest-g204-latency server index, recomputed and published by the
    /// single writer ([`Self::apply_delta`], called only from the helper
    /// thread) every time a stat changes. Workers sample this with a
    /// plain atomic load — no lock on the per-session hot path (spec
    /// §4.5/§5: "published as an atomically-readable integer ... no
    /// locks on the data path").
    auto_index: AtomicUsize,
    stats: Vec<RwLock<ServerStats>>,
}

pub type SharedServerManager = Arc<ServerManager>;

impl ServerManager {
    pub fn new(servers: Vec<ServerDescriptor>) -> Self {
        let stats = servers.iter().map(|_| RwLock::new(ServerStats::default())).collect();
        ServerManager {
            servers,
            override_index: AtomicIsize::new(NO_OVERRIDE),
            auto_index: AtomicUsize::new(0),
            stats,
        }
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn descriptor(&self, index: usize) -> Option<&ServerDescriptor> {
        self.servers.get(index)
    }

    pub fn descriptors(&self) -> &[ServerDescriptor] {
        &self.servers
    }

    /// Currently active server index: the administrative override if
    /// one was set via `set_active`, else the last-published
    /// lowest-g204-latency index (spec §4.5). Two plain atomic loads,
    /// no lock — workers sample this lock-free per new session.
    pub fn active_index(&self) -> usize {
        let override_idx = self.override_index.load(Ordering::Acquire);
        if override_idx >= 0 {
            return override_idx as usize;
        }
        self.auto_index.load(Ordering::Acquire)
    }

    /// Recomputes the lowest-g204-latency index and publishes it to
    /// [`Self::auto_index`]. Called after every stat change; only ever
    /// invoked from [`Self::apply_delta`] on the helper thread, so this
    /// is the data path's single writer.
    fn recompute_auto_index(&self) {
        let best = self
            .stats
            .iter()
            .map(|s| s.read().g204_delay_ms)
            .enumerate()
            .min_by_key(|&(idx, delay)| (delay, idx))
            .map(|(idx, _)| idx)
            .unwrap_or(0);
        self.auto_index.store(best, Ordering::Release);
    }

    /// Selects the active server descriptor. Spec §4.3: "select active
    /// server from server manager" happens once per accepted connection.
    pub fn active(&self) -> Option<&ServerDescriptor> {
        self.descriptor(self.active_index())
    }

    /// Sets the active server index, used by the control plane's
    /// `set_active` command. Returns false if `index` is out of range.
    pub fn set_active(&self, index: usize) -> bool {
        if index >= self.servers.len() {
            return false;
        }
        self.override_index.store(index as isize, Ordering::Release);
        true
    }

    pub fn stats(&self, index: usize) -> Option<ServerStats> {
        self.stats.get(index).map(|s| *s.read())
    }

    pub fn all_stats(&self) -> Vec<ServerStats> {
        self.stats.iter().map(|s| *s.read()).collect()
    }

    /// Applies one delta drained from the stat MPSC queue. `ConnectDelay`
    /// and `G204Delay` are absolute latest-probe values (possibly
    /// [`STAT_UNHEALTHY`] on a failed probe); `ConnCount` is additive,
    /// incremented by sessions as they connect.
    pub fn apply_delta(&self, delta: StatDelta) {
        let Some(slot) = self.stats.get(delta.server_idx) else { return };
        let recompute = matches!(delta.kind, StatKind::G204Delay);
        {
            let mut stats = slot.write();
            match delta.kind {
                StatKind::ConnectDelay => {
                    stats.connect_delay_ms = delta.value;
                    stats.last_checked_ms = crate::logging::now_ms();
                }
                StatKind::G204Delay => {
                    stats.g204_delay_ms = delta.value;
                    stats.last_checked_ms = crate::logging::now_ms();
                }
                StatKind::ConnCount => stats.conn_count = stats.conn_count.saturating_add(delta.value),
            }
        }
        if recompute {
            self.recompute_auto_index();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pegas_shared::ServerType;

    fn descriptor(address: &str) -> ServerDescriptor {
        ServerDescriptor {
            address: address.to_string(),
            port: 443,
            server_type: ServerType::V2rayWs,
            sni: None,
            password_or_uuid: "3f6f8e9a-0000-0000-0000-000000000000".into(),
            ws_path: Some("/ray".into()),
            tls_insecure: false,
        }
    }

    #[test]
    fn defaults_to_index_zero_with_no_probes_yet() {
        let mgr = ServerManager::new(vec![descriptor("a"), descriptor("b")]);
        assert_eq!(mgr.active_index(), 0);
    }

    #[test]
    fn auto_selects_lowest_g204_latency() {
        let mgr = ServerManager::new(vec![descriptor("a"), descriptor("b"), descriptor("c")]);
        mgr.apply_delta(StatDelta {
            server_idx: 0,
            kind: StatKind::G204Delay,
            value: 200,
        });
        mgr.apply_delta(StatDelta {
            server_idx: 1,
            kind: StatKind::G204Delay,
            value: 50,
        });
        mgr.apply_delta(StatDelta {
            server_idx: 2,
            kind: StatKind::G204Delay,
            value: STAT_UNHEALTHY,
        });
        assert_eq!(mgr.active_index(), 1);
    }

    #[test]
    fn override_wins_over_auto_selection() {
        let mgr = ServerManager::new(vec![descriptor("a"), descriptor("b")]);
        mgr.apply_delta(StatDelta {
            server_idx: 1,
            kind: StatKind::G204Delay,
            value: 5,
        });
        assert_eq!(mgr.active_index(), 1); // auto picks b

        assert!(mgr.set_active(0));
        assert_eq!(mgr.active_index(), 0); // override pins a
        assert!(!mgr.set_active(5));
    }

    #[test]
    fn apply_delta_updates_matching_slot_only() {
        let mgr = ServerManager::new(vec![descriptor("a"), descriptor("b")]);
        mgr.apply_delta(StatDelta {
            server_idx: 1,
            kind: StatKind::ConnectDelay,
            value: 42,
        });
        assert_eq!(mgr.stats(0).unwrap().connect_delay_ms, 0);
        assert_eq!(mgr.stats(1).unwrap().connect_delay_ms, 42);
    }

    #[test]
    fn conn_count_accumulates() {
        let mgr = ServerManager::new(vec![descriptor("a")]);
        mgr.apply_delta(StatDelta {
            server_idx: 0,
            kind: StatKind::ConnCount,
            value: 1,
        });
        mgr.apply_delta(StatDelta {
            server_idx: 0,
            kind: StatKind::ConnCount,
            value: 1,
        });
        assert_eq!(mgr.stats(0).unwrap().conn_count, 2);
    }

    #[test]
    fn failed_probe_records_unhealthy_sentinel() {
        let mgr = ServerManager::new(vec![descriptor("a")]);
        mgr.apply_delta(StatDelta {
            server_idx: 0,
            kind: StatKind::ConnectDelay,
            value: STAT_UNHEALTHY,
        });
        assert_eq!(mgr.stats(0).unwrap().connect_delay_ms, STAT_UNHEALTHY);
    }
}
