//! Keepalive supervision.
//!
//! The server probes connections that have been silent for `ping_after`
//! with an unsolicited `ping`, and drops them once they have been silent
//! for `ping_after + timeout`. Any inbound byte resets the cycle.
//!
//! The eviction notice gets one non-blocking flush before the socket is
//! closed; a client that is not reading may never see it.

use crate::protocol::Response;
use crate::runtime::connection::ConnectionTable;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Probe and eviction thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepalivePolicy {
    pub ping_after: Duration,
    pub timeout: Duration,
}

impl Default for KeepalivePolicy {
    fn default() -> Self {
        Self {
            ping_after: Duration::from_secs(5),
            timeout: Duration::from_secs(5),
        }
    }
}

/// What the supervisor does with one connection on one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    Probe,
    Evict,
}

/// Decide the fate of a connection last heard from at `last_seen`.
pub fn check(
    last_seen: Instant,
    awaiting_pong: bool,
    now: Instant,
    policy: &KeepalivePolicy,
) -> Verdict {
    let idle = now.saturating_duration_since(last_seen);
    if idle >= policy.ping_after && !awaiting_pong {
        Verdict::Probe
    } else if idle >= policy.ping_after + policy.timeout {
        Verdict::Evict
    } else {
        Verdict::Healthy
    }
}

/// Counts from one supervisory pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub probed: usize,
    pub evicted: usize,
}

/// Run one pass over every live connection.
pub fn sweep(table: &mut ConnectionTable, now: Instant, policy: &KeepalivePolicy) -> SweepStats {
    let mut stats = SweepStats::default();

    for conn_id in table.handles() {
        let Some(conn) = table.get(conn_id) else {
            continue;
        };

        match check(conn.last_seen(), conn.awaiting_pong(), now, policy) {
            Verdict::Healthy => {}
            Verdict::Probe => {
                debug!(conn_id, peer = %conn.identity(), "Probing idle client");
                if table.deliver(conn_id, Response::ping()) {
                    if let Some(conn) = table.get_mut(conn_id) {
                        conn.probe_sent();
                    }
                    stats.probed += 1;
                }
            }
            Verdict::Evict => {
                warn!(conn_id, peer = %conn.identity(), "Client timed out");
                if table.deliver(conn_id, Response::timed_out()) {
                    table.close(conn_id);
                }
                stats.evicted += 1;
            }
        }
    }

    stats
}
