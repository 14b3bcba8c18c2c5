use std::fmt::Write as _;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::transport::ConnectionId;

/// Artificial network conditions applied by in-memory transports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacketLossSimulation {
    pub enabled: bool,
    pub loss_percent: f32,
    /// Delay, in transport updates, before a datagram is handed to the receiver.
    pub min_delay_updates: u32,
    pub max_delay_updates: u32,
}

impl PacketLossSimulation {
    pub fn lossy(loss_percent: f32) -> Self {
        Self {
            enabled: true,
            loss_percent,
            ..Default::default()
        }
    }

    pub fn should_drop<R: Rng>(&self, rng: &mut R) -> bool {
        if !self.enabled || self.loss_percent <= 0.0 {
            return false;
        }
        rng.gen_range(0.0..100.0) < self.loss_percent
    }

    /// Random delay between the bounds; different delays reorder datagrams.
    pub fn delay_updates<R: Rng>(&self, rng: &mut R) -> u32 {
        if !self.enabled || self.max_delay_updates == 0 {
            return 0;
        }
        let max = self.max_delay_updates.max(self.min_delay_updates);
        rng.gen_range(self.min_delay_updates..=max)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionCounters {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub packages_in: u64,
    pub packages_out: u64,
    pub packages_lost_in: u64,
    pub packages_lost_out: u64,
    pub packages_out_of_order_in: u64,
    pub packages_stale_in: u64,
    pub packages_duplicate_in: u64,
    pub packages_invalid_in: u64,
    pub fragmented_packages_in: u64,
    pub fragmented_packages_out: u64,
    /// Packages dropped before sending because they exceeded the fragment limit.
    pub packages_oversized_out: u64,
    /// Snapshots left out of a package because they did not fit.
    pub snapshots_skipped_out: u64,
}

/// One row of the periodic connection statistics table.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionStats {
    pub id: ConnectionId,
    pub rtt_ms: f32,
    pub in_sequence: u16,
    pub in_sequence_time_ms: u64,
    pub out_sequence: u16,
    pub out_sequence_ack: u16,
    pub counters: ConnectionCounters,
}

pub fn format_stats_table(rows: &[ConnectionStats]) -> String {
    let mut out = format!(
        "   {:>2} {:<5} {:<5} {:<5} {:<5} {:<5} {:<5} {:<5} {:<5} {:<5}",
        "ID", "RTT", "ISEQ", "ITIM", "OSEQ", "OACK", "PLI", "PLO", "POOI", "PSI"
    );
    for row in rows {
        let _ = write!(
            out,
            "\n   {:02} {:>5} {:>5} {:>5} {:>5} {:>5} {:>5} {:>5} {:>5} {:>5}",
            row.id.0,
            row.rtt_ms.round() as u32,
            row.in_sequence,
            row.in_sequence_time_ms,
            row.out_sequence,
            row.out_sequence_ack,
            row.counters.packages_lost_in,
            row.counters.packages_lost_out,
            row.counters.packages_out_of_order_in,
            row.counters.packages_stale_in,
        );
    }
    out
}
