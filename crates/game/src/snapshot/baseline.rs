use crate::net::{tick_diff, tick_greater_than};

/// Picks the delta baseline for a connection.
///
/// A client that acked nothing, or whose newest ack is about to leave the
/// snapshot ring, gets a full snapshot.
pub fn select_baseline(server_sequence: u32, max_snapshot_ack: Option<u32>, cache_size: usize) -> Option<u32> {
    let ack = max_snapshot_ack?;
    let age = tick_diff(server_sequence, ack);
    if age < 0 || age >= cache_size as i64 - 2 {
        None
    } else {
        Some(ack)
    }
}

/// Snapshot carried by each recently sent package and whether it was acked.
///
/// Two parallel rings indexed by package sequence.
#[derive(Debug)]
pub struct AckHistory {
    snapshot_seqs: Vec<Option<u32>>,
    snapshot_acks: Vec<bool>,
}

impl AckHistory {
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two() && capacity <= 1 << 16,
            "ack history capacity {capacity} must be a power of two no larger than 65536"
        );
        Self {
            snapshot_seqs: vec![None; capacity],
            snapshot_acks: vec![false; capacity],
        }
    }

    fn index(&self, package: u16) -> usize {
        package as usize & (self.snapshot_seqs.len() - 1)
    }

    /// Records a sent package. Packages without a snapshot clear their slot.
    pub fn record_sent(&mut self, package: u16, snapshot: Option<u32>) {
        let index = self.index(package);
        self.snapshot_seqs[index] = snapshot;
        self.snapshot_acks[index] = false;
    }

    pub fn acknowledge(&mut self, package: u16) {
        let index = self.index(package);
        self.snapshot_acks[index] = true;
    }

    pub fn is_acked(&self, package: u16) -> bool {
        self.snapshot_acks[self.index(package)]
    }

    /// Finds two acknowledged snapshots older than `baseline` for prediction.
    ///
    /// Walks backwards from the newest sent package, taking each acked
    /// snapshot that is strictly older than the last one taken, so repeats
    /// of the same snapshot are skipped. Snapshots too old to still be in a
    /// ring of `cache_size` are ignored. Prediction needs both, so a single
    /// hit yields `None`.
    pub fn select_baselines(
        &self,
        newest_package: u16,
        baseline: u32,
        server_sequence: u32,
        cache_size: usize,
    ) -> Option<(u32, u32)> {
        let mut found = [0u32; 2];
        let mut count = 0;
        let mut last = baseline;

        for age in 0..self.snapshot_seqs.len() {
            let index = self.index(newest_package.wrapping_sub(age as u16));
            if !self.snapshot_acks[index] {
                continue;
            }
            let Some(snapshot) = self.snapshot_seqs[index] else {
                continue;
            };
            if !tick_greater_than(last, snapshot) {
                continue;
            }
            if tick_diff(server_sequence, snapshot) >= cache_size as i64 - 2 {
                continue;
            }

            found[count] = snapshot;
            count += 1;
            last = snapshot;
            if count == 2 {
                return Some((found[0], found[1]));
            }
        }
        None
    }
}
