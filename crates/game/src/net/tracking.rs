use super::protocol::{ACK_WINDOW, sequence_diff};

/// How an incoming package sequence relates to what was received before.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// Newest package so far; `skipped` packages in between never arrived (yet).
    Newer { skipped: u32 },
    OutOfOrder,
    Duplicate,
    /// Older than the ack window, can no longer be acknowledged.
    Stale,
}

impl Arrival {
    pub fn accepted(self) -> bool {
        matches!(self, Arrival::Newer { .. } | Arrival::OutOfOrder)
    }
}

/// Received package sequences relative to the newest one, reported back to
/// the peer as `(ack_sequence, ack_mask)`.
#[derive(Debug, Default)]
pub struct ReceiveWindow {
    latest: Option<u16>,
    mask: u64,
}

impl ReceiveWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<u16> {
        self.latest
    }

    pub fn record(&mut self, sequence: u16) -> Arrival {
        let Some(latest) = self.latest else {
            self.latest = Some(sequence);
            self.mask = 1;
            return Arrival::Newer { skipped: 0 };
        };

        let diff = sequence_diff(sequence, latest);
        if diff > 0 {
            let shift = diff as u32;
            self.mask = if shift as usize >= ACK_WINDOW {
                1
            } else {
                (self.mask << shift) | 1
            };
            self.latest = Some(sequence);
            return Arrival::Newer { skipped: shift - 1 };
        }

        let age = (-diff) as usize;
        if age >= ACK_WINDOW {
            return Arrival::Stale;
        }

        let bit = 1u64 << age;
        if self.mask & bit != 0 {
            Arrival::Duplicate
        } else {
            self.mask |= bit;
            Arrival::OutOfOrder
        }
    }

    /// Bit `i` of the mask is set when `ack_sequence - i` was received.
    pub fn ack_data(&self) -> (u16, u64) {
        (self.latest.unwrap_or(0), self.mask)
    }
}

/// Smoothed round trip estimate.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: f32,
    rtt_var: f32,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RttEstimator {
    pub fn new() -> Self {
        Self {
            srtt: 100.0,
            rtt_var: 50.0,
        }
    }

    pub fn sample(&mut self, rtt_ms: f32) {
        const ALPHA: f32 = 0.125;
        const BETA: f32 = 0.25;

        let diff = (rtt_ms - self.srtt).abs();
        self.rtt_var = (1.0 - BETA) * self.rtt_var + BETA * diff;
        self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * rtt_ms;
    }

    pub fn srtt(&self) -> f32 {
        self.srtt
    }

    pub fn rtt_var(&self) -> f32 {
        self.rtt_var
    }
}
