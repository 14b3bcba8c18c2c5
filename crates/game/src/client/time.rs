use log::{debug, warn};

use crate::config::ReconciliationConfig;
use crate::net::{DEFAULT_TICK_RATE, tick_diff, tick_greater_than};
use crate::simulation::GameTime;

/// What the client knows about the server clock this frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeSync {
    pub tick_rate: u32,
    /// Tick of the newest accepted snapshot.
    pub server_time: u32,
    pub time_since_snapshot_ms: f64,
    pub rtt_ms: f64,
    /// Commands waiting on the server, once an acked package tells us.
    pub buffered_commands: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimelineCounters {
    pub hard_catchups: u32,
    pub hard_slowdowns: u32,
    pub render_catchups: u32,
}

/// The client's two clocks.
///
/// Predicted time runs ahead of the server by the round trip plus a few
/// buffered commands and is what input is sampled for. Render time trails
/// the newest snapshot and never passes it.
#[derive(Debug, Clone)]
pub struct ClientTimeline {
    config: ReconciliationConfig,
    predicted: GameTime,
    render: GameTime,
    counters: TimelineCounters,
    started: bool,
}

impl ClientTimeline {
    pub fn new(config: ReconciliationConfig) -> Self {
        Self {
            config,
            predicted: GameTime::new(DEFAULT_TICK_RATE),
            render: GameTime::new(DEFAULT_TICK_RATE),
            counters: TimelineCounters::default(),
            started: false,
        }
    }

    pub fn predicted(&self) -> &GameTime {
        &self.predicted
    }

    pub fn render(&self) -> &GameTime {
        &self.render
    }

    pub fn counters(&self) -> TimelineCounters {
        self.counters
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn reset(&mut self) {
        self.started = false;
        self.counters = TimelineCounters::default();
    }

    pub fn set_predicted(&mut self, tick: u32, duration: f64) {
        self.predicted.set_time(tick, duration);
    }

    pub fn set_render(&mut self, tick: u32, duration: f64) {
        self.render.set_time(tick, duration);
    }

    fn preferred_tick(&self, sync: &TimeSync) -> u32 {
        let lead = (sync.time_since_snapshot_ms + sync.rtt_ms) / 1000.0 * sync.tick_rate as f64;
        sync.server_time
            .wrapping_add(lead.round() as i64 as u32)
            .wrapping_add(self.config.preferred_buffered_commands)
    }

    /// Frame time scale nudging the server side command buffer toward the
    /// preferred size.
    fn drift_scale(&self, sync: &TimeSync) -> f64 {
        let preferred = self.config.preferred_buffered_commands as i64;
        match sync.buffered_commands {
            Some(buffered) if buffered < preferred => 1.0 + self.config.drift_correction,
            Some(buffered) if buffered > preferred => 1.0 - self.config.drift_correction,
            _ => 1.0,
        }
    }

    /// Advances both clocks by one frame and corrects them against `sync`.
    pub fn update(&mut self, frame_duration: f64, sync: &TimeSync) {
        if self.predicted.tick_rate != sync.tick_rate {
            self.predicted.set_tick_rate(sync.tick_rate);
            self.render.set_tick_rate(sync.tick_rate);
        }

        if !self.started {
            self.started = true;
            let preferred = self.preferred_tick(sync);
            self.predicted.set_time(preferred, 0.0);
            self.render.set_time(sync.server_time, 0.0);
            debug!(
                "timeline started at predicted tick {preferred}, server tick {}",
                sync.server_time
            );
            return;
        }

        self.predicted.add_duration(frame_duration * self.drift_scale(sync));

        let preferred = self.preferred_tick(sync);
        let offset = tick_diff(self.predicted.tick, preferred);
        if offset < -self.config.hard_catchup_ticks {
            warn!(
                "hard catchup: predicted tick {} is {} behind {preferred}",
                self.predicted.tick, -offset
            );
            self.predicted.set_time(preferred, 0.0);
            self.counters.hard_catchups += 1;
        } else if offset > self.config.hard_slowdown_ticks {
            warn!(
                "hard slowdown: predicted tick {} is {offset} ahead of {preferred}",
                self.predicted.tick
            );
            self.predicted.set_time(preferred, 0.0);
            self.counters.hard_slowdowns += 1;
        }

        self.render.add_duration(frame_duration);
        self.clamp_render(sync.server_time);

        let behind = tick_diff(sync.server_time, self.render.tick);
        if behind > self.config.render_catchup_ticks {
            let target = sync
                .server_time
                .wrapping_sub(self.config.render_catchup_target_ticks as u32);
            warn!(
                "render time {} ticks behind server tick {}, snapping to {target}",
                behind, sync.server_time
            );
            self.render.set_time(target, 0.0);
            self.counters.render_catchups += 1;
        } else if behind > 1 {
            self.render.add_duration(frame_duration * self.config.render_nudge);
            self.clamp_render(sync.server_time);
        }
    }

    fn clamp_render(&mut self, server_time: u32) {
        let past = tick_greater_than(self.render.tick, server_time)
            || (self.render.tick == server_time && self.render.tick_duration > 0.0);
        if past {
            self.render.set_time(server_time, 0.0);
        }
    }
}
