/// Position on a fixed tick timeline: whole ticks plus the time elapsed
/// since the last one, always shorter than one tick interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GameTime {
    pub tick_rate: u32,
    pub tick: u32,
    pub tick_duration: f64,
}

impl GameTime {
    pub fn new(tick_rate: u32) -> Self {
        assert!(tick_rate > 0, "tick rate must be positive");
        Self {
            tick_rate,
            tick: 0,
            tick_duration: 0.0,
        }
    }

    pub fn tick_interval(&self) -> f64 {
        1.0 / self.tick_rate as f64
    }

    pub fn set_tick_rate(&mut self, tick_rate: u32) {
        assert!(tick_rate > 0, "tick rate must be positive");
        self.tick_rate = tick_rate;
        self.tick_duration = self.tick_duration.min(self.tick_interval() * 0.999_999);
    }

    pub fn set_time(&mut self, tick: u32, tick_duration: f64) {
        self.tick = tick;
        self.tick_duration = 0.0;
        self.add_duration(tick_duration);
    }

    /// Advances by `duration` seconds, which may be negative, rolling whole
    /// ticks into `tick`.
    pub fn add_duration(&mut self, duration: f64) {
        let interval = self.tick_interval();
        let total = self.tick_duration + duration;
        let ticks = (total * self.tick_rate as f64).floor();
        self.tick = self.tick.wrapping_add_signed(ticks as i32);
        self.tick_duration = total - ticks * interval;

        if self.tick_duration >= interval {
            self.tick = self.tick.wrapping_add(1);
            self.tick_duration -= interval;
        }
        if self.tick_duration < 0.0 {
            self.tick_duration = 0.0;
        }
    }

    /// How far into the current tick we are, in `0.0..1.0`.
    pub fn tick_fraction(&self) -> f64 {
        self.tick_duration * self.tick_rate as f64
    }

    /// Seconds elapsed since the start of `tick`.
    pub fn duration_since_tick(&self, tick: u32) -> f64 {
        self.tick.wrapping_sub(tick) as i32 as f64 * self.tick_interval() + self.tick_duration
    }

    pub fn seconds(&self) -> f64 {
        self.tick as f64 * self.tick_interval() + self.tick_duration
    }
}
