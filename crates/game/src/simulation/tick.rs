use log::warn;

/// Fixed cadence tick driver.
///
/// Each frame runs `while scheduler.consume_tick(now) { tick() }`, which
/// yields zero, one or several ticks depending on frame time. A backlog
/// longer than `max_backlog` seconds is dropped instead of replayed.
#[derive(Debug, Clone)]
pub struct TickScheduler {
    tick_rate: u32,
    interval: f64,
    next_tick_time: f64,
    max_backlog: f64,
}

impl TickScheduler {
    pub fn new(tick_rate: u32, max_backlog: f64) -> Self {
        assert!(tick_rate > 0, "tick rate must be positive");
        Self {
            tick_rate,
            interval: 1.0 / tick_rate as f64,
            next_tick_time: 0.0,
            max_backlog,
        }
    }

    pub fn tick_rate(&self) -> u32 {
        self.tick_rate
    }

    pub fn interval(&self) -> f64 {
        self.interval
    }

    pub fn set_tick_rate(&mut self, tick_rate: u32) {
        assert!(tick_rate > 0, "tick rate must be positive");
        self.tick_rate = tick_rate;
        self.interval = 1.0 / tick_rate as f64;
    }

    /// Schedules the first tick at `now`.
    pub fn reset(&mut self, now: f64) {
        self.next_tick_time = now;
    }

    pub fn consume_tick(&mut self, now: f64) -> bool {
        if now - self.next_tick_time > self.max_backlog {
            warn!(
                "tick loop {:.3}s behind, skipping ahead",
                now - self.next_tick_time
            );
            self.next_tick_time = now - self.max_backlog;
        }
        if now > self.next_tick_time {
            self.next_tick_time += self.interval;
            true
        } else {
            false
        }
    }

    /// Fraction of the way from the last tick to the next one.
    pub fn alpha(&self, now: f64) -> f64 {
        (1.0 - (self.next_tick_time - now) / self.interval).clamp(0.0, 1.0)
    }

    pub fn next_tick_time(&self) -> f64 {
        self.next_tick_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(scheduler: &mut TickScheduler, now: f64) -> u32 {
        let mut ticks = 0;
        while scheduler.consume_tick(now) {
            ticks += 1;
        }
        ticks
    }

    #[test]
    fn test_ticks_follow_wall_time() {
        let mut scheduler = TickScheduler::new(60, 0.25);
        scheduler.reset(0.0);

        assert_eq!(run(&mut scheduler, 0.001), 1);
        assert_eq!(run(&mut scheduler, 0.010), 0);
        assert_eq!(run(&mut scheduler, 0.040), 2);
    }

    #[test]
    fn test_backlog_is_clamped() {
        let mut scheduler = TickScheduler::new(10, 0.25);
        scheduler.reset(0.0);
        assert_eq!(run(&mut scheduler, 5.0), 3);
        assert!(scheduler.next_tick_time() > 5.0);
    }
}
