use quanta::Instant;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds that advance `1 / time_scale` times as fast as
/// real time.
///
/// With `time_scale = 0.01` a scheduled one-hour delay fires after 36 real
/// seconds and `now_ms` moves one hour in the same span, so routing math
/// sees consistent time.
#[derive(Debug, Clone)]
pub struct Clock {
    origin: Instant,
    origin_ms: u64,
    scale: f64,
}

impl Clock {
    pub fn new(time_scale: f64) -> Self {
        let origin_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self::starting_at(origin_ms, time_scale)
    }

    pub fn starting_at(origin_ms: u64, time_scale: f64) -> Self {
        Self {
            origin: Instant::now(),
            origin_ms,
            scale: if time_scale > 0.0 { time_scale } else { 1.0 },
        }
    }

    pub fn now_ms(&self) -> u64 {
        let elapsed = self.origin.elapsed().as_secs_f64() * 1000.0 / self.scale;
        self.origin_ms + elapsed as u64
    }

    pub fn time_scale(&self) -> f64 {
        self.scale
    }

    /// Real duration corresponding to `delay` of simulated time.
    pub fn scaled(&self, delay: Duration) -> Duration {
        delay.mul_f64(self.scale)
    }

    /// Seconds since 2000-01-01, the bundle creation-time epoch.
    pub fn dtn_seconds(&self) -> u64 {
        self.now_ms().saturating_sub(dtn_wire::bundle::DTN_EPOCH_MS) / 1000
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accelerated_clock_runs_ahead() {
        let clock = Clock::starting_at(1_000_000, 0.001);
        std::thread::sleep(Duration::from_millis(20));
        // 20 ms real at 1000x is at least 20 s simulated
        assert!(clock.now_ms() >= 1_000_000 + 20_000);
    }

    #[test]
    fn scaled_delay() {
        let clock = Clock::starting_at(0, 0.5);
        assert_eq!(clock.scaled(Duration::from_secs(10)), Duration::from_secs(5));
    }

    #[test]
    fn non_positive_scale_falls_back() {
        assert_eq!(Clock::starting_at(0, 0.0).time_scale(), 1.0);
    }

    #[test]
    fn dtn_epoch() {
        let clock = Clock::starting_at(dtn_wire::bundle::DTN_EPOCH_MS + 5_500, 1.0);
        assert_eq!(clock.dtn_seconds(), 5);
    }
}
