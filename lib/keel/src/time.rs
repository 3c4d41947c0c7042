use std::time::{Duration, Instant, SystemTime};

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01)
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs()
}

/// Returns the current unix timestamp in milliseconds.
#[inline]
pub fn timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_millis() as u64
}

/// Monotonic tick source for the main loop. Each `advance` call reports how
/// many whole tick intervals elapsed since the last call, so a slow loop
/// iteration catches up instead of silently dropping ticks.
pub struct Clock {
    interval: Duration,
    last: Instant,
}

impl Clock {
    #[inline]
    pub fn new(interval: Duration) -> Clock {
        Clock {
            interval,
            last: Instant::now(),
        }
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Number of tick intervals elapsed since the previous call.
    pub fn advance(&mut self, now: Instant) -> u64 {
        let elapsed = now.duration_since(self.last);

        if elapsed < self.interval {
            return 0;
        }

        let ticks = elapsed.as_millis() / self.interval.as_millis().max(1);
        self.last += self.interval * ticks as u32;
        ticks as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_counts_whole_intervals() {
        let start = Instant::now();
        let mut clock = Clock::new(Duration::from_millis(100));
        clock.last = start;

        assert_eq!(clock.advance(start + Duration::from_millis(50)), 0);
        assert_eq!(clock.advance(start + Duration::from_millis(250)), 2);
        // The residual 50ms carries over to the next call.
        assert_eq!(clock.advance(start + Duration::from_millis(310)), 1);
    }
}
