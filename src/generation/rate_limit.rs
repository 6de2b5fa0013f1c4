use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::debug;

/// Sliding-window limiter: at most `max_calls` calls start in any `period`.
///
/// Blocking; a caller that would exceed the window sleeps until the oldest
/// call ages out.
#[derive(Debug)]
pub struct RateLimiter {
    max_calls: usize,
    period: Duration,
    calls: VecDeque<Instant>,
}

impl RateLimiter {
    #[inline]
    pub fn new(max_calls: usize, period: Duration) -> Self {
        Self {
            max_calls: max_calls.max(1),
            period,
            calls: VecDeque::with_capacity(max_calls),
        }
    }

    #[inline]
    pub fn max_calls(&self) -> usize {
        self.max_calls
    }

    #[inline]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// How long the next call would have to wait right now
    #[inline]
    pub fn delay_needed(&mut self) -> Duration {
        self.delay_at(Instant::now())
    }

    /// Record a call, sleeping first if the window is full
    #[inline]
    pub fn wait_if_needed(&mut self) {
        let delay = self.delay_needed();
        if !delay.is_zero() {
            debug!("Rate limit reached, sleeping {:?}", delay);
            std::thread::sleep(delay);
        }
        self.record(Instant::now());
    }

    fn delay_at(&mut self, now: Instant) -> Duration {
        while self
            .calls
            .front()
            .is_some_and(|&oldest| now.duration_since(oldest) >= self.period)
        {
            self.calls.pop_front();
        }

        if self.calls.len() < self.max_calls {
            return Duration::ZERO;
        }

        self.calls
            .front()
            .map_or(Duration::ZERO, |&oldest| {
                (oldest + self.period).saturating_duration_since(now)
            })
    }

    fn record(&mut self, at: Instant) {
        self.calls.push_back(at);
        while self.calls.len() > self.max_calls {
            self.calls.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_calls_under_the_limit() {
        let mut limiter = RateLimiter::new(3, Duration::from_secs(60));
        let start = Instant::now();

        for _ in 0..3 {
            limiter.wait_if_needed();
        }

        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn full_window_reports_remaining_time() {
        let mut limiter = RateLimiter::new(2, Duration::from_secs(60));
        let start = Instant::now();
        limiter.record(start);
        limiter.record(start);

        let delay = limiter.delay_at(start + Duration::from_secs(15));
        assert_eq!(delay, Duration::from_secs(45));
    }

    #[test]
    fn expired_calls_leave_the_window() {
        let mut limiter = RateLimiter::new(2, Duration::from_secs(60));
        let start = Instant::now();
        limiter.record(start);
        limiter.record(start + Duration::from_secs(30));

        assert_eq!(
            limiter.delay_at(start + Duration::from_secs(61)),
            Duration::ZERO
        );
        assert_eq!(limiter.calls.len(), 1);
    }

    #[test]
    fn blocks_until_oldest_call_ages_out() {
        let mut limiter = RateLimiter::new(1, Duration::from_millis(50));
        let start = Instant::now();

        limiter.wait_if_needed();
        limiter.wait_if_needed();

        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn zero_limit_is_treated_as_one() {
        let limiter = RateLimiter::new(0, Duration::from_secs(1));
        assert_eq!(limiter.max_calls(), 1);
    }
}
