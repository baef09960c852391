// Copyright 2025 The fragwatch Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Cooldown gate for topology walks.
//!
//! A walk reads live allocator structures, so sampling is throttled to a configurable
//! cooldown. The gate is a single atomic timestamp updated with compare-exchange: a race
//! between concurrent callers may grant or suppress one extra sample, which is acceptable,
//! but it can never panic or observe unconfigured cooldown state.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use crate::config::Config;

/// Sentinel for "no sample recorded yet".
const NEVER: u64 = u64::MAX;

pub struct SampleRateLimiter {
    cooldown: Duration,
    /// Conversion base for `last_ns`; captured at construction so timestamps fit in a u64.
    epoch: Instant,
    /// Nanoseconds since `epoch` of the last allowed sample, or `NEVER`.
    last_ns: AtomicU64,
}

impl SampleRateLimiter {
    /// A zero `cooldown` disables throttling entirely.
    pub fn new(cooldown: Duration) -> Self {
        SampleRateLimiter {
            cooldown,
            epoch: Instant::now(),
            last_ns: AtomicU64::new(NEVER),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.sample_cooldown())
    }

    /// Returns true if a sample may be taken at `now`, recording `now` as the latest
    /// sample time if so.
    pub fn allow_sample(&self, now: Instant) -> bool {
        let now_ns = (now.saturating_duration_since(self.epoch).as_nanos() as u64).min(NEVER - 1);
        if self.cooldown.is_zero() {
            self.last_ns.store(now_ns, Ordering::Relaxed);
            return true;
        }
        let cooldown_ns = u64::try_from(self.cooldown.as_nanos()).unwrap_or(u64::MAX);
        let mut last = self.last_ns.load(Ordering::Relaxed);
        loop {
            if last != NEVER && now_ns.saturating_sub(last) < cooldown_ns {
                return false;
            }
            match self.last_ns.compare_exchange_weak(
                last,
                now_ns,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => last = observed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn first_sample_always_allowed() {
        let limiter = SampleRateLimiter::new(Duration::from_secs(60));
        assert!(limiter.allow_sample(Instant::now()));
    }

    #[test]
    fn denies_within_cooldown_then_allows() {
        let limiter = SampleRateLimiter::new(Duration::from_secs(2));
        let t0 = Instant::now();
        assert!(limiter.allow_sample(t0));
        assert!(!limiter.allow_sample(t0 + Duration::from_millis(500)));
        assert!(!limiter.allow_sample(t0 + Duration::from_millis(1999)));
        assert!(limiter.allow_sample(t0 + Duration::from_secs(2)));
        // The window restarts from the allowed sample.
        assert!(!limiter.allow_sample(t0 + Duration::from_secs(3)));
    }

    #[test]
    fn zero_cooldown_is_unlimited() {
        let limiter = SampleRateLimiter::new(Duration::ZERO);
        let t0 = Instant::now();
        for _ in 0..100 {
            assert!(limiter.allow_sample(t0));
        }
    }

    #[test]
    fn absent_config_is_unlimited() {
        let limiter = SampleRateLimiter::from_config(&Config::default());
        let t0 = Instant::now();
        assert!(limiter.allow_sample(t0));
        assert!(limiter.allow_sample(t0));
    }

    #[test]
    fn concurrent_callers_grant_exactly_one_sample_per_window() {
        let limiter = Arc::new(SampleRateLimiter::new(Duration::from_secs(60)));
        let now = Instant::now();
        let granted: usize = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                thread::spawn(move || usize::from(limiter.allow_sample(now)))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .sum();
        assert_eq!(granted, 1);
    }
}
