// Copyright 2024 TSDB Project Authors. Licensed under Apache-2.0.

//! Adaptive per-endpoint concurrency limiting
//!
//! The limiter is consulted before every rpc. A denied acquisition either
//! blocks until a slot frees up or fails fast with a flow control error,
//! depending on `RpcOptions.block_on_limit`.

use std::{
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::{Duration, Instant},
};

use tokio::sync::Notify;
use tracing::info;

use crate::{
    config::{LimitKind, RpcOptions},
    errors::{Error, Result},
};

const MIN_LIMIT: usize = 1;

/// TCP Vegas style limit adjustment.
///
/// Tracks the minimum observed rtt as the uncongested baseline and
/// estimates the queue depth from the smoothed rtt. The limit grows while
/// the estimate stays under `alpha` and shrinks when it exceeds `beta`.
struct Vegas {
    limit: AtomicUsize,
    max_limit: usize,
    min_rtt_nanos: AtomicU64,
    smoothed_rtt_nanos: AtomicU64,
    sample_count: AtomicUsize,
    alpha: usize,
    beta: usize,
    min_samples: usize,
    smoothing: f64,
}

impl Vegas {
    fn new(initial_limit: usize, max_limit: usize) -> Self {
        Self {
            limit: AtomicUsize::new(initial_limit.clamp(MIN_LIMIT, max_limit)),
            max_limit,
            min_rtt_nanos: AtomicU64::new(u64::MAX),
            smoothed_rtt_nanos: AtomicU64::new(0),
            sample_count: AtomicUsize::new(0),
            alpha: 3,
            beta: 6,
            min_samples: 10,
            smoothing: 0.5,
        }
    }

    fn on_success(&self, rtt: Duration) {
        let rtt_nanos = rtt.as_nanos() as u64;

        let mut current_min = self.min_rtt_nanos.load(Ordering::Relaxed);
        while rtt_nanos < current_min {
            match self.min_rtt_nanos.compare_exchange_weak(
                current_min,
                rtt_nanos,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(c) => current_min = c,
            }
        }

        let current_smoothed = self.smoothed_rtt_nanos.load(Ordering::Relaxed);
        let new_smoothed = if current_smoothed == 0 {
            rtt_nanos
        } else {
            (self.smoothing * rtt_nanos as f64
                + (1.0 - self.smoothing) * current_smoothed as f64) as u64
        };
        self.smoothed_rtt_nanos
            .store(new_smoothed, Ordering::Relaxed);

        if self.sample_count.fetch_add(1, Ordering::Relaxed) + 1 < self.min_samples {
            return;
        }

        let min_rtt = self.min_rtt_nanos.load(Ordering::Relaxed);
        let smoothed = self.smoothed_rtt_nanos.load(Ordering::Relaxed);
        if min_rtt == u64::MAX || min_rtt == 0 || smoothed == 0 {
            return;
        }

        let current_limit = self.limit.load(Ordering::Relaxed);
        // Requests queued beyond the uncongested baseline.
        let queue_estimate = if smoothed > min_rtt {
            ((smoothed - min_rtt) as f64 / min_rtt as f64 * current_limit as f64) as usize
        } else {
            0
        };

        let new_limit = if queue_estimate < self.alpha {
            (current_limit + 1).min(self.max_limit)
        } else if queue_estimate > self.beta {
            current_limit.saturating_sub(1).max(MIN_LIMIT)
        } else {
            current_limit
        };

        self.limit.store(new_limit, Ordering::Relaxed);
    }

    fn on_failure(&self) {
        let current = self.limit.load(Ordering::Relaxed);
        self.limit.store((current / 2).max(MIN_LIMIT), Ordering::Relaxed);
    }

    fn limit(&self) -> usize {
        self.limit.load(Ordering::Relaxed)
    }
}

/// Gradient limit adjustment.
///
/// Keeps two exponential moving averages of the rtt, a slow long-window
/// baseline and a fast short-window one. While the short window stays
/// within `tolerance` of the long window the limit creeps up; once it
/// degrades beyond the tolerance the limit is scaled down by the ratio.
struct Gradient {
    limit: AtomicUsize,
    max_limit: usize,
    long_rtt_nanos: AtomicU64,
    short_rtt_nanos: AtomicU64,
    sample_count: AtomicUsize,
    min_samples: usize,
    long_smoothing: f64,
    short_smoothing: f64,
    tolerance: f64,
}

impl Gradient {
    fn new(initial_limit: usize, max_limit: usize) -> Self {
        Self {
            limit: AtomicUsize::new(initial_limit.clamp(MIN_LIMIT, max_limit)),
            max_limit,
            long_rtt_nanos: AtomicU64::new(0),
            short_rtt_nanos: AtomicU64::new(0),
            sample_count: AtomicUsize::new(0),
            min_samples: 10,
            long_smoothing: 0.05,
            short_smoothing: 0.4,
            tolerance: 1.5,
        }
    }

    fn update_ewma(cell: &AtomicU64, smoothing: f64, rtt_nanos: u64) -> u64 {
        let current = cell.load(Ordering::Relaxed);
        let new = if current == 0 {
            rtt_nanos
        } else {
            (smoothing * rtt_nanos as f64 + (1.0 - smoothing) * current as f64) as u64
        };
        cell.store(new, Ordering::Relaxed);
        new
    }

    fn on_success(&self, rtt: Duration) {
        let rtt_nanos = rtt.as_nanos() as u64;
        let long = Self::update_ewma(&self.long_rtt_nanos, self.long_smoothing, rtt_nanos);
        let short = Self::update_ewma(&self.short_rtt_nanos, self.short_smoothing, rtt_nanos);

        if self.sample_count.fetch_add(1, Ordering::Relaxed) + 1 < self.min_samples {
            return;
        }
        if long == 0 || short == 0 {
            return;
        }

        let current_limit = self.limit.load(Ordering::Relaxed);
        let new_limit = if (short as f64) <= (long as f64) * self.tolerance {
            // Short window tracks the baseline, probe for more.
            (current_limit + 1).min(self.max_limit)
        } else {
            let gradient = (long as f64) * self.tolerance / (short as f64);
            ((current_limit as f64 * gradient) as usize).max(MIN_LIMIT)
        };

        self.limit.store(new_limit, Ordering::Relaxed);
    }

    fn on_failure(&self) {
        let current = self.limit.load(Ordering::Relaxed);
        self.limit.store((current / 2).max(MIN_LIMIT), Ordering::Relaxed);
    }

    fn limit(&self) -> usize {
        self.limit.load(Ordering::Relaxed)
    }
}

enum Algorithm {
    Vegas(Vegas),
    Gradient(Gradient),
}

impl Algorithm {
    fn on_success(&self, rtt: Duration) {
        match self {
            Algorithm::Vegas(v) => v.on_success(rtt),
            Algorithm::Gradient(g) => g.on_success(rtt),
        }
    }

    fn on_failure(&self) {
        match self {
            Algorithm::Vegas(v) => v.on_failure(),
            Algorithm::Gradient(g) => g.on_failure(),
        }
    }

    fn limit(&self) -> usize {
        match self {
            Algorithm::Vegas(v) => v.limit(),
            Algorithm::Gradient(g) => g.limit(),
        }
    }
}

/// Per-endpoint concurrency limiter.
pub struct Limiter {
    endpoint: String,
    algorithm: Algorithm,
    in_flight: AtomicUsize,
    released: Notify,
    block_on_limit: bool,
    log_on_limit_change: bool,
}

impl Limiter {
    pub fn new(opts: &RpcOptions, endpoint: String) -> Self {
        let algorithm = match opts.limit_kind {
            LimitKind::Vegas => Algorithm::Vegas(Vegas::new(opts.initial_limit, opts.max_limit)),
            LimitKind::Gradient => {
                Algorithm::Gradient(Gradient::new(opts.initial_limit, opts.max_limit))
            }
        };

        Self {
            endpoint,
            algorithm,
            in_flight: AtomicUsize::new(0),
            released: Notify::new(),
            block_on_limit: opts.block_on_limit,
            log_on_limit_change: opts.log_on_limit_change,
        }
    }

    /// Acquire one slot.
    ///
    /// With `block_on_limit` the call waits until a slot is released,
    /// otherwise a saturated limiter is a flow control error.
    pub async fn acquire(&self) -> Result<Permit<'_>> {
        loop {
            let limit = self.algorithm.limit();
            let current = self.in_flight.load(Ordering::Relaxed);
            if current < limit {
                if self
                    .in_flight
                    .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return Ok(Permit {
                        limiter: self,
                        started_at: Instant::now(),
                        outcome_recorded: false,
                    });
                }
                continue;
            }

            if !self.block_on_limit {
                return Err(Error::FlowControl(format!(
                    "in-flight limit {limit} reached for endpoint:{}",
                    self.endpoint
                )));
            }
            self.released.notified().await;
        }
    }

    fn record(&self, outcome: Outcome, rtt: Duration) {
        let before = self.algorithm.limit();
        match outcome {
            Outcome::Success => self.algorithm.on_success(rtt),
            Outcome::Failure => self.algorithm.on_failure(),
            // Cancelled or dropped requests carry no signal.
            Outcome::Dropped => {}
        }
        let after = self.algorithm.limit();
        if self.log_on_limit_change && before != after {
            info!(
                endpoint = %self.endpoint,
                before,
                after,
                "concurrency limit adjusted"
            );
        }
    }
}

#[derive(Clone, Copy)]
enum Outcome {
    Success,
    Failure,
    Dropped,
}

/// One acquired slot. Dropping it releases the slot; an outcome should be
/// recorded through [`Permit::success`] or [`Permit::failure`] first.
pub struct Permit<'a> {
    limiter: &'a Limiter,
    started_at: Instant,
    outcome_recorded: bool,
}

impl Permit<'_> {
    pub fn success(mut self) {
        self.outcome_recorded = true;
        self.limiter.record(Outcome::Success, self.started_at.elapsed());
    }

    pub fn failure(mut self) {
        self.outcome_recorded = true;
        self.limiter.record(Outcome::Failure, Duration::ZERO);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.outcome_recorded {
            self.limiter.record(Outcome::Dropped, Duration::ZERO);
        }
        self.limiter.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.limiter.released.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(kind: LimitKind, initial: usize, block: bool) -> RpcOptions {
        RpcOptions {
            block_on_limit: block,
            initial_limit: initial,
            max_limit: 128,
            limit_kind: kind,
            log_on_limit_change: false,
        }
    }

    #[tokio::test]
    async fn test_fail_fast_when_saturated() {
        let limiter = Limiter::new(&opts(LimitKind::Vegas, 1, false), "ep".to_string());

        let held = limiter.acquire().await.unwrap();
        let denied = limiter.acquire().await;
        assert!(matches!(denied, Err(Error::FlowControl(_))));

        drop(held);
        assert!(limiter.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_blocking_acquire_waits_for_release() {
        use std::sync::Arc;

        let limiter = Arc::new(Limiter::new(&opts(LimitKind::Gradient, 1, true), "ep".to_string()));
        let held = limiter.acquire().await.unwrap();

        let limiter_clone = limiter.clone();
        let waiter = tokio::spawn(async move {
            let permit = limiter_clone.acquire().await.unwrap();
            permit.success();
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await.unwrap();
    }

    #[test]
    fn test_vegas_failure_halves_limit() {
        let vegas = Vegas::new(20, 128);
        vegas.on_failure();
        assert_eq!(vegas.limit(), 10);
        for _ in 0..10 {
            vegas.on_failure();
        }
        assert_eq!(vegas.limit(), MIN_LIMIT);
    }

    #[test]
    fn test_vegas_probes_up_on_flat_rtt() {
        let vegas = Vegas::new(10, 128);
        for _ in 0..20 {
            vegas.on_success(Duration::from_millis(5));
        }
        assert!(vegas.limit() > 10);
    }

    #[test]
    fn test_gradient_reacts_to_degradation() {
        let gradient = Gradient::new(32, 128);
        // Establish the long-window baseline.
        for _ in 0..20 {
            gradient.on_success(Duration::from_millis(5));
        }
        let before = gradient.limit();

        // Sustained latency blowup shrinks the limit.
        for _ in 0..20 {
            gradient.on_success(Duration::from_millis(500));
        }
        assert!(gradient.limit() < before);
    }
}
