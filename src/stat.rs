//! Traffic statistics for gates and pools.
//!
//! Counters plus exponentially-weighted request and error rates over 1, 5
//! and 15 minute horizons. Error percentages are the ratio of the error
//! rate to the request rate over the same horizon.

use std::time::{Duration, Instant};

use serde::Serialize;

const M1_WINDOW: f64 = 60.0;
const M5_WINDOW: f64 = 300.0;
const M15_WINDOW: f64 = 900.0;

/// An exponentially decaying per-second rate.
#[derive(Debug)]
struct Ewma {
    window: f64,
    rate: f64,
    last: Instant,
}

impl Ewma {
    fn new(window: f64) -> Self {
        Self {
            window,
            rate: 0.0,
            last: Instant::now(),
        }
    }

    fn update(&mut self, count: f64, now: Instant) {
        let dt = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        if dt <= 0.0 {
            self.rate += count / self.window;
            return;
        }
        let alpha = 1.0 - (-dt / self.window).exp();
        let instant_rate = count / dt;
        self.rate += alpha * (instant_rate - self.rate);
    }

    fn rate(&self, now: Instant) -> f64 {
        let dt = now.duration_since(self.last).as_secs_f64();
        if dt <= 0.0 {
            return self.rate;
        }
        let alpha = 1.0 - (-dt / self.window).exp();
        self.rate + alpha * (0.0 - self.rate)
    }
}

#[derive(Debug)]
struct StatInner {
    count: u64,
    errors: u64,
    total: Duration,
    max: Duration,
    min: Option<Duration>,
    m1: Ewma,
    m1_err: Ewma,
    m5: Ewma,
    m5_err: Ewma,
    m15: Ewma,
    m15_err: Ewma,
}

/// Aggregated request statistics. Cheap to update from request tasks.
#[derive(Debug)]
pub struct TrafficStat {
    inner: std::sync::Mutex<StatInner>,
}

/// Snapshot of a [`TrafficStat`] for status output.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrafficStatus {
    pub count: u64,
    pub errors: u64,
    pub avg_duration_ms: f64,
    pub max_duration_ms: u64,
    pub min_duration_ms: u64,
    pub m1_rate: f64,
    pub m5_rate: f64,
    pub m15_rate: f64,
    pub m1_err_percent: f64,
    pub m5_err_percent: f64,
    pub m15_err_percent: f64,
}

impl Default for TrafficStat {
    fn default() -> Self {
        Self::new()
    }
}

impl TrafficStat {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Mutex::new(StatInner {
                count: 0,
                errors: 0,
                total: Duration::ZERO,
                max: Duration::ZERO,
                min: None,
                m1: Ewma::new(M1_WINDOW),
                m1_err: Ewma::new(M1_WINDOW),
                m5: Ewma::new(M5_WINDOW),
                m5_err: Ewma::new(M5_WINDOW),
                m15: Ewma::new(M15_WINDOW),
                m15_err: Ewma::new(M15_WINDOW),
            }),
        }
    }

    /// Record one finished request.
    pub fn record(&self, duration: Duration, is_error: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("stat lock poisoned");
        inner.count += 1;
        inner.total += duration;
        if duration > inner.max {
            inner.max = duration;
        }
        match inner.min {
            Some(min) if duration >= min => {}
            _ => inner.min = Some(duration),
        }
        let err = if is_error {
            inner.errors += 1;
            1.0
        } else {
            0.0
        };
        inner.m1.update(1.0, now);
        inner.m1_err.update(err, now);
        inner.m5.update(1.0, now);
        inner.m5_err.update(err, now);
        inner.m15.update(1.0, now);
        inner.m15_err.update(err, now);
    }

    pub fn status(&self) -> TrafficStatus {
        let now = Instant::now();
        let inner = self.inner.lock().expect("stat lock poisoned");
        let avg = if inner.count > 0 {
            inner.total.as_secs_f64() * 1000.0 / inner.count as f64
        } else {
            0.0
        };
        TrafficStatus {
            count: inner.count,
            errors: inner.errors,
            avg_duration_ms: avg,
            max_duration_ms: inner.max.as_millis() as u64,
            min_duration_ms: inner.min.unwrap_or(Duration::ZERO).as_millis() as u64,
            m1_rate: inner.m1.rate(now),
            m5_rate: inner.m5.rate(now),
            m15_rate: inner.m15.rate(now),
            m1_err_percent: err_percent(inner.m1_err.rate(now), inner.m1.rate(now)),
            m5_err_percent: err_percent(inner.m5_err.rate(now), inner.m5.rate(now)),
            m15_err_percent: err_percent(inner.m15_err.rate(now), inner.m15.rate(now)),
        }
    }
}

// The error percentage over a horizon is errRate/rate for that same horizon.
fn err_percent(err_rate: f64, rate: f64) -> f64 {
    if rate <= 0.0 {
        0.0
    } else {
        (err_rate / rate).clamp(0.0, 1.0)
    }
}
