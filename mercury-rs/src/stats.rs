//! Collects per-route statistics which are reported by the server via `GET /_mercury/stats`.
//!
//! All counters are updated using atomics so that the **stats** middleware never has to wait for
//! a lock while processing a request. Only the lookup of the [RouteStats] for a route name
//! requires a (very short lived) lock.
//!
//! # Example
//!
//! ```
//! # use mercury::stats::Statistics;
//! # use std::time::Duration;
//! let statistics = Statistics::default();
//! let products = statistics.route("products");
//! products.record(200, true, Duration::from_millis(2));
//! products.record(502, false, Duration::from_millis(4));
//!
//! assert_eq!(products.requests(), 2);
//! assert_eq!(products.errors(), 1);
//! assert_eq!(products.hits(), 1);
//! assert_eq!(products.latency().avg(), 3000);
//! ```
use fnv::FnvHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Limits the number of samples which contribute to the sliding average.
const WINDOW: u64 = 100;

/// Computes a sliding average over the last (roughly) hundred values.
///
/// The running sum and sample count are packed into a single `u64` (upper 40 bits for the sum,
/// lower 24 bits for the count) which is updated atomically. Once the window is full or the sum
/// would overflow, both are halved before the next value is added.
#[derive(Default)]
pub struct Average {
    state: AtomicU64,
    count: AtomicU64,
}

const COUNT_BITS: u32 = 24;
const COUNT_MASK: u64 = (1 << COUNT_BITS) - 1;
const MAX_SUM: u64 = (1 << (64 - COUNT_BITS)) - 1;

impl Average {
    /// Records the given value.
    pub fn add(&self, value: u64) {
        let value = value.min(MAX_SUM);
        let _ = self.count.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .state
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |state| {
                let (mut sum, mut samples) = (state >> COUNT_BITS, state & COUNT_MASK);
                while samples > 0 && (samples >= WINDOW || sum + value > MAX_SUM) {
                    sum -= sum / samples * (samples - samples / 2);
                    samples /= 2;
                }
                if samples == 0 {
                    sum = 0;
                }

                Some(((sum + value) << COUNT_BITS) | (samples + 1))
            });
    }

    /// Returns the total number of recorded values.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Returns the sliding average or 0 if no value has been recorded yet.
    pub fn avg(&self) -> u64 {
        let state = self.state.load(Ordering::Relaxed);
        match state & COUNT_MASK {
            0 => 0,
            samples => (state >> COUNT_BITS) / samples,
        }
    }
}

/// Contains the counters of a single route.
#[derive(Default)]
pub struct RouteStats {
    requests: AtomicU64,
    errors: AtomicU64,
    hits: AtomicU64,
    latency: Average,
}

impl RouteStats {
    /// Records a completed request.
    ///
    /// The status is the one delivered to the client (502 if the chain failed). Each status of
    /// 500 or above is counted as error.
    pub fn record(&self, status: u16, hit: bool, duration: Duration) {
        let _ = self.requests.fetch_add(1, Ordering::Relaxed);
        if status >= 500 {
            let _ = self.errors.fetch_add(1, Ordering::Relaxed);
        }
        if hit {
            let _ = self.hits.fetch_add(1, Ordering::Relaxed);
        }
        self.latency
            .add(u64::try_from(duration.as_micros()).unwrap_or(u64::MAX));
    }

    /// Returns the number of processed requests.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Returns the number of requests which failed or yielded a server error.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Returns the number of requests which were answered from the cache.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Returns the latency in microseconds.
    pub fn latency(&self) -> &Average {
        &self.latency
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "requests": self.requests(),
            "errors": self.errors(),
            "hits": self.hits(),
            "avg_latency_micros": self.latency.avg(),
        })
    }
}

/// Keeps the [RouteStats] of all routes by name.
///
/// The statistics outlive config reloads: a route which keeps its name keeps its counters.
#[derive(Default)]
pub struct Statistics {
    routes: Mutex<FnvHashMap<String, Arc<RouteStats>>>,
}

impl Statistics {
    /// Returns the statistics of the given route, creating them on first use.
    pub fn route(&self, name: &str) -> Arc<RouteStats> {
        let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        routes.entry(name.to_owned()).or_default().clone()
    }

    /// Renders the statistics of all routes as JSON object keyed by the route name.
    pub fn to_json(&self) -> serde_json::Value {
        let routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        serde_json::Value::Object(
            routes
                .iter()
                .map(|(name, stats)| (name.clone(), stats.to_json()))
                .collect(),
        )
    }
}
