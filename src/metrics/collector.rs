use log::debug;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Rolling window length for response-time and error-rate queries
const WINDOW: Duration = Duration::from_secs(300);
/// Hard cap per window to bound memory under sustained load
const WINDOW_CAP: usize = 10_000;
/// Lookback for cache-hit frequency queries
const HIT_LOOKBACK: Duration = Duration::from_secs(3600);

/// One latency/outcome sample inside the rolling window
#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    duration: Duration,
    is_error: bool,
}

/// Internal per-endpoint counters and windows
#[derive(Debug, Default)]
struct EndpointStats {
    requests: u64,
    l1_hits: u64,
    l2_hits: u64,
    l3_hits: u64,
    stale_serves: u64,
    misses: u64,
    errors_by_code: HashMap<String, u64>,
    bytes_transferred: u64,
    rate_limit_denials: u64,
    breaker_transitions: HashMap<&'static str, u64>,
    coalesced_waits: u64,
    samples: VecDeque<Sample>,
    hit_times: VecDeque<Instant>,
}

impl EndpointStats {
    fn trim(&mut self, now: Instant) {
        while let Some(sample) = self.samples.front() {
            if now.duration_since(sample.at) > WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        while self.samples.len() > WINDOW_CAP {
            self.samples.pop_front();
        }
        while let Some(at) = self.hit_times.front() {
            if now.duration_since(*at) > HIT_LOOKBACK {
                self.hit_times.pop_front();
            } else {
                break;
            }
        }
        while self.hit_times.len() > WINDOW_CAP {
            self.hit_times.pop_front();
        }
    }

    fn record_hit(&mut self, tier: &str, now: Instant) {
        match tier {
            "L1" => self.l1_hits += 1,
            "L2" => self.l2_hits += 1,
            "L3" => self.l3_hits += 1,
            _ => {}
        }
        self.hit_times.push_back(now);
    }

    fn window_stats(&self) -> (f64, f64) {
        if self.samples.is_empty() {
            return (0.0, 0.0);
        }
        let total = self.samples.len() as f64;
        let errors = self.samples.iter().filter(|s| s.is_error).count() as f64;
        let avg_ms = self
            .samples
            .iter()
            .map(|s| s.duration.as_secs_f64() * 1000.0)
            .sum::<f64>()
            / total;
        (avg_ms, errors / total)
    }

    fn total_hits(&self) -> u64 {
        self.l1_hits + self.l2_hits + self.l3_hits
    }
}

/// Public snapshot of one endpoint's metrics
#[derive(Debug, Clone, Serialize)]
pub struct EndpointSnapshot {
    pub requests: u64,
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub l3_hits: u64,
    pub stale_serves: u64,
    pub misses: u64,
    pub errors_by_code: HashMap<String, u64>,
    pub bytes_transferred: u64,
    pub rate_limit_denials: u64,
    pub breaker_transitions: HashMap<&'static str, u64>,
    pub coalesced_waits: u64,
    pub hit_rate: f64,
    pub avg_response_ms: f64,
    pub window_error_rate: f64,
}

/// Snapshot of the whole collector
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub endpoints: HashMap<String, EndpointSnapshot>,
}

/// Request-path metrics aggregator.
///
/// Updates never block the request path: when the lock is contended the
/// sample is logged at debug level and discarded.
pub struct MetricsCollector {
    endpoints: RwLock<HashMap<String, EndpointStats>>,
    start_time: Instant,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            endpoints: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    fn with_endpoint(&self, endpoint: &str, update: impl FnOnce(&mut EndpointStats)) {
        match self.endpoints.try_write() {
            Ok(mut endpoints) => {
                let stats = endpoints.entry(endpoint.to_string()).or_default();
                update(stats);
                stats.trim(Instant::now());
            }
            Err(_) => {
                debug!("Metrics update for '{endpoint}' discarded under contention");
            }
        }
    }

    /// Record a completed request with its outcome
    pub fn record_request(&self, endpoint: &str, duration: Duration, error_code: Option<&str>) {
        let now = Instant::now();
        self.with_endpoint(endpoint, |stats| {
            stats.requests += 1;
            if let Some(code) = error_code {
                *stats.errors_by_code.entry(code.to_string()).or_insert(0) += 1;
            }
            stats.samples.push_back(Sample {
                at: now,
                duration,
                is_error: error_code.is_some(),
            });
        });
    }

    pub fn record_cache_hit(&self, endpoint: &str, tier: &str) {
        let now = Instant::now();
        self.with_endpoint(endpoint, |stats| stats.record_hit(tier, now));
    }

    pub fn record_cache_miss(&self, endpoint: &str) {
        self.with_endpoint(endpoint, |stats| stats.misses += 1);
    }

    pub fn record_stale_serve(&self, endpoint: &str) {
        self.with_endpoint(endpoint, |stats| stats.stale_serves += 1);
    }

    pub fn record_bytes(&self, endpoint: &str, bytes: u64) {
        self.with_endpoint(endpoint, |stats| stats.bytes_transferred += bytes);
    }

    pub fn record_rate_limit_denial(&self, endpoint: &str) {
        self.with_endpoint(endpoint, |stats| stats.rate_limit_denials += 1);
    }

    pub fn record_breaker_transition(&self, endpoint: &str, to_state: &'static str) {
        self.with_endpoint(endpoint, |stats| {
            *stats.breaker_transitions.entry(to_state).or_insert(0) += 1;
        });
    }

    pub fn record_coalesced_wait(&self, endpoint: &str) {
        self.with_endpoint(endpoint, |stats| stats.coalesced_waits += 1);
    }

    /// Cache hits for an endpoint over the last hour, for TTL scaling
    pub fn hits_per_hour(&self, endpoint: &str) -> u64 {
        let endpoints = match self.endpoints.try_read() {
            Ok(guard) => guard,
            Err(_) => return 0,
        };
        let now = Instant::now();
        endpoints
            .get(endpoint)
            .map(|stats| {
                stats
                    .hit_times
                    .iter()
                    .filter(|at| now.duration_since(**at) <= HIT_LOOKBACK)
                    .count() as u64
            })
            .unwrap_or(0)
    }

    /// Whole-process health signals for the adaptive rate supervisor:
    /// (window error rate, window average response ms, lifetime hit rate)
    pub fn health_signals(&self) -> (f64, f64, f64) {
        let endpoints = match self.endpoints.try_read() {
            Ok(guard) => guard,
            Err(_) => return (0.0, 0.0, 0.0),
        };

        let mut samples = 0usize;
        let mut errors = 0usize;
        let mut total_ms = 0.0;
        let mut hits = 0u64;
        let mut lookups = 0u64;

        for stats in endpoints.values() {
            for sample in &stats.samples {
                samples += 1;
                total_ms += sample.duration.as_secs_f64() * 1000.0;
                if sample.is_error {
                    errors += 1;
                }
            }
            hits += stats.total_hits();
            lookups += stats.total_hits() + stats.misses;
        }

        let error_rate = if samples == 0 {
            0.0
        } else {
            errors as f64 / samples as f64
        };
        let avg_ms = if samples == 0 {
            0.0
        } else {
            total_ms / samples as f64
        };
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            hits as f64 / lookups as f64
        };

        (error_rate, avg_ms, hit_rate)
    }

    /// Full snapshot for the metrics endpoint
    pub fn snapshot(&self) -> MetricsSnapshot {
        let endpoints = match self.endpoints.try_read() {
            Ok(guard) => guard,
            Err(_) => {
                return MetricsSnapshot {
                    uptime_seconds: self.start_time.elapsed().as_secs(),
                    endpoints: HashMap::new(),
                }
            }
        };

        let snapshots = endpoints
            .iter()
            .map(|(endpoint, stats)| {
                let (avg_response_ms, window_error_rate) = stats.window_stats();
                let lookups = stats.total_hits() + stats.misses;
                let hit_rate = if lookups == 0 {
                    0.0
                } else {
                    stats.total_hits() as f64 / lookups as f64
                };
                (
                    endpoint.clone(),
                    EndpointSnapshot {
                        requests: stats.requests,
                        l1_hits: stats.l1_hits,
                        l2_hits: stats.l2_hits,
                        l3_hits: stats.l3_hits,
                        stale_serves: stats.stale_serves,
                        misses: stats.misses,
                        errors_by_code: stats.errors_by_code.clone(),
                        bytes_transferred: stats.bytes_transferred,
                        rate_limit_denials: stats.rate_limit_denials,
                        breaker_transitions: stats.breaker_transitions.clone(),
                        coalesced_waits: stats.coalesced_waits,
                        hit_rate,
                        avg_response_ms,
                        window_error_rate,
                    },
                )
            })
            .collect();

        MetricsSnapshot {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            endpoints: snapshots,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
