use crate::config::RateLimitConfig;
use log::debug;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Outcome of a rate-limit check
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    /// Admissions left in the current window after this decision
    pub remaining: u64,
    /// How long until the oldest admission ages out (meaningful on denial)
    pub retry_after: Duration,
}

/// Admission timestamps for one (identity, endpoint) pair
struct RateWindow {
    admissions: VecDeque<Instant>,
    last_activity: Instant,
}

impl RateWindow {
    fn new() -> Self {
        Self {
            admissions: VecDeque::new(),
            last_activity: Instant::now(),
        }
    }

    fn trim(&mut self, window: Duration, now: Instant) {
        while let Some(front) = self.admissions.front() {
            if now.duration_since(*front) >= window {
                self.admissions.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Sliding-window rate limiter keyed by (identity, endpoint).
///
/// The outer map lock is held only to fetch or create a window handle; the
/// admission check runs under the window's own lock.
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<(String, String), Arc<Mutex<RateWindow>>>>,
    /// Adaptive scaling factor applied to every endpoint's limit
    factor: Mutex<f64>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
            factor: Mutex::new(1.0),
        }
    }

    /// Check and record one admission attempt. Admitted requests append
    /// their timestamp; denied requests leave the window untouched.
    pub fn allow(&self, identity: &str, endpoint: &str) -> RateDecision {
        let rule = self.config.rule_for(endpoint);
        let limit = self.effective_limit(rule.limit);
        let window = rule.window();
        let now = Instant::now();

        let handle = {
            let mut windows = self.windows.lock().unwrap();
            windows
                .entry((identity.to_string(), endpoint.to_string()))
                .or_insert_with(|| Arc::new(Mutex::new(RateWindow::new())))
                .clone()
        };

        let mut state = handle.lock().unwrap();
        state.last_activity = now;
        state.trim(window, now);

        if (state.admissions.len() as u64) < limit {
            state.admissions.push_back(now);
            RateDecision {
                allowed: true,
                remaining: limit - state.admissions.len() as u64,
                retry_after: Duration::ZERO,
            }
        } else {
            let retry_after = state
                .admissions
                .front()
                .map(|oldest| window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(window);
            RateDecision {
                allowed: false,
                remaining: 0,
                retry_after,
            }
        }
    }

    /// Current limit for an endpoint after adaptive scaling
    pub fn limit_for(&self, endpoint: &str) -> u64 {
        self.effective_limit(self.config.rule_for(endpoint).limit)
    }

    fn effective_limit(&self, base: u64) -> u64 {
        let factor = *self.factor.lock().unwrap();
        let scaled = (base as f64 * factor).round() as u64;
        scaled.clamp(self.config.min_limit, self.config.max_limit)
    }

    /// Apply an adaptive adjustment from a performance score in [0, 1].
    /// Poor scores shed load; healthy scores allow extra headroom.
    pub fn adjust(&self, score: f64) {
        let factor = factor_for(score);
        let mut current = self.factor.lock().unwrap();
        if (*current - factor).abs() > f64::EPSILON {
            debug!("Rate limiter factor {:.2} -> {:.2} (score {:.2})", *current, factor, score);
            *current = factor;
        }
    }

    /// Drop windows that have been idle for longer than twice their
    /// endpoint's window, bounding memory under churning identities.
    pub fn housekeeping(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap();
        let before = windows.len();

        windows.retain(|(_, endpoint), handle| {
            let window = self.config.rule_for(endpoint).window();
            let mut state = handle.lock().unwrap();
            state.trim(window, now);
            !state.admissions.is_empty() || now.duration_since(state.last_activity) < window * 2
        });

        before - windows.len()
    }

    /// Number of live windows, for introspection
    pub fn window_count(&self) -> usize {
        self.windows.lock().unwrap().len()
    }
}

/// Map a performance score to a limit scaling factor
fn factor_for(score: f64) -> f64 {
    if score < 0.25 {
        0.5
    } else if score < 0.5 {
        0.75
    } else if score < 0.75 {
        1.0
    } else {
        1.25
    }
}

/// Blend error rate, response time, and cache hit rate into one score in
/// [0, 1]. Higher is healthier.
pub fn performance_score(error_rate: f64, avg_response_ms: f64, cache_hit_rate: f64) -> f64 {
    let latency_penalty = (avg_response_ms / 1000.0).min(1.0);
    let score = 0.4 * (1.0 - error_rate) + 0.3 * (1.0 - latency_penalty) + 0.3 * cache_hit_rate;
    score.clamp(0.0, 1.0)
}
