use crate::breaker::CircuitBreaker;
use crate::cache::key::CacheKeyGenerator;
use crate::cache::{Lookup, TieredCache};
use crate::config::{Config, TtlConfig};
use crate::error::{ProxyError, Result};
use crate::limiter::RateLimiter;
use crate::metrics::{self, MetricsCollector};
use crate::session::SessionEnvelope;
use crate::singleflight::{FlightRole, SingleFlight};
use crate::transform::{self, TransformerRegistry, TtlCategory};
use crate::upstream::UpstreamFetcher;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// An inbound proxy request, already stripped of transport framing
#[derive(Debug, Clone, Default)]
pub struct ProxyRequest {
    pub endpoint: String,
    pub params: HashMap<String, String>,
    pub session_token: Option<String>,
    pub client_ip: String,
    pub user_agent: String,
    /// Skip the cache read path but still store the fresh result
    pub cache_override: bool,
    /// Per-request transformation overrides applied on top of the
    /// endpoint's normalization
    pub transformations: Vec<String>,
}

/// Where the served body came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    Stale,
}

impl CacheStatus {
    pub fn header_value(&self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
            Self::Stale => "STALE",
        }
    }
}

/// A successfully served body plus its cache provenance
#[derive(Debug, Clone)]
pub struct Served {
    pub body: Vec<u8>,
    pub content_type: String,
    pub cache_status: CacheStatus,
    pub cache_tier: Option<&'static str>,
    pub cache_age: Option<Duration>,
    pub transformations_applied: Vec<String>,
}

/// Pipeline output: the request outcome plus the session and rate-limit
/// context the transport layer echoes back on both success and failure.
#[derive(Debug)]
pub struct PipelineResponse {
    pub result: Result<Served>,
    pub session_id: Uuid,
    pub session_token: Option<String>,
    pub rate_limit_remaining: Option<u64>,
    pub retry_after: Option<Duration>,
    pub processing_time: Duration,
}

/// What one upstream flight produces: the normalized body as written back
/// to the cache.
#[derive(Debug)]
pub struct FlightOutcome {
    pub body: Vec<u8>,
    pub content_type: String,
    pub transformer: &'static str,
}

/// End-to-end request processor composing session handling, rate limiting,
/// the circuit breaker, the tiered cache, single-flight upstream dispatch,
/// and response transformation.
pub struct Pipeline {
    envelope: SessionEnvelope,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    cache: Arc<TieredCache>,
    registry: Arc<TransformerRegistry>,
    fetcher: Arc<dyn UpstreamFetcher>,
    flights: SingleFlight<FlightOutcome>,
    ttl_config: TtlConfig,
    metrics: Arc<MetricsCollector>,
}

impl Pipeline {
    pub fn new(config: &Config, fetcher: Arc<dyn UpstreamFetcher>) -> Self {
        let master_key = config
            .session
            .master_key
            .clone()
            .unwrap_or_else(|| "dev-only-insecure-master-key".to_string());

        Self {
            envelope: SessionEnvelope::new(
                &master_key,
                config.session.timeout_seconds,
                config.session.max_age_seconds,
            ),
            limiter: RateLimiter::new(config.rate_limit.clone()),
            breaker: CircuitBreaker::new(config.breaker.clone()),
            cache: Arc::new(TieredCache::new(&config.cache)),
            registry: Arc::new(TransformerRegistry::with_defaults()),
            fetcher,
            flights: SingleFlight::new(),
            ttl_config: config.ttl.clone(),
            metrics: metrics::global(),
        }
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Periodic housekeeping: expired cache entries and idle rate windows
    pub fn housekeeping(&self) {
        let swept = self.cache.cleanup_expired();
        let dropped = self.limiter.housekeeping();
        if swept > 0 || dropped > 0 {
            debug!("Housekeeping removed {swept} cache entries, {dropped} rate windows");
        }
    }

    /// Recompute the adaptive rate-limit factor from current health
    pub fn adjust_rate_limits(&self) {
        let (error_rate, avg_ms, hit_rate) = self.metrics.health_signals();
        let score = crate::limiter::performance_score(error_rate, avg_ms, hit_rate);
        self.limiter.adjust(score);
    }

    /// Process one request end to end
    pub async fn process(&self, request: ProxyRequest) -> PipelineResponse {
        let started = Instant::now();

        // 1. Decode or mint the session. Rate limiting keys off the session
        //    id, falling back to the client IP when no session came in.
        let fingerprint = format!("{}|{}", request.user_agent, request.client_ip);
        let resolved = self
            .envelope
            .resolve(request.session_token.as_deref(), &fingerprint);
        let session_id = resolved.record.id;
        let identity = if resolved.is_new {
            format!("ip:{}", request.client_ip)
        } else {
            format!("session:{session_id}")
        };

        let session_token = match self.envelope.encrypt(&resolved.record) {
            Ok(token) => Some(token),
            Err(e) => {
                warn!("Session token rotation failed: {e}");
                None
            }
        };

        // 2. Cache key over the endpoint and its non-sensitive parameters
        let cache_key = CacheKeyGenerator::generate(&request.endpoint, &request.params);

        // 3. Rate limit
        let decision = self.limiter.allow(&identity, &request.endpoint);
        if !decision.allowed {
            self.metrics.record_rate_limit_denial(&request.endpoint);
            let retry_after_secs = decision.retry_after.as_secs().max(1);
            return PipelineResponse {
                result: Err(ProxyError::RateLimited {
                    retry_after_secs,
                    remaining: 0,
                }),
                session_id,
                session_token,
                rate_limit_remaining: Some(0),
                retry_after: Some(decision.retry_after),
                processing_time: started.elapsed(),
            };
        }

        let result = self
            .serve(&request, &cache_key)
            .await
            .and_then(|served| self.apply_overrides(&request, served));

        match &result {
            Ok(served) => {
                self.metrics.record_bytes(&request.endpoint, served.body.len() as u64);
                self.metrics
                    .record_request(&request.endpoint, started.elapsed(), None);
            }
            Err(e) => {
                self.metrics
                    .record_request(&request.endpoint, started.elapsed(), Some(e.code()));
            }
        }

        PipelineResponse {
            result,
            session_id,
            session_token,
            rate_limit_remaining: Some(decision.remaining),
            retry_after: None,
            processing_time: started.elapsed(),
        }
    }

    /// Steps 4–7: cache probe, circuit breaker, single-flight fetch,
    /// write-back, stale fallback.
    async fn serve(&self, request: &ProxyRequest, cache_key: &str) -> Result<Served> {
        let endpoint = &request.endpoint;

        // 4. Cache probe. An override skips the read path but a stale body
        //    found by a normal probe is kept as the upstream-failure
        //    fallback.
        let mut stale_fallback = None;
        if !request.cache_override {
            match self.cache.get(cache_key) {
                Lookup::Hit { body, tier } => {
                    self.metrics.record_cache_hit(endpoint, tier);
                    return Ok(Served {
                        body: body.body,
                        content_type: body.content_type,
                        cache_status: CacheStatus::Hit,
                        cache_tier: Some(tier),
                        cache_age: Some(body.age),
                        transformations_applied: Vec::new(),
                    });
                }
                Lookup::Stale { body, tier } => {
                    debug!("Holding stale '{endpoint}' body from {tier} as fallback");
                    self.metrics.record_cache_miss(endpoint);
                    stale_fallback = Some(body);
                }
                Lookup::Miss => {
                    self.metrics.record_cache_miss(endpoint);
                }
            }
        }

        // 5. Circuit breaker guards the upstream dispatch
        if !self.breaker.admit(endpoint) {
            return match stale_fallback {
                Some(body) => {
                    self.metrics.record_stale_serve(endpoint);
                    Ok(Served {
                        body: body.body,
                        content_type: body.content_type,
                        cache_status: CacheStatus::Stale,
                        cache_tier: None,
                        cache_age: Some(body.age),
                        transformations_applied: Vec::new(),
                    })
                }
                None => Err(ProxyError::CircuitOpen(endpoint.clone())),
            };
        }

        // 6. Single-flight upstream dispatch: concurrent identical misses
        //    share one fetch + transform + write-back.
        let entry = self.registry.resolve(endpoint);
        let compute = {
            let fetcher = Arc::clone(&self.fetcher);
            let registry = Arc::clone(&self.registry);
            let cache = Arc::clone(&self.cache);
            let metrics = Arc::clone(&self.metrics);
            let ttl_config = self.ttl_config.clone();
            let endpoint = endpoint.clone();
            let params = request.params.clone();
            let cache_key = cache_key.to_string();
            let upstream_path = entry.upstream_path.clone();
            let category = entry.category;

            move || async move {
                let fetched = fetcher.fetch(&upstream_path, &params).await?;
                let (body, transformer) = registry.apply(&endpoint, &fetched.body)?;

                let ttl = compute_ttl(
                    &ttl_config,
                    category,
                    body.len(),
                    metrics.hits_per_hour(&endpoint),
                );
                cache.put(&cache_key, &body, &fetched.content_type, Some(ttl));

                Ok(FlightOutcome {
                    body,
                    content_type: fetched.content_type,
                    transformer,
                })
            }
        };

        let (flight_result, role) = self.flights.run(cache_key, compute).await;
        if role == FlightRole::Waiter {
            self.metrics.record_coalesced_wait(endpoint);
        }

        // 7. Every admitted caller reports its observed outcome to the
        //    breaker, keeping half-open trial accounting paired with admit.
        match flight_result {
            Ok(outcome) => {
                self.breaker.record_success(endpoint);
                Ok(Served {
                    body: outcome.body.clone(),
                    content_type: outcome.content_type.clone(),
                    cache_status: CacheStatus::Miss,
                    cache_tier: None,
                    cache_age: None,
                    transformations_applied: vec![outcome.transformer.to_string()],
                })
            }
            Err(shared) => {
                if is_breaker_failure(&shared) {
                    self.breaker.record_failure(endpoint);
                } else {
                    self.breaker.record_success(endpoint);
                }

                if is_stale_servable(&shared) {
                    if let Some(body) = stale_fallback {
                        self.metrics.record_stale_serve(endpoint);
                        return Ok(Served {
                            body: body.body,
                            content_type: body.content_type,
                            cache_status: CacheStatus::Stale,
                            cache_tier: None,
                            cache_age: Some(body.age),
                            transformations_applied: Vec::new(),
                        });
                    }
                }

                Err(clone_error(&shared))
            }
        }
    }

    /// Apply per-request transformation overrides on top of the served
    /// body. The cached canonical body is never altered.
    fn apply_overrides(&self, request: &ProxyRequest, mut served: Served) -> Result<Served> {
        if request.transformations.is_empty() {
            return Ok(served);
        }

        served.body = transform::apply_named(&self.registry, &request.transformations, &served.body)?;
        served
            .transformations_applied
            .extend(request.transformations.iter().cloned());
        Ok(served)
    }
}

/// Whether a shared flight error counts against the circuit breaker.
/// Valid upstream responses (4xx) do not; unavailability does.
fn is_breaker_failure(error: &ProxyError) -> bool {
    matches!(
        error,
        ProxyError::Upstream5xx { .. }
            | ProxyError::UpstreamTimeout(_)
            | ProxyError::Network(_)
            | ProxyError::UpstreamUnavailable { .. }
    )
}

/// Stale bodies substitute only for unavailability, never for valid
/// upstream responses or local errors.
fn is_stale_servable(error: &ProxyError) -> bool {
    is_breaker_failure(error)
}

/// Rebuild an owned error from the shared flight error. The original kind
/// and client-visible detail are preserved; source chains are not.
fn clone_error(shared: &ProxyError) -> ProxyError {
    match shared {
        ProxyError::Upstream4xx { status, body } => ProxyError::Upstream4xx {
            status: *status,
            body: body.clone(),
        },
        ProxyError::Upstream5xx { status } => ProxyError::Upstream5xx { status: *status },
        ProxyError::UpstreamTimeout(secs) => ProxyError::UpstreamTimeout(*secs),
        ProxyError::UpstreamUnavailable { attempts } => {
            ProxyError::UpstreamUnavailable { attempts: *attempts }
        }
        ProxyError::Network(_) => ProxyError::UpstreamUnavailable { attempts: 1 },
        ProxyError::BadRequest(msg) => ProxyError::BadRequest(msg.clone()),
        ProxyError::Transform(msg) => ProxyError::Transform(msg.clone()),
        other => ProxyError::Internal(other.sanitized_message()),
    }
}

/// TTL selection: category base scaled by hit frequency and body size,
/// clamped to the configured bounds.
fn compute_ttl(config: &TtlConfig, category: TtlCategory, size_bytes: usize, hits_per_hour: u64) -> Duration {
    let base = match category {
        TtlCategory::RealTime => config.realtime_seconds,
        TtlCategory::Dynamic => config.dynamic_seconds,
        TtlCategory::Reference => config.reference_seconds,
    } as f64;

    let freq_factor = (1.0 + hits_per_hour as f64 / 100.0).min(2.0);
    let size_factor = (1.0 + size_bytes as f64 / 1_000_000.0).min(1.5);

    let seconds = (base * freq_factor * size_factor)
        .clamp(config.min_seconds as f64, config.max_seconds as f64);
    Duration::from_secs_f64(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ttl_config() -> TtlConfig {
        TtlConfig {
            realtime_seconds: 60,
            dynamic_seconds: 1200,
            reference_seconds: 3600,
            min_seconds: 30,
            max_seconds: 86400,
        }
    }

    #[test]
    fn ttl_uses_category_base() {
        let config = ttl_config();
        assert_eq!(
            compute_ttl(&config, TtlCategory::RealTime, 0, 0),
            Duration::from_secs(60)
        );
        assert_eq!(
            compute_ttl(&config, TtlCategory::Reference, 0, 0),
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn ttl_grows_with_hit_frequency_up_to_double() {
        let config = ttl_config();
        let base = compute_ttl(&config, TtlCategory::Dynamic, 0, 0);
        let busy = compute_ttl(&config, TtlCategory::Dynamic, 0, 50);
        let saturated = compute_ttl(&config, TtlCategory::Dynamic, 0, 1000);

        assert!(busy > base);
        assert_eq!(saturated, Duration::from_secs(2400));
    }

    #[test]
    fn ttl_grows_with_size_up_to_cap() {
        let config = ttl_config();
        let small = compute_ttl(&config, TtlCategory::Dynamic, 1000, 0);
        let large = compute_ttl(&config, TtlCategory::Dynamic, 10_000_000, 0);

        assert!(large > small);
        assert_eq!(large, Duration::from_secs(1800));
    }

    #[test]
    fn ttl_respects_clamps() {
        let mut config = ttl_config();
        config.max_seconds = 1000;
        let clamped = compute_ttl(&config, TtlCategory::Reference, 10_000_000, 1000);
        assert_eq!(clamped, Duration::from_secs(1000));

        config.min_seconds = 90;
        let floored = compute_ttl(&config, TtlCategory::RealTime, 0, 0);
        assert!(floored >= Duration::from_secs(90));
    }

    #[test]
    fn breaker_failure_classification() {
        assert!(is_breaker_failure(&ProxyError::Upstream5xx { status: 500 }));
        assert!(is_breaker_failure(&ProxyError::UpstreamUnavailable {
            attempts: 3
        }));
        assert!(!is_breaker_failure(&ProxyError::Upstream4xx {
            status: 404,
            body: String::new()
        }));
        assert!(!is_breaker_failure(&ProxyError::Transform("x".into())));
    }
}
