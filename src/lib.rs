//! # Fairway - Golf Data Reverse Proxy
//!
//! A caching, rate-limiting, fault-tolerant reverse proxy placed between
//! untrusted clients and a third-party golf data feed. Responses are served
//! from a three-tier in-memory cache or fetched fresh from the upstream
//! feed, normalized to a stable schema, written back to every tier, and
//! returned with cache provenance metadata.
//!
//! ## Subsystems
//!
//! - **Tiered cache**: L1 (LRU), L2 (FIFO), L3 (LFU) with per-entry TTLs,
//!   promotion on read, and regex pattern invalidation
//! - **Request pipeline**: session handling, rate limiting, circuit
//!   breaking, single-flight upstream dispatch, transformation, write-back
//! - **Upstream client**: retry with exponential backoff and jitter
//! - **Session envelope**: anonymous per-client state carried as an
//!   AES-256-GCM encrypted token; the server stores nothing
//!
//! ## Quick Start
//!
//! ```no_run
//! use fairway::config::Config;
//! use fairway::pipeline::{Pipeline, ProxyRequest};
//! use fairway::upstream::UpstreamClient;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::load(None)?;
//!     config.server.dev_mode = true;
//!     config.upstream.api_key = Some("your-feed-key".into());
//!
//!     let fetcher = Arc::new(UpstreamClient::new(config.upstream.clone()));
//!     let pipeline = Pipeline::new(&config, fetcher);
//!
//!     let response = pipeline
//!         .process(ProxyRequest {
//!             endpoint: "tournaments".into(),
//!             ..Default::default()
//!         })
//!         .await;
//!     println!("served: {:?}", response.result.is_ok());
//!
//!     Ok(())
//! }
//! ```

pub mod breaker;
pub mod cache;
pub mod config;
pub mod error;
pub mod limiter;
pub mod metrics;
pub mod pipeline;
pub mod server;
pub mod session;
pub mod singleflight;
pub mod transform;
pub mod upstream;
