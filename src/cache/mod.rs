use std::time::{Duration, Instant};

pub mod key;
pub mod tier;
pub mod tiered;

pub use tier::{CacheTier, TierStats};
pub use tiered::{Lookup, TieredCache};

/// One row stored in a cache tier.
///
/// The body may be held deflate-compressed; `size_bytes` always reflects the
/// uncompressed payload.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub body: Vec<u8>,
    pub content_type: String,
    pub created_at: Instant,
    pub expires_at: Instant,
    pub last_accessed_at: Instant,
    pub access_count: u64,
    pub size_bytes: usize,
    pub compressed: bool,
}

impl CacheEntry {
    /// Build a fresh entry, compressing the body when it crosses the
    /// threshold. A zero threshold disables compression.
    pub fn new(
        key: String,
        body: Vec<u8>,
        content_type: String,
        ttl: Duration,
        compression_threshold: usize,
    ) -> Self {
        let size_bytes = body.len();
        let (stored, compressed) = if compression_threshold > 0 && size_bytes > compression_threshold
        {
            (compress(&body), true)
        } else {
            (body, false)
        };

        let now = Instant::now();
        Self {
            key,
            body: stored,
            content_type,
            created_at: now,
            expires_at: now + ttl,
            last_accessed_at: now,
            access_count: 0,
            size_bytes,
            compressed,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Uncompressed body, decompressing when needed.
    pub fn decompressed_body(&self) -> Vec<u8> {
        if self.compressed {
            decompress(&self.body)
        } else {
            self.body.clone()
        }
    }
}

/// A body handed back from a cache lookup, already decompressed.
#[derive(Debug, Clone)]
pub struct CachedBody {
    pub body: Vec<u8>,
    pub content_type: String,
    pub age: Duration,
    pub size_bytes: usize,
}

impl CachedBody {
    fn from_entry(entry: &CacheEntry) -> Self {
        Self {
            body: entry.decompressed_body(),
            content_type: entry.content_type.clone(),
            age: entry.age(),
            size_bytes: entry.size_bytes,
        }
    }
}

fn compress(data: &[u8]) -> Vec<u8> {
    use std::io::Write;
    let mut encoder = flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn decompress(data: &[u8]) -> Vec<u8> {
    use std::io::Read;
    let mut decoder = flate2::read::DeflateDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).unwrap();
    out
}
