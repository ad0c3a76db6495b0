use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Parameter names whose values must never influence a cache key. Matched
/// case-insensitively against the parameter name.
const SENSITIVE_PARAMS: &[&str] = &[
    "key",
    "api_key",
    "apikey",
    "token",
    "access_token",
    "auth_token",
    "secret",
    "api_secret",
];

/// Cache key generator for proxied endpoint requests
pub struct CacheKeyGenerator;

impl CacheKeyGenerator {
    /// Generate a deterministic cache key for a request.
    ///
    /// The key is a SHA-256 hash of the endpoint and its parameters, sorted
    /// by name so logically identical requests hash identically regardless
    /// of input order. Sensitive parameters (API keys, tokens, secrets) are
    /// removed before hashing.
    pub fn generate(endpoint: &str, params: &HashMap<String, String>) -> String {
        let mut hasher = Sha256::new();

        hasher.update(endpoint.as_bytes());
        hasher.update(b"|");

        let mut sorted_params: Vec<(&String, &String)> = params
            .iter()
            .filter(|(k, _)| !Self::is_sensitive(k))
            .collect();
        sorted_params.sort_by_key(|(k, _)| *k);

        for (key, value) in sorted_params {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b"&");
        }

        let result = hasher.finalize();
        format!("{endpoint}:{result:x}")
    }

    /// Whether a parameter name is excluded from key derivation
    pub fn is_sensitive(name: &str) -> bool {
        let lower = name.to_ascii_lowercase();
        SENSITIVE_PARAMS.contains(&lower.as_str())
    }

    /// Validate the `endpoint:hash` key format
    pub fn is_valid_key(key: &str) -> bool {
        if let Some((endpoint, hash)) = key.rsplit_once(':') {
            !endpoint.is_empty() && hash.len() == 64 && hash.chars().all(|c| c.is_ascii_hexdigit())
        } else {
            false
        }
    }
}
