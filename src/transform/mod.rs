use crate::error::{ProxyError, Result};
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// TTL category assigned to an endpoint's responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlCategory {
    /// Live scoring, betting odds
    RealTime,
    /// Field updates, rankings
    Dynamic,
    /// Tournaments, historical stats
    Reference,
}

/// A pure normalization function: raw upstream body in, normalized body
/// out. Must be deterministic.
pub type TransformFn = fn(&Value) -> Result<Value>;

/// Registry entry tying a proxy endpoint to its upstream path, TTL
/// category, and normalization function.
#[derive(Clone)]
pub struct TransformerEntry {
    pub name: &'static str,
    pub upstream_path: String,
    pub category: TtlCategory,
    pub transform: TransformFn,
}

/// Maps endpoint names to normalization functions.
///
/// Unknown endpoints fall through to an identity transform and are proxied
/// to the upstream path matching their name.
pub struct TransformerRegistry {
    entries: HashMap<String, TransformerEntry>,
}

impl TransformerRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Registry with the standard golf feed endpoints
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("tournaments", "get-schedule", TtlCategory::Reference, transform_tournaments);
        registry.register("rankings", "preds/get-dg-rankings", TtlCategory::Dynamic, transform_rankings);
        registry.register("field", "field-updates", TtlCategory::Dynamic, transform_field);
        registry.register("scoring", "preds/live-tournament-stats", TtlCategory::RealTime, transform_scoring);
        registry.register("player-stats", "preds/player-decompositions", TtlCategory::Reference, transform_player_stats);
        registry.register("betting-odds", "betting-tools/outrights", TtlCategory::RealTime, transform_betting_odds);
        registry
    }

    pub fn register(
        &mut self,
        name: &'static str,
        upstream_path: &str,
        category: TtlCategory,
        transform: TransformFn,
    ) {
        self.entries.insert(
            name.to_string(),
            TransformerEntry {
                name,
                upstream_path: upstream_path.to_string(),
                category,
                transform,
            },
        );
    }

    /// Entry for an endpoint, falling back to an identity passthrough
    pub fn resolve(&self, endpoint: &str) -> TransformerEntry {
        self.entries.get(endpoint).cloned().unwrap_or_else(|| {
            let category = if endpoint.starts_with("live/") {
                TtlCategory::RealTime
            } else {
                TtlCategory::Dynamic
            };
            TransformerEntry {
                name: "identity",
                upstream_path: endpoint.to_string(),
                category,
                transform: transform_identity,
            }
        })
    }

    /// Run an endpoint's transform over a raw body and stamp the result.
    ///
    /// Non-JSON bodies pass through untouched. The transform itself is
    /// deterministic; only the `transformedAt` stamp added here varies.
    pub fn apply(&self, endpoint: &str, raw: &[u8]) -> Result<(Vec<u8>, &'static str)> {
        let entry = self.resolve(endpoint);

        let Ok(value) = serde_json::from_slice::<Value>(raw) else {
            return Ok((raw.to_vec(), entry.name));
        };

        let mut normalized = (entry.transform)(&value)?;
        if let Some(metadata) = normalized
            .get_mut("metadata")
            .and_then(Value::as_object_mut)
        {
            metadata.insert("transformedAt".to_string(), json!(Utc::now().to_rfc3339()));
        }

        Ok((serde_json::to_vec(&normalized)?, entry.name))
    }
}

impl Default for TransformerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// snake_case → camelCase for one key
fn camel_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper_next = false;
    for c in key.chars() {
        if c == '_' {
            upper_next = true;
        } else if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Recursively rename all object keys from the vendor's snake_case to the
/// proxy's camelCase schema.
fn camelize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(camel_case(k), camelize(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(camelize).collect()),
        other => other.clone(),
    }
}

/// Wrap a normalized list in the stable response shape
fn wrap_items(items: Vec<Value>) -> Value {
    let count = items.len();
    json!({
        "items": items,
        "metadata": { "count": count }
    })
}

/// Pull the named array out of the raw body, falling back to a root array,
/// then camelize each element.
fn list_from(raw: &Value, field: &str) -> Option<Vec<Value>> {
    let items = match raw.get(field) {
        Some(Value::Array(items)) => items,
        _ => match raw {
            Value::Array(items) => items,
            _ => return None,
        },
    };
    Some(items.iter().map(camelize).collect())
}

fn transform_identity(raw: &Value) -> Result<Value> {
    Ok(raw.clone())
}

fn transform_tournaments(raw: &Value) -> Result<Value> {
    match list_from(raw, "schedule") {
        Some(items) => Ok(wrap_items(items)),
        None => Ok(camelize(raw)),
    }
}

fn transform_rankings(raw: &Value) -> Result<Value> {
    match list_from(raw, "rankings") {
        Some(items) => Ok(wrap_items(items)),
        None => Ok(camelize(raw)),
    }
}

fn transform_field(raw: &Value) -> Result<Value> {
    match list_from(raw, "field") {
        Some(items) => {
            let mut wrapped = wrap_items(items);
            // The field feed carries event context worth preserving
            if let (Some(obj), Some(event)) = (wrapped.as_object_mut(), raw.get("event_name")) {
                obj.insert("eventName".to_string(), event.clone());
            }
            Ok(wrapped)
        }
        None => Ok(camelize(raw)),
    }
}

fn transform_scoring(raw: &Value) -> Result<Value> {
    match list_from(raw, "live_stats") {
        Some(items) => {
            let mut wrapped = wrap_items(items);
            if let Some(obj) = wrapped.as_object_mut() {
                if let Some(event) = raw.get("event_name") {
                    obj.insert("eventName".to_string(), event.clone());
                }
                if let Some(round) = raw.get("current_round") {
                    obj.insert("currentRound".to_string(), round.clone());
                }
            }
            Ok(wrapped)
        }
        None => Ok(camelize(raw)),
    }
}

fn transform_player_stats(raw: &Value) -> Result<Value> {
    match list_from(raw, "players") {
        Some(items) => Ok(wrap_items(items)),
        None => Ok(camelize(raw)),
    }
}

fn transform_betting_odds(raw: &Value) -> Result<Value> {
    match list_from(raw, "odds") {
        Some(items) => {
            let mut wrapped = wrap_items(items);
            if let (Some(obj), Some(market)) = (wrapped.as_object_mut(), raw.get("market")) {
                obj.insert("market".to_string(), market.clone());
            }
            Ok(wrapped)
        }
        None => Ok(camelize(raw)),
    }
}

/// Apply additional named transformers on top of an already-normalized
/// body, for requests that carry per-request transformation overrides.
pub fn apply_named(registry: &TransformerRegistry, names: &[String], body: &[u8]) -> Result<Vec<u8>> {
    let mut value: Value = serde_json::from_slice(body)
        .map_err(|_| ProxyError::Transform("override target is not JSON".to_string()))?;

    for name in names {
        let entry = registry.resolve(name);
        if entry.name == "identity" {
            return Err(ProxyError::Transform(format!(
                "unknown transformation '{name}'"
            )));
        }
        value = (entry.transform)(&value)?;
    }

    Ok(serde_json::to_vec(&value)?)
}
