use chrono::DateTime;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

// ── Symbols & identifiers ─────────────────────────────────────────────────────

pub fn normalise_symbol(s: &str) -> String {
    s.trim().to_uppercase()
}

/// CIK as a 10-digit zero-padded string.
/// 320193 → "0000320193" | "0000320193" → "0000320193"
pub fn pad_cik(v: &Value) -> Option<String> {
    let digits = match v {
        Value::Number(n) => n.as_u64()?.to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => return None,
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(format!("{:0>10}", digits))
}

// ── Info payload ──────────────────────────────────────────────────────────────

/// Flatten quoteSummary modules into one scalar map.
/// `{"raw": 1.5, "fmt": "1.50"}` → 1.5; nested objects and arrays are dropped;
/// when two modules share a key, the module whose name sorts first wins
/// (the map iterates alphabetically, not in request order).
pub fn flatten_modules(modules: &Map<String, Value>) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    for module in modules.values() {
        let Value::Object(fields) = module else { continue };
        for (key, value) in fields {
            if out.contains_key(key) {
                continue;
            }
            if let Some(scalar) = scalar_of(value) {
                out.insert(key.clone(), scalar);
            }
        }
    }
    out
}

fn scalar_of(value: &Value) -> Option<Value> {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => Some(value.clone()),
        Value::Object(obj) => match obj.get("raw") {
            Some(raw @ (Value::Number(_) | Value::String(_) | Value::Bool(_))) => Some(raw.clone()),
            // `{}` is how the provider spells "no value"
            None if obj.is_empty() => Some(Value::Null),
            _ => None,
        },
        Value::Array(_) => None,
    }
}

// ── Dates ─────────────────────────────────────────────────────────────────────

/// Epoch seconds → "YYYY-MM-DD". Non-finite or out-of-range → None.
pub fn epoch_to_date(secs: f64) -> Option<String> {
    if !secs.is_finite() {
        return None;
    }
    DateTime::from_timestamp(secs as i64, 0).map(|dt| dt.format("%Y-%m-%d").to_string())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
