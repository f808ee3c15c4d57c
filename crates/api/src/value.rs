//! Accessors for the generic JSON trees the API returns
//!
//! Proxmox encodes numbers inconsistently (floats, ints and numeric
//! strings) and booleans as 0/1, "1" or true depending on the endpoint.

use serde_json::Value;

pub fn get_str<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key)?.as_str()
}

pub fn get_string(v: &Value, key: &str) -> String {
    get_str(v, key).unwrap_or_default().to_string()
}

pub fn get_f64(v: &Value, key: &str) -> f64 {
    match v.get(key) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

pub fn get_u64(v: &Value, key: &str) -> u64 {
    get_f64(v, key).max(0.0) as u64
}

/// Truthy under any of the encodings the API uses.
pub fn get_flag(v: &Value, key: &str) -> bool {
    match v.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0) != 0.0,
        Some(Value::String(s)) => s == "1" || s == "true",
        _ => false,
    }
}

/// Non-empty string fields become Some.
pub fn get_opt_string(v: &Value, key: &str) -> Option<String> {
    match get_str(v, key) {
        Some("") | None => None,
        Some(s) => Some(s.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flags_accept_mixed_encodings() {
        let v = json!({"a": 1, "b": "1", "c": true, "d": 0, "e": "0", "f": "true"});
        assert!(get_flag(&v, "a"));
        assert!(get_flag(&v, "b"));
        assert!(get_flag(&v, "c"));
        assert!(get_flag(&v, "f"));
        assert!(!get_flag(&v, "d"));
        assert!(!get_flag(&v, "e"));
        assert!(!get_flag(&v, "missing"));
    }

    #[test]
    fn numbers_accept_strings() {
        let v = json!({"port": "5900", "cpu": 0.25});
        assert_eq!(get_u64(&v, "port"), 5900);
        assert!((get_f64(&v, "cpu") - 0.25).abs() < f64::EPSILON);
    }
}
