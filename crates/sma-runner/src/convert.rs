use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sma_core::{MetaValue, Metadata};

/// Convert a JSON object of scalars (trigger output) into metadata.
pub fn metadata_from_json(value: &serde_json::Value) -> Result<Metadata> {
    let obj = value
        .as_object()
        .ok_or_else(|| anyhow!("expected a JSON object of metadata, got {}", value))?;
    let mut meta = Metadata::new();
    for (k, v) in obj {
        meta.insert(k.clone(), meta_from_json(k, v)?);
    }
    Ok(meta)
}

fn meta_from_json(key: &str, v: &serde_json::Value) -> Result<MetaValue> {
    use serde_json::Value;
    match v {
        Value::String(s) => Ok(MetaValue::String(s.clone())),
        Value::Bool(b) => Ok(MetaValue::Boolean(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(MetaValue::Integer(i))
            } else if let Some(f) = n.as_f64() {
                Ok(MetaValue::Float(f))
            } else {
                Err(anyhow!("metadata `{}`: number {} out of range", key, n))
            }
        }
        other => Err(anyhow!("metadata `{}` must be a scalar, got {}", key, other)),
    }
}

/// Convert config extras. TOML datetimes with an offset become timestamps;
/// local dates and times stay strings.
pub fn metadata_from_toml(extras: &BTreeMap<String, toml::Value>) -> Result<Metadata> {
    let mut meta = Metadata::new();
    for (k, v) in extras {
        let value = match v {
            toml::Value::String(s) => MetaValue::String(s.clone()),
            toml::Value::Integer(i) => MetaValue::Integer(*i),
            toml::Value::Float(f) if f.is_finite() => MetaValue::Float(*f),
            toml::Value::Float(f) => return Err(anyhow!("session extra `{}` must be a finite number, got {}", k, f)),
            toml::Value::Boolean(b) => MetaValue::Boolean(*b),
            toml::Value::Datetime(dt) => {
                let text = dt.to_string();
                match DateTime::parse_from_rfc3339(&text) {
                    Ok(t) => MetaValue::Timestamp(t.with_timezone(&Utc)),
                    Err(_) => MetaValue::String(text),
                }
            }
            other => return Err(anyhow!("session extra `{}` must be a scalar, got {}", k, other.type_str())),
        };
        meta.insert(k.clone(), value);
    }
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn json_scalars_convert() {
        let v = serde_json::json!({"name": "cpu", "batch": 64, "lr": 0.01, "warm": true});
        let m = metadata_from_json(&v).unwrap();
        assert_eq!(m["name"], MetaValue::from("cpu"));
        assert_eq!(m["batch"], MetaValue::Integer(64));
        assert_eq!(m["lr"], MetaValue::Float(0.01));
        assert_eq!(m["warm"], MetaValue::Boolean(true));
    }

    #[test]
    fn json_nested_values_rejected() {
        assert!(metadata_from_json(&serde_json::json!({"a": [1]})).is_err());
        assert!(metadata_from_json(&serde_json::json!({"a": null})).is_err());
        assert!(metadata_from_json(&serde_json::json!([1, 2])).is_err());
    }

    #[test]
    fn toml_extras_convert() {
        let table: BTreeMap<String, toml::Value> = toml::from_str(
            r#"
cluster = "lab"
nodes = 3
since = 2024-01-01T00:00:00Z
day = 2024-01-01
"#,
        )
        .unwrap();
        let m = metadata_from_toml(&table).unwrap();
        assert_eq!(m["cluster"], MetaValue::from("lab"));
        assert_eq!(m["nodes"], MetaValue::Integer(3));
        assert_eq!(
            m["since"],
            MetaValue::Timestamp(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(m["day"], MetaValue::from("2024-01-01"));
    }

    #[test]
    fn toml_non_finite_floats_rejected() {
        for raw in ["load = nan", "load = inf", "load = -inf"] {
            let table: BTreeMap<String, toml::Value> = toml::from_str(raw).unwrap();
            let err = metadata_from_toml(&table).unwrap_err();
            assert!(err.to_string().contains("finite"), "{}", raw);
        }
    }
}
