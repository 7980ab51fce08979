use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Scalar metadata value. The closed set of kinds gives template
/// substitution one stringification rule per kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MetaValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
}

/// Key-sorted so rendering and persistence are deterministic.
pub type Metadata = BTreeMap<String, MetaValue>;

impl MetaValue {
    /// Text substituted for a `${key}` placeholder.
    pub fn render(&self) -> String {
        match self {
            MetaValue::String(s) => s.clone(),
            MetaValue::Integer(i) => i.to_string(),
            MetaValue::Float(f) => f.to_string(),
            MetaValue::Boolean(b) => b.to_string(),
            MetaValue::Timestamp(t) => format_timestamp(t),
        }
    }

    /// False only for NaN or infinite floats, which JSON cannot hold.
    pub fn is_persistable(&self) -> bool {
        match self {
            MetaValue::Float(f) => f.is_finite(),
            _ => true,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MetaValue::String(_) => "string",
            MetaValue::Integer(_) => "integer",
            MetaValue::Float(_) => "float",
            MetaValue::Boolean(_) => "boolean",
            MetaValue::Timestamp(_) => "timestamp",
        }
    }
}

impl std::fmt::Display for MetaValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

/// RFC 3339, second precision, `Z` suffix: `2024-01-01T00:00:00Z`.
pub fn format_timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl From<&str> for MetaValue {
    fn from(v: &str) -> Self {
        MetaValue::String(v.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(v: String) -> Self {
        MetaValue::String(v)
    }
}

impl From<i64> for MetaValue {
    fn from(v: i64) -> Self {
        MetaValue::Integer(v)
    }
}

impl From<f64> for MetaValue {
    fn from(v: f64) -> Self {
        MetaValue::Float(v)
    }
}

impl From<bool> for MetaValue {
    fn from(v: bool) -> Self {
        MetaValue::Boolean(v)
    }
}

impl From<DateTime<Utc>> for MetaValue {
    fn from(v: DateTime<Utc>) -> Self {
        MetaValue::Timestamp(v)
    }
}

/// Parse a `key=value` pair as given on a command line. Integers, floats and
/// booleans are recognized; everything else stays a string.
pub fn parse_meta_pair(pair: &str) -> Option<(String, MetaValue)> {
    let (key, raw) = pair.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    let value = if let Ok(i) = raw.parse::<i64>() {
        MetaValue::Integer(i)
    } else if let Some(f) = raw.parse::<f64>().ok().filter(|f| f.is_finite()) {
        MetaValue::Float(f)
    } else if raw == "true" || raw == "false" {
        MetaValue::Boolean(raw == "true")
    } else {
        MetaValue::String(raw.to_string())
    };
    Some((key.to_string(), value))
}
