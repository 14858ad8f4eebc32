use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};

use super::error::{CacheError, Result};

/// Value-type discriminants stored in the `mode` column
pub(crate) mod mode {
    pub const INTEGER: i64 = 0;
    pub const FLOAT: i64 = 1;
    pub const TEXT: i64 = 2;
    pub const BYTES: i64 = 3;
}

/// Typed cache key. Equality is exact and type-sensitive: the integer `1`,
/// the float `1.0`, and the text `"1"` are three distinct keys.
#[derive(Debug, Clone)]
pub enum CacheKey {
    Integer(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl CacheKey {
    /// Type discriminant stored in the `kind` column alongside the key,
    /// so that identity survives SQLite's cross-type numeric comparisons
    pub(crate) fn kind(&self) -> i64 {
        match self {
            CacheKey::Integer(_) => 0,
            CacheKey::Float(_) => 1,
            CacheKey::Text(_) => 2,
            CacheKey::Bytes(_) => 3,
        }
    }

    pub(crate) fn to_sql(&self) -> SqlValue {
        match self {
            CacheKey::Integer(i) => SqlValue::Integer(*i),
            CacheKey::Float(f) => SqlValue::Real(*f),
            CacheKey::Text(s) => SqlValue::Text(s.clone()),
            CacheKey::Bytes(b) => SqlValue::Blob(b.clone()),
        }
    }
}

// Float keys compare by bit pattern so the key type can be used in hash
// maps (the stampede barrier keys its wait queues by CacheKey).
impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (CacheKey::Integer(a), CacheKey::Integer(b)) => a == b,
            (CacheKey::Float(a), CacheKey::Float(b)) => a.to_bits() == b.to_bits(),
            (CacheKey::Text(a), CacheKey::Text(b)) => a == b,
            (CacheKey::Bytes(a), CacheKey::Bytes(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind().hash(state);
        match self {
            CacheKey::Integer(i) => i.hash(state),
            CacheKey::Float(f) => f.to_bits().hash(state),
            CacheKey::Text(s) => s.hash(state),
            CacheKey::Bytes(b) => b.hash(state),
        }
    }
}

impl From<i64> for CacheKey {
    fn from(v: i64) -> Self {
        CacheKey::Integer(v)
    }
}

impl From<f64> for CacheKey {
    fn from(v: f64) -> Self {
        CacheKey::Float(v)
    }
}

impl From<&str> for CacheKey {
    fn from(v: &str) -> Self {
        CacheKey::Text(v.to_string())
    }
}

impl From<String> for CacheKey {
    fn from(v: String) -> Self {
        CacheKey::Text(v)
    }
}

impl From<Vec<u8>> for CacheKey {
    fn from(v: Vec<u8>) -> Self {
        CacheKey::Bytes(v)
    }
}

/// Typed cache value. Integers and floats are always stored inline;
/// text and bytes move to the blob store past the inline threshold.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    Integer(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl CacheValue {
    pub(crate) fn mode(&self) -> i64 {
        match self {
            CacheValue::Integer(_) => mode::INTEGER,
            CacheValue::Float(_) => mode::FLOAT,
            CacheValue::Text(_) => mode::TEXT,
            CacheValue::Bytes(_) => mode::BYTES,
        }
    }

    /// Byte size used for capacity accounting
    pub(crate) fn payload_size(&self) -> u64 {
        match self {
            CacheValue::Integer(_) | CacheValue::Float(_) => 8,
            CacheValue::Text(s) => s.len() as u64,
            CacheValue::Bytes(b) => b.len() as u64,
        }
    }

    /// Serialized payload for values stored as blob files
    pub(crate) fn to_file_bytes(&self) -> &[u8] {
        match self {
            CacheValue::Text(s) => s.as_bytes(),
            CacheValue::Bytes(b) => b.as_slice(),
            // Scalars are always inline; callers never route them here
            CacheValue::Integer(_) | CacheValue::Float(_) => &[],
        }
    }

    /// Rebuild a value from an inline column payload
    pub(crate) fn from_inline(mode_col: i64, value: SqlValue) -> Result<CacheValue> {
        match (mode_col, value) {
            (mode::INTEGER, SqlValue::Integer(i)) => Ok(CacheValue::Integer(i)),
            (mode::FLOAT, SqlValue::Real(f)) => Ok(CacheValue::Float(f)),
            (mode::TEXT, SqlValue::Text(s)) => Ok(CacheValue::Text(s)),
            (mode::BYTES, SqlValue::Blob(b)) => Ok(CacheValue::Bytes(b)),
            (m, v) => Err(CacheError::TypeMismatch(format!(
                "mode {m} with inline column {:?}",
                v.data_type()
            ))),
        }
    }

    /// Rebuild a value from a blob file payload
    pub(crate) fn from_file_bytes(mode_col: i64, bytes: Vec<u8>) -> Result<CacheValue> {
        match mode_col {
            mode::TEXT => String::from_utf8(bytes)
                .map(CacheValue::Text)
                .map_err(|_| CacheError::Corruption("blob file is not valid UTF-8".to_string())),
            mode::BYTES => Ok(CacheValue::Bytes(bytes)),
            m => Err(CacheError::TypeMismatch(format!(
                "mode {m} entries are never blob-stored"
            ))),
        }
    }

    pub(crate) fn to_inline_sql(&self) -> SqlValue {
        match self {
            CacheValue::Integer(i) => SqlValue::Integer(*i),
            CacheValue::Float(f) => SqlValue::Real(*f),
            CacheValue::Text(s) => SqlValue::Text(s.clone()),
            CacheValue::Bytes(b) => SqlValue::Blob(b.clone()),
        }
    }
}

impl From<i64> for CacheValue {
    fn from(v: i64) -> Self {
        CacheValue::Integer(v)
    }
}

impl From<f64> for CacheValue {
    fn from(v: f64) -> Self {
        CacheValue::Float(v)
    }
}

impl From<&str> for CacheValue {
    fn from(v: &str) -> Self {
        CacheValue::Text(v.to_string())
    }
}

impl From<String> for CacheValue {
    fn from(v: String) -> Self {
        CacheValue::Text(v)
    }
}

impl From<Vec<u8>> for CacheValue {
    fn from(v: Vec<u8>) -> Self {
        CacheValue::Bytes(v)
    }
}

/// Eviction policy applied when the cache exceeds its size limit
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionPolicy {
    /// Oldest writes evicted first
    #[default]
    LeastRecentlyStored,
    /// Least recently read evicted first
    LeastRecentlyUsed,
    /// Least-read evicted first, ties broken by oldest access time
    LeastFrequentlyUsed,
}

impl EvictionPolicy {
    /// Name persisted in the settings table
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionPolicy::LeastRecentlyStored => "least-recently-stored",
            EvictionPolicy::LeastRecentlyUsed => "least-recently-used",
            EvictionPolicy::LeastFrequentlyUsed => "least-frequently-used",
        }
    }

    pub(crate) fn parse(name: &str) -> Option<EvictionPolicy> {
        match name {
            "least-recently-stored" => Some(EvictionPolicy::LeastRecentlyStored),
            "least-recently-used" => Some(EvictionPolicy::LeastRecentlyUsed),
            "least-frequently-used" => Some(EvictionPolicy::LeastFrequentlyUsed),
            _ => None,
        }
    }

    /// ORDER BY clause selecting eviction victims for this policy
    pub(crate) fn order_clause(&self) -> &'static str {
        match self {
            EvictionPolicy::LeastRecentlyStored => "store_time",
            EvictionPolicy::LeastRecentlyUsed => "access_time",
            EvictionPolicy::LeastFrequentlyUsed => "access_count, access_time",
        }
    }

    /// Secondary index created at open for this policy's ordering column
    pub(crate) fn init_index_sql(&self) -> &'static str {
        match self {
            EvictionPolicy::LeastRecentlyStored => {
                "CREATE INDEX IF NOT EXISTS entries_store_time ON entries (store_time)"
            }
            EvictionPolicy::LeastRecentlyUsed => {
                "CREATE INDEX IF NOT EXISTS entries_access_time ON entries (access_time)"
            }
            EvictionPolicy::LeastFrequentlyUsed => {
                "CREATE INDEX IF NOT EXISTS entries_access_count ON entries (access_count)"
            }
        }
    }
}

/// Cache statistics
#[derive(Debug, Default, Clone, Serialize)]
pub struct CacheStats {
    /// Number of entries physically present (including not-yet-culled rows)
    pub entries: u64,
    /// Sum of live entries' payload sizes in bytes
    pub total_size: u64,
    /// Number of cache hits
    pub hits: u64,
    /// Number of cache misses
    pub misses: u64,
    /// Number of entries removed by capacity eviction
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate hit rate
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Current time as fractional unix seconds, the timestamp unit of the index
pub(crate) fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_key_type_sensitivity() {
        let int_key = CacheKey::from(1i64);
        let text_key = CacheKey::from("1");
        let float_key = CacheKey::from(1.0f64);

        assert_ne!(int_key, text_key);
        assert_ne!(int_key, float_key);
        assert_ne!(text_key, CacheKey::Bytes(b"1".to_vec()));
    }

    #[test]
    fn test_float_keys_hash_by_bits() {
        let mut map = HashMap::new();
        map.insert(CacheKey::from(2.5f64), 1);
        assert_eq!(map.get(&CacheKey::from(2.5f64)), Some(&1));
        assert_eq!(map.get(&CacheKey::from(2.6f64)), None);
    }

    #[test]
    fn test_inline_roundtrip() {
        let cases = vec![
            CacheValue::Integer(-42),
            CacheValue::Float(3.5),
            CacheValue::Text("hello".to_string()),
            CacheValue::Bytes(vec![0, 1, 2]),
        ];

        for value in cases {
            let decoded =
                CacheValue::from_inline(value.mode(), value.to_inline_sql()).unwrap();
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn test_inline_mode_mismatch() {
        let result = CacheValue::from_inline(mode::INTEGER, SqlValue::Text("1".to_string()));
        assert!(matches!(result, Err(CacheError::TypeMismatch(_))));
    }

    #[test]
    fn test_policy_names_roundtrip() {
        for policy in [
            EvictionPolicy::LeastRecentlyStored,
            EvictionPolicy::LeastRecentlyUsed,
            EvictionPolicy::LeastFrequentlyUsed,
        ] {
            assert_eq!(EvictionPolicy::parse(policy.as_str()), Some(policy));
        }
        assert_eq!(EvictionPolicy::parse("random"), None);
    }
}
