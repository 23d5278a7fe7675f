//! Content-addressed hashing primitives
//!
//! [`ContentHash`] is the 32-byte Blake3 digest used to tag every pipeline
//! input and output. [`InputSet`] digests a unit's declared inputs
//! independently of the order they were collected in.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// A 32-byte content hash (Blake3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Create a new ContentHash from raw bytes
    #[inline]
    #[must_use]
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get reference to the underlying bytes
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create hash from byte slice
    ///
    /// # Errors
    /// Returns error if slice length is not exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, HashError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| HashError::InvalidLength {
            expected: 32,
            actual: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    /// Compute Blake3 hash of arbitrary data
    #[inline]
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self::new(*blake3::hash(data).as_bytes())
    }

    /// Hash of a UTF-8 string
    #[inline]
    #[must_use]
    pub fn of_str(text: &str) -> Self {
        Self::compute(text.as_bytes())
    }

    /// Hash of a JSON document in canonical form (object keys sorted at
    /// every depth), so semantically equal documents hash equally.
    #[must_use]
    pub fn of_json(value: &Value) -> Self {
        let mut buf = Vec::new();
        write_canonical(value, &mut buf);
        Self::compute(&buf)
    }

    /// Short string representation (first 16 hex chars)
    #[inline]
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for ContentHash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes)
    }
}

impl serde::Serialize for ContentHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Canonical JSON encoding: sorted object keys, no insignificant whitespace.
fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push(b'{');
            for (i, (key, item)) in sorted.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(&Value::String(key.clone()), out);
                out.push(b':');
                write_canonical(item, out);
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        scalar => out.extend_from_slice(scalar.to_string().as_bytes()),
    }
}

/// Named input hashes of one pipeline unit
///
/// Entries are keyed by input name, so insertion order never affects
/// [`InputSet::digest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct InputSet {
    entries: BTreeMap<String, ContentHash>,
}

impl InputSet {
    /// Empty input set
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    #[inline]
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, hash: ContentHash) -> Self {
        self.insert(name, hash);
        self
    }

    /// Insert or replace a named input
    #[inline]
    pub fn insert(&mut self, name: impl Into<String>, hash: ContentHash) {
        self.entries.insert(name.into(), hash);
    }

    /// Look up a named input
    #[inline]
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ContentHash> {
        self.entries.get(name)
    }

    /// Number of inputs
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no inputs are declared
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate inputs in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ContentHash)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Names whose hash differs between `self` and `other`, including
    /// names present on one side only.
    #[must_use]
    pub fn differing(&self, other: &InputSet) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .iter()
            .filter(|(k, v)| other.entries.get(*k) != Some(*v))
            .map(|(k, _)| k.clone())
            .collect();
        names.extend(
            other
                .entries
                .keys()
                .filter(|k| !self.entries.contains_key(*k))
                .cloned(),
        );
        names.sort();
        names
    }

    /// Single digest over the whole set
    #[must_use]
    pub fn digest(&self) -> ContentHash {
        let mut hasher = blake3::Hasher::new();
        for (name, hash) in &self.entries {
            hasher.update(name.as_bytes());
            hasher.update(&[0]);
            hasher.update(hash.as_bytes());
        }
        ContentHash::new(*hasher.finalize().as_bytes())
    }
}

/// Errors that can occur when working with content hashes
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    /// Invalid hash length
    #[error("invalid hash length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// Hex encoding error
    #[error("hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_hash_from_slice_invalid_length() {
        let bytes = vec![1u8; 31];
        let result = ContentHash::from_slice(&bytes);
        assert!(matches!(
            result,
            Err(HashError::InvalidLength {
                expected: 32,
                actual: 31
            })
        ));
    }

    #[test]
    fn content_hash_display_and_parse() {
        let hash = ContentHash::of_str("test");
        let parsed: ContentHash = hash.to_string().parse().unwrap();
        assert_eq!(hash, parsed);
        assert!(hash.to_string().starts_with(&hash.short()));
    }

    #[test]
    fn content_hash_serde_is_hex_string() {
        let hash = ContentHash::of_str("test");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json.len(), 66);
        let decoded: ContentHash = serde_json::from_str(&json).unwrap();
        assert_eq!(hash, decoded);
    }

    #[test]
    fn json_hash_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"bg":"dark","layout":{"x":1,"y":2}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"layout":{"y":2,"x":1},"bg":"dark"}"#).unwrap();
        assert_eq!(ContentHash::of_json(&a), ContentHash::of_json(&b));
        assert_ne!(
            ContentHash::of_json(&a),
            ContentHash::of_json(&json!({"bg": "light"}))
        );
    }

    #[test]
    fn json_hash_keeps_array_order() {
        assert_ne!(
            ContentHash::of_json(&json!([1, 2])),
            ContentHash::of_json(&json!([2, 1]))
        );
    }

    #[test]
    fn input_set_digest_is_order_independent() {
        let a = InputSet::new()
            .with("narration", ContentHash::of_str("n"))
            .with("type", ContentHash::of_str("code"));
        let b = InputSet::new()
            .with("type", ContentHash::of_str("code"))
            .with("narration", ContentHash::of_str("n"));
        assert_eq!(a.digest(), b.digest());
        assert!(a.differing(&b).is_empty());
    }

    #[test]
    fn input_set_differing_names_both_sides() {
        let a = InputSet::new()
            .with("narration", ContentHash::of_str("n1"))
            .with("only_a", ContentHash::of_str("x"));
        let b = InputSet::new()
            .with("narration", ContentHash::of_str("n2"))
            .with("only_b", ContentHash::of_str("y"));
        assert_eq!(a.differing(&b), vec!["narration", "only_a", "only_b"]);
        assert_ne!(a.digest(), b.digest());
    }
}
