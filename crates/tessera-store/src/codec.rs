//! Codec helpers: base64, JSON payload serialization and BLAKE3 content slugs.

use crate::error::StoreError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A 32-byte BLAKE3 hash of some content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    /// Return the hash as a lowercase hex string
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// First four bytes read little-endian.
    pub fn prefix_u32(&self) -> u32 {
        u32::from_le_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    /// First eight bytes read little-endian.
    pub fn prefix_u64(&self) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(b)
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Compute BLAKE3 hash of data
pub fn blake3_hash(data: &[u8]) -> ContentHash {
    ContentHash(*blake3::hash(data).as_bytes())
}

/// URL-safe, unpadded base64.
pub fn b64_encode(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// Inverse of [`b64_encode`].
pub fn b64_decode(s: &str) -> Result<Vec<u8>, StoreError> {
    URL_SAFE_NO_PAD
        .decode(s)
        .map_err(|e| StoreError::Serialization(format!("base64: {}", e)))
}

/// Serialize a payload or index for sealing.
pub fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec(value)?)
}

/// Deserialize an opened payload or index.
pub fn from_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Stable identifier of a file path: 64 bits of BLAKE3 over the `/`-joined segments.
pub fn file_slug(path: &[String]) -> String {
    format!("{:016x}", blake3_hash(path.join("/").as_bytes()).prefix_u64())
}

/// Timeline slug: eight hex digits of whole seconds followed by eight hex
/// digits of the token hash, so lexicographic order follows time.
pub fn timeline_slug(timestamp: f64, token: &serde_json::Value) -> Result<String, StoreError> {
    let secs = timestamp.floor().clamp(0.0, u32::MAX as f64) as u32;
    let canonical = serde_json::to_vec(token)?;
    Ok(format!(
        "{:08x}{:08x}",
        secs,
        blake3_hash(&canonical).prefix_u32()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_b64_is_url_safe() {
        let enc = b64_encode(&[0xfb, 0xff, 0xfe]);
        assert!(!enc.contains('+') && !enc.contains('/') && !enc.contains('='));
        assert_eq!(b64_decode(&enc).unwrap(), vec![0xfb, 0xff, 0xfe]);
    }

    #[test]
    fn test_b64_decode_rejects_garbage() {
        assert!(matches!(
            b64_decode("not base64!"),
            Err(StoreError::Serialization(_))
        ));
    }

    #[test]
    fn test_file_slug_depends_on_full_path() {
        let a = file_slug(&["export.zip".into(), "a.json".into()]);
        let b = file_slug(&["export.zip".into(), "b.json".into()]);
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
        assert_eq!(a, file_slug(&["export.zip".into(), "a.json".into()]));
    }

    #[test]
    fn test_timeline_slug_layout() {
        let slug = timeline_slug(255.9, &json!({"a": 1})).unwrap();
        assert_eq!(slug.len(), 16);
        assert!(slug.starts_with("000000ff"));
    }

    #[test]
    fn test_negative_timestamp_clamps() {
        let slug = timeline_slug(-5.0, &json!("x")).unwrap();
        assert!(slug.starts_with("00000000"));
    }

    #[test]
    fn test_same_token_same_slug() {
        let t = json!({"title": "hello", "n": [1, 2]});
        assert_eq!(
            timeline_slug(1_600_000_000.0, &t).unwrap(),
            timeline_slug(1_600_000_000.4, &t).unwrap()
        );
        assert_ne!(
            timeline_slug(1_600_000_000.0, &t).unwrap(),
            timeline_slug(1_600_000_000.0, &json!({"title": "other"})).unwrap()
        );
    }

    proptest! {
        #[test]
        fn prop_slug_order_follows_time(a in 0u32..u32::MAX, b in 0u32..u32::MAX) {
            let token = json!(null);
            let sa = timeline_slug(a as f64, &token).unwrap();
            let sb = timeline_slug(b as f64, &token).unwrap();
            if a < b {
                prop_assert!(sa < sb);
            }
        }
    }
}
