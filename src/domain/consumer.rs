use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

/// User-supplied override for consumer identification.
///
/// Receives the request headers with lowercased names and returns the
/// consumer ID to attach, or `None` for anonymous traffic. The result is
/// used as-is apart from the sanitizer's length cap.
pub type IdentifyConsumerFn = Arc<dyn Fn(&HashMap<String, String>) -> Option<String> + Send + Sync>;

/// Derives a stable consumer ID from request headers.
///
/// An `x-api-key` header wins and is used verbatim. Otherwise the
/// `authorization` value is hashed so that bearer tokens never leave the
/// process. Empty header values are treated as absent.
pub fn default_identify_consumer(headers: &HashMap<String, String>) -> Option<String> {
    if let Some(key) = headers.get("x-api-key")
        && !key.is_empty()
    {
        return Some(key.clone());
    }

    match headers.get("authorization") {
        Some(auth) if !auth.is_empty() => Some(hash_consumer_id(auth)),
        _ => None,
    }
}

/// Returns `"hash_"` followed by the first 12 hex digits of SHA-256(value).
pub fn hash_consumer_id(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    let prefix: String = digest[..6].iter().map(|b| format!("{b:02x}")).collect();
    format!("hash_{prefix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn api_key_header_used_verbatim() {
        let h = headers(&[("x-api-key", "ak_live_abc123")]);
        assert_eq!(default_identify_consumer(&h).as_deref(), Some("ak_live_abc123"));
    }

    #[test]
    fn api_key_wins_over_authorization() {
        let h = headers(&[
            ("x-api-key", "ak_live_abc123"),
            ("authorization", "Bearer token"),
        ]);
        assert_eq!(default_identify_consumer(&h).as_deref(), Some("ak_live_abc123"));
    }

    #[test]
    fn authorization_is_hashed() {
        let h = headers(&[("authorization", "Bearer secret-token")]);
        let id = default_identify_consumer(&h).unwrap();
        assert_eq!(id.len(), 17);
        assert!(id.starts_with("hash_"));
        assert!(id[5..].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn empty_api_key_falls_back_to_authorization() {
        let h = headers(&[("x-api-key", ""), ("authorization", "Bearer x")]);
        let id = default_identify_consumer(&h).unwrap();
        assert!(id.starts_with("hash_"));
    }

    #[test]
    fn no_headers_means_anonymous() {
        assert_eq!(default_identify_consumer(&HashMap::new()), None);
        let h = headers(&[("authorization", "")]);
        assert_eq!(default_identify_consumer(&h), None);
    }

    #[test]
    fn hashing_is_deterministic() {
        assert_eq!(hash_consumer_id("Bearer abc"), hash_consumer_id("Bearer abc"));
        assert_ne!(hash_consumer_id("Bearer abc"), hash_consumer_id("Bearer abd"));
    }
}
