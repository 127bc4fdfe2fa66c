//! Client identity and state-store key layout.

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

/// `(ip, sha256(user agent))`. Derived per request, never stored on its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThrottleIdentity {
    pub ip: String,
    pub ua_hash: String,
}

impl ThrottleIdentity {
    pub fn new(ip: &str, user_agent: &str) -> Self {
        Self {
            ip: sanitize_component(ip),
            ua_hash: hash_user_agent(user_agent),
        }
    }
}

pub fn hash_user_agent(user_agent: &str) -> String {
    hex::encode(Sha256::digest(user_agent.as_bytes()))
}

/// Replace anything outside the IP/host alphabet so client-supplied values
/// can never smuggle a wildcard into a store key.
pub fn sanitize_component(value: &str) -> String {
    value
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Builds every key the throttle engine reads or writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    namespace: String,
}

impl KeySpace {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// `<namespace>:<ip>:<uaHash>`
    pub fn record_key(&self, identity: &ThrottleIdentity) -> String {
        format!("{}:{}:{}", self.namespace, identity.ip, identity.ua_hash)
    }

    /// Every identity record for one IP.
    pub fn records_pattern(&self, ip: &str) -> String {
        format!("{}:{}:*", self.namespace, sanitize_component(ip))
    }

    /// True only for `<namespace>:<ip>:<64 hex chars>`, so a prefix scan for one
    /// IP never picks up a longer IPv6 address or the `ua`/`ban` key families.
    pub fn is_record_key_for(&self, key: &str, ip: &str) -> bool {
        let prefix = format!("{}:{}:", self.namespace, sanitize_component(ip));
        key.strip_prefix(prefix.as_str())
            .is_some_and(|hash| hash.len() == 64 && hash.bytes().all(|b| b.is_ascii_hexdigit()))
    }

    pub fn ip_key(&self, ip: &str) -> String {
        format!("{}:ua:{}", self.namespace, sanitize_component(ip))
    }

    pub fn ban_key(&self, ip: &str) -> String {
        format!("{}:ban:{}", self.namespace, sanitize_component(ip))
    }
}

/// Client IP as reported by proxy headers, first hop wins.
pub fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next().map(str::trim) {
            if !first.is_empty() {
                return Some(first.to_string());
            }
        }
    }

    ["x-real-ip", "cf-connecting-ip"]
        .iter()
        .filter_map(|name| headers.get(*name).and_then(|v| v.to_str().ok()))
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_ua_hash_is_sha256_hex() {
        let hash = hash_user_agent("curl/8.5.0");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_user_agent("curl/8.5.0"));
        assert_ne!(hash, hash_user_agent("curl/8.6.0"));
    }

    #[test]
    fn test_record_key_layout() {
        let keys = KeySpace::new("throttle");
        let id = ThrottleIdentity::new("192.168.1.1", "ua");
        assert_eq!(
            keys.record_key(&id),
            format!("throttle:192.168.1.1:{}", hash_user_agent("ua"))
        );
        assert_eq!(keys.records_pattern("192.168.1.1"), "throttle:192.168.1.1:*");
        assert_eq!(keys.ip_key("192.168.1.1"), "throttle:ua:192.168.1.1");
        assert_eq!(keys.ban_key("192.168.1.1"), "throttle:ban:192.168.1.1");
    }

    #[test]
    fn test_record_key_match_is_exact_for_one_ip() {
        let keys = KeySpace::new("throttle");
        let own = keys.record_key(&ThrottleIdentity::new("2001:db8::1", "ua"));
        let neighbour = keys.record_key(&ThrottleIdentity::new("2001:db8::1:5", "ua"));

        assert!(keys.is_record_key_for(&own, "2001:db8::1"));
        assert!(!keys.is_record_key_for(&neighbour, "2001:db8::1"));
        assert!(keys.is_record_key_for(&neighbour, "2001:db8::1:5"));
        assert!(!keys.is_record_key_for(&keys.ip_key("10.0.0.1"), "ua"));
        assert!(!keys.is_record_key_for(&keys.ban_key("10.0.0.1"), "ban"));
    }

    #[test]
    fn test_sanitize_strips_wildcards() {
        assert_eq!(sanitize_component("10.0.0.*"), "10.0.0._");
        assert_eq!(sanitize_component(" ::1 "), "::1");
        assert_eq!(sanitize_component("a b$c"), "a_b_c");
    }

    #[test]
    fn test_extract_client_ip_with_forwarded_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("192.168.1.1, 10.0.0.1"),
        );
        assert_eq!(extract_client_ip(&headers).as_deref(), Some("192.168.1.1"));
    }

    #[test]
    fn test_extract_client_ip_with_real_ip_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("203.0.113.1"));
        assert_eq!(extract_client_ip(&headers).as_deref(), Some("203.0.113.1"));
    }

    #[test]
    fn test_extract_client_ip_missing() {
        assert_eq!(extract_client_ip(&HeaderMap::new()), None);
    }
}
