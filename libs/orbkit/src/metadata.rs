//! String-keyed call metadata.
//!
//! A [`Metadata`] value is a cheap, shared handle: clones observe the same
//! map, so a handler that writes to its outgoing metadata is visible to the
//! transport that later serializes it. Keys are stored lower-cased.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

/// Content type of the payload.
pub const CONTENT_TYPE: &str = "content-type";
/// Service name of the current call, set on incoming metadata by servers.
pub const SERVICE: &str = "service";
/// Method name of the current call, set on incoming metadata by servers.
pub const METHOD: &str = "method";
pub const AUTHORIZATION: &str = "authorization";

/// Header prefix HTTP transports use to carry metadata.
pub const HTTP_HEADER_PREFIX: &str = "__orb-";

/// Transport-level headers never copied into incoming metadata.
pub const RESERVED_HEADERS: &[&str] = &[
    "accept",
    "accept-encoding",
    "content-encoding",
    "content-length",
    "content-type",
    "connection",
    "host",
    "te",
    "transfer-encoding",
    "user-agent",
    "grpc-accept-encoding",
    "grpc-encoding",
    "grpc-timeout",
];

#[derive(Clone, Default)]
pub struct Metadata {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl Metadata {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_map(map: HashMap<String, String>) -> Self {
        let md = Self::new();
        md.extend(map);
        md
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.read().get(&key.to_ascii_lowercase()).cloned()
    }

    pub fn set(&self, key: impl AsRef<str>, value: impl Into<String>) {
        self.inner
            .write()
            .insert(key.as_ref().to_ascii_lowercase(), value.into());
    }

    pub fn remove(&self, key: &str) -> Option<String> {
        self.inner.write().remove(&key.to_ascii_lowercase())
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.inner.read().contains_key(&key.to_ascii_lowercase())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn extend<K, V>(&self, entries: impl IntoIterator<Item = (K, V)>)
    where
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut guard = self.inner.write();
        for (k, v) in entries {
            guard.insert(k.as_ref().to_ascii_lowercase(), v.into());
        }
    }

    /// A point-in-time copy of the entries.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.inner.read().clone()
    }

    /// A new, independent map with the same entries.
    #[must_use]
    pub fn deep_clone(&self) -> Self {
        Self::from_map(self.snapshot())
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }
}

impl fmt::Debug for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.inner.read().iter()).finish()
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let md = Self::new();
        md.extend(iter);
        md
    }
}

/// Whether `header` is a transport header that must not become metadata.
#[must_use]
pub fn is_reserved_header(header: &str) -> bool {
    let lower = header.to_ascii_lowercase();
    RESERVED_HEADERS.contains(&lower.as_str()) || lower.starts_with(':')
}

/// Splits `/pkg.Service/Method` into its service and method parts.
#[must_use]
pub fn split_endpoint(endpoint: &str) -> (&str, &str) {
    let trimmed = endpoint.trim_start_matches('/');
    trimmed.split_once('/').unwrap_or((trimmed, ""))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let md = Metadata::new();
        let other = md.clone();
        other.set("Tracing-ID", "abc");
        assert_eq!(md.get("tracing-id").as_deref(), Some("abc"));
    }

    #[test]
    fn test_deep_clone_is_independent() {
        let md: Metadata = [("a", "1")].into_iter().collect();
        let copy = md.deep_clone();
        copy.set("b", "2");
        assert!(!md.contains("b"));
        assert_eq!(copy.len(), 2);
    }

    #[test]
    fn test_split_endpoint() {
        assert_eq!(split_endpoint("/echo.Streams/Call"), ("echo.Streams", "Call"));
        assert_eq!(split_endpoint("bare"), ("bare", ""));
    }

    #[test]
    fn test_reserved_headers() {
        assert!(is_reserved_header("Content-Type"));
        assert!(is_reserved_header(":authority"));
        assert!(!is_reserved_header("authorization"));
    }
}
