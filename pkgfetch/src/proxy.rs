//! Outbound endpoint pool.
//!
//! The pool always contains the direct connection at index 0, followed by
//! any configured proxies. Rotation is round-robin and thread-safe; the
//! direct connection can never be removed, so the pool is never empty.
//!
//! When nothing is configured, [`ProxyPool::detect_local`] can look for a
//! proxy client listening on one of the usual loopback ports.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

use crate::error::{FetchError, FetchResult};

/// Schemes accepted in proxy descriptors.
const SUPPORTED_SCHEMES: &[&str] = &["http", "https", "socks5", "socks5h"];

/// Loopback endpoints of common local proxy clients, in the order they are tried.
pub const LOCAL_PROXY_CANDIDATES: &[&str] = &[
    "http://127.0.0.1:7890",
    "http://127.0.0.1:1082",
    "http://127.0.0.1:8080",
    "http://127.0.0.1:8888",
    "http://127.0.0.1:6152",
    "socks5://127.0.0.1:1080",
    "socks5://127.0.0.1:7891",
    "socks5://127.0.0.1:6153",
];

/// Connect timeout for each local proxy candidate.
pub const LOCAL_PROXY_TIMEOUT: Duration = Duration::from_millis(500);

/// An outbound endpoint: either a direct connection or a proxy URL.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ProxyDescriptor {
    Direct,
    Proxy(String),
}

impl ProxyDescriptor {
    /// Parse a descriptor.
    ///
    /// Empty input means direct. A bare `host:port` is treated as an HTTP
    /// proxy.
    pub fn parse(raw: &str) -> FetchResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("direct") {
            return Ok(Self::Direct);
        }

        let normalized = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("http://{}", trimmed)
        };

        let url = reqwest::Url::parse(&normalized)
            .map_err(|_| FetchError::InvalidProxy(raw.to_string()))?;
        if !SUPPORTED_SCHEMES.contains(&url.scheme()) || url.host_str().is_none() {
            return Err(FetchError::InvalidProxy(raw.to_string()));
        }

        Ok(Self::Proxy(normalized))
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, Self::Direct)
    }

    /// Host and port of the proxy, `None` for direct.
    pub fn host_port(&self) -> Option<(String, u16)> {
        match self {
            Self::Direct => None,
            Self::Proxy(url) => {
                let url = reqwest::Url::parse(url).ok()?;
                Some((url.host_str()?.to_string(), url.port_or_known_default()?))
            }
        }
    }

    /// Build the reqwest proxy for this endpoint, `None` for direct.
    pub fn to_reqwest_proxy(&self) -> FetchResult<Option<reqwest::Proxy>> {
        match self {
            Self::Direct => Ok(None),
            Self::Proxy(url) => reqwest::Proxy::all(url)
                .map(Some)
                .map_err(|_| FetchError::InvalidProxy(url.clone())),
        }
    }
}

impl fmt::Display for ProxyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Proxy(url) => write!(f, "{}", url),
        }
    }
}

struct PoolInner {
    entries: Vec<ProxyDescriptor>,
    cursor: usize,
}

/// Round-robin pool of outbound endpoints.
pub struct ProxyPool {
    inner: Mutex<PoolInner>,
}

impl ProxyPool {
    /// Create a pool from parsed descriptors.
    ///
    /// Direct is placed first; duplicate entries are dropped.
    pub fn new(proxies: impl IntoIterator<Item = ProxyDescriptor>) -> Self {
        let mut entries = vec![ProxyDescriptor::Direct];
        for proxy in proxies {
            if !entries.contains(&proxy) {
                entries.push(proxy);
            }
        }
        debug!(endpoints = entries.len(), "Proxy pool created");
        Self {
            inner: Mutex::new(PoolInner { entries, cursor: 0 }),
        }
    }

    /// Pool with only the direct connection.
    pub fn direct() -> Self {
        Self::new(Vec::new())
    }

    /// Parse a list of descriptors, one per line.
    ///
    /// Blank lines and `#` comments are skipped. Malformed entries are
    /// logged and skipped rather than failing the whole list.
    pub fn from_list<'a>(lines: impl IntoIterator<Item = &'a str>) -> Self {
        let mut proxies = Vec::new();
        for line in lines {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match ProxyDescriptor::parse(line) {
                Ok(descriptor) => proxies.push(descriptor),
                Err(e) => warn!(error = %e, "Skipping proxy entry"),
            }
        }
        Self::new(proxies)
    }

    /// Load a proxy list file.
    pub fn load(path: &Path) -> FetchResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| FetchError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let pool = Self::from_list(text.lines());
        info!(
            path = %path.display(),
            proxies = pool.len() - 1,
            "Loaded proxy list"
        );
        Ok(pool)
    }

    /// Look for a local proxy client on the well-known loopback ports.
    pub async fn detect_local(timeout: Duration) -> Option<ProxyDescriptor> {
        Self::detect_local_from(LOCAL_PROXY_CANDIDATES, timeout).await
    }

    /// Return the first candidate accepting a TCP connection within `timeout`.
    ///
    /// Candidates are tried in order; malformed entries are skipped.
    pub async fn detect_local_from(candidates: &[&str], timeout: Duration) -> Option<ProxyDescriptor> {
        for candidate in candidates {
            let Ok(descriptor) = ProxyDescriptor::parse(candidate) else {
                warn!(candidate, "Skipping malformed local proxy candidate");
                continue;
            };
            let Some((host, port)) = descriptor.host_port() else {
                continue;
            };
            match tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), port))).await {
                Ok(Ok(_)) => {
                    info!(proxy = %descriptor, "Detected local proxy");
                    return Some(descriptor);
                }
                Ok(Err(e)) => trace!(proxy = %descriptor, error = %e, "Local proxy candidate refused"),
                Err(_) => trace!(proxy = %descriptor, "Local proxy candidate timed out"),
            }
        }
        debug!("No local proxy detected");
        None
    }

    /// The endpoint used for the first attempt (always direct).
    pub fn first(&self) -> ProxyDescriptor {
        self.inner.lock().entries[0].clone()
    }

    /// Next endpoint in round-robin order.
    pub fn next(&self) -> ProxyDescriptor {
        let mut inner = self.inner.lock();
        inner.cursor = (inner.cursor + 1) % inner.entries.len();
        inner.entries[inner.cursor].clone()
    }

    /// Remove a proxy from rotation. Direct is never removed.
    ///
    /// Returns `true` if the entry was present and removed.
    pub fn remove(&self, descriptor: &ProxyDescriptor) -> bool {
        if descriptor.is_direct() {
            return false;
        }
        let mut inner = self.inner.lock();
        let Some(index) = inner.entries.iter().position(|e| e == descriptor) else {
            return false;
        };
        inner.entries.remove(index);
        if inner.cursor >= index && inner.cursor > 0 {
            inner.cursor -= 1;
        }
        info!(proxy = %descriptor, "Removed unreachable proxy from pool");
        true
    }

    /// Number of endpoints, including direct.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Always false; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Whether any proxy besides direct is configured.
    pub fn has_proxies(&self) -> bool {
        self.len() > 1
    }

    /// Snapshot of the current entries.
    pub fn entries(&self) -> Vec<ProxyDescriptor> {
        self.inner.lock().entries.clone()
    }
}

impl Default for ProxyPool {
    fn default() -> Self {
        Self::direct()
    }
}

impl fmt::Debug for ProxyPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ProxyPool")
            .field("entries", &inner.entries)
            .field("cursor", &inner.cursor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_bare_host_port() {
        let descriptor = ProxyDescriptor::parse("10.0.0.1:8080").unwrap();
        assert_eq!(
            descriptor,
            ProxyDescriptor::Proxy("http://10.0.0.1:8080".to_string())
        );
    }

    #[test]
    fn test_parse_socks_and_empty() {
        assert_eq!(
            ProxyDescriptor::parse("socks5://user:pw@proxy:1080").unwrap(),
            ProxyDescriptor::Proxy("socks5://user:pw@proxy:1080".to_string())
        );
        assert_eq!(ProxyDescriptor::parse("  ").unwrap(), ProxyDescriptor::Direct);
    }

    #[test]
    fn test_parse_rejects_unknown_scheme() {
        assert!(matches!(
            ProxyDescriptor::parse("ftp://proxy:21"),
            Err(FetchError::InvalidProxy(_))
        ));
    }

    #[test]
    fn test_direct_is_first() {
        let pool = ProxyPool::from_list(["# office", "", "10.0.0.1:8080", "10.0.0.2:8080"]);
        assert_eq!(pool.len(), 3);
        assert!(pool.first().is_direct());
        assert!(pool.has_proxies());
    }

    #[test]
    fn test_round_robin_wraps() {
        let pool = ProxyPool::from_list(["10.0.0.1:8080", "10.0.0.2:8080"]);
        assert_eq!(pool.next().to_string(), "http://10.0.0.1:8080");
        assert_eq!(pool.next().to_string(), "http://10.0.0.2:8080");
        assert!(pool.next().is_direct());
    }

    #[test]
    fn test_remove_never_drops_direct() {
        let pool = ProxyPool::from_list(["10.0.0.1:8080"]);
        assert!(!pool.remove(&ProxyDescriptor::Direct));
        let proxy = ProxyDescriptor::parse("10.0.0.1:8080").unwrap();
        assert!(pool.remove(&proxy));
        assert!(!pool.remove(&proxy));
        assert_eq!(pool.len(), 1);
        assert!(pool.next().is_direct());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxies.txt");
        std::fs::write(&path, "10.0.0.1:8080\nnot a proxy at all\nsocks5h://p:1080\n").unwrap();

        let pool = ProxyPool::load(&path).unwrap();
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn test_host_port() {
        let descriptor = ProxyDescriptor::parse("socks5://127.0.0.1:7891").unwrap();
        assert_eq!(descriptor.host_port(), Some(("127.0.0.1".to_string(), 7891)));
        assert_eq!(ProxyDescriptor::Direct.host_port(), None);
    }

    #[tokio::test]
    async fn test_detect_local_returns_first_listening_candidate() {
        let closed = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let open = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open_port = open.local_addr().unwrap().port();

        let candidates = [
            format!("http://127.0.0.1:{}", closed),
            "not a proxy".to_string(),
            format!("socks5://127.0.0.1:{}", open_port),
        ];
        let candidates: Vec<&str> = candidates.iter().map(String::as_str).collect();

        let found = ProxyPool::detect_local_from(&candidates, LOCAL_PROXY_TIMEOUT).await;
        assert_eq!(
            found,
            Some(ProxyDescriptor::Proxy(format!("socks5://127.0.0.1:{}", open_port)))
        );
    }

    #[tokio::test]
    async fn test_detect_local_none_listening() {
        let closed = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let candidate = format!("http://127.0.0.1:{}", closed);

        let found = ProxyPool::detect_local_from(&[candidate.as_str()], LOCAL_PROXY_TIMEOUT).await;
        assert_eq!(found, None);
    }

    proptest! {
        #[test]
        fn prop_rotation_visits_every_endpoint(count in 0usize..8) {
            let lines: Vec<String> = (0..count).map(|i| format!("10.0.0.{}:8080", i + 1)).collect();
            let pool = ProxyPool::from_list(lines.iter().map(String::as_str));
            let mut seen = std::collections::HashSet::new();
            for _ in 0..pool.len() {
                seen.insert(pool.next());
            }
            prop_assert_eq!(seen.len(), count + 1);
        }
    }
}
