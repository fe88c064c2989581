use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use super::retry::{self, BackoffFn, RetryFn};
use crate::codec::MIME_PROTO;
use crate::metadata::Metadata;
use crate::pool::PoolConfig;
use crate::selector::{self, RoundRobin, Selector};
use crate::tls::TlsConfig;

/// Transport preference used when the configuration names none.
pub const DEFAULT_PREFERRED_TRANSPORTS: &[&str] = &[
    "memory", "grpc", "drpc", "h2c", "http", "grpcs", "https", "http3",
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MiddlewareConfig {
    pub name: String,
}

/// Client defaults, the base every call's [`CallOptions`] start from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    pub content_type: String,
    pub preferred_transports: Vec<String>,
    pub any_transport: bool,
    /// `round_robin` or `random`.
    pub selector: String,
    pub retries: u32,
    /// `on_timeout_error`, `on_connection_error`, `on_any_error` or `never`.
    pub retry: String,
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,
    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,
    #[serde(with = "humantime_serde")]
    pub dial_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub connection_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub stream_timeout: Duration,
    pub pool: PoolConfig,
    pub tls: Option<TlsConfig>,
    pub middlewares: Vec<MiddlewareConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            content_type: MIME_PROTO.to_owned(),
            preferred_transports: DEFAULT_PREFERRED_TRANSPORTS
                .iter()
                .map(|&t| t.to_owned())
                .collect(),
            any_transport: false,
            selector: "round_robin".to_owned(),
            retries: 5,
            retry: "on_timeout_error".to_owned(),
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(5),
            connection_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            stream_timeout: Duration::ZERO,
            pool: PoolConfig::default(),
            tls: None,
            middlewares: Vec::new(),
        }
    }
}

impl ClientConfig {
    #[must_use]
    pub fn with_preferred_transports<I, S>(mut self, transports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.preferred_transports = transports.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    #[must_use]
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    #[must_use]
    pub fn with_middleware(mut self, name: impl Into<String>) -> Self {
        self.middlewares.push(MiddlewareConfig { name: name.into() });
        self
    }
}

/// Per-call configuration. Start from [`crate::client::Client::options`]
/// and override with the `with_*` builders.
#[derive(Clone)]
pub struct CallOptions {
    pub content_type: String,
    pub preferred_transports: Vec<String>,
    pub any_transport: bool,
    pub selector: Arc<dyn Selector>,
    pub retries: u32,
    pub retry: RetryFn,
    pub backoff: BackoffFn,
    pub dial_timeout: Duration,
    pub connection_timeout: Duration,
    pub request_timeout: Duration,
    pub stream_timeout: Duration,
    pub pool: PoolConfig,
    pub tls: Option<TlsConfig>,
    /// Outgoing metadata for this call, merged over the context's.
    pub metadata: HashMap<String, String>,
    /// Receives the server's outgoing metadata.
    pub response_metadata: Option<Metadata>,
    /// Bypasses the registry: the scheme names the transport, the authority
    /// is the address.
    pub url: Option<Url>,
}

impl CallOptions {
    #[must_use]
    pub fn from_config(cfg: &ClientConfig) -> Self {
        let selector = selector::by_name(&cfg.selector).unwrap_or_else(|| {
            tracing::warn!(selector = %cfg.selector, "unknown selector, using round robin");
            Arc::new(RoundRobin::new())
        });
        let retry = retry::retry_by_name(&cfg.retry).unwrap_or_else(|| {
            tracing::warn!(retry = %cfg.retry, "unknown retry policy, using on_timeout_error");
            retry::on_timeout_error()
        });
        Self {
            content_type: cfg.content_type.clone(),
            preferred_transports: cfg.preferred_transports.clone(),
            any_transport: cfg.any_transport,
            selector,
            retries: cfg.retries,
            retry,
            backoff: retry::exponential(cfg.backoff_base, cfg.backoff_max),
            dial_timeout: cfg.dial_timeout,
            connection_timeout: cfg.connection_timeout,
            request_timeout: cfg.request_timeout,
            stream_timeout: cfg.stream_timeout,
            pool: cfg.pool.clone(),
            tls: cfg.tls.clone(),
            metadata: HashMap::new(),
            response_metadata: None,
            url: None,
        }
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    #[must_use]
    pub fn with_preferred_transports<I, S>(mut self, transports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.preferred_transports = transports.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_any_transport(mut self, any: bool) -> Self {
        self.any_transport = any;
        self
    }

    #[must_use]
    pub fn with_selector(mut self, selector: Arc<dyn Selector>) -> Self {
        self.selector = selector;
        self
    }

    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryFn) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffFn) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool.size = size;
        self
    }

    #[must_use]
    pub fn with_pool_ttl(mut self, ttl: Duration) -> Self {
        self.pool.ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_pool_hosts(mut self, hosts: usize) -> Self {
        self.pool.hosts = hosts;
        self
    }

    #[must_use]
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_response_metadata(mut self, md: Metadata) -> Self {
        self.response_metadata = Some(md);
        self
    }

    #[must_use]
    pub fn with_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }
}

impl Default for CallOptions {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

impl fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallOptions")
            .field("content_type", &self.content_type)
            .field("preferred_transports", &self.preferred_transports)
            .field("any_transport", &self.any_transport)
            .field("selector", &self.selector.name())
            .field("retries", &self.retries)
            .field("dial_timeout", &self.dial_timeout)
            .field("connection_timeout", &self.connection_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("stream_timeout", &self.stream_timeout)
            .field("pool", &self.pool)
            .field("tls", &self.tls.is_some())
            .field("metadata", &self.metadata)
            .field("url", &self.url.as_ref().map(Url::as_str))
            .finish_non_exhaustive()
    }
}
