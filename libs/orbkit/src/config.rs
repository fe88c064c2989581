//! Layered runtime configuration.
//!
//! Sources merge in order, later wins: built-in defaults, an optional YAML
//! file, then environment variables. `ORB_CLIENT__RETRIES=2` sets
//! `client.retries`.

use std::path::Path;
use std::sync::Arc;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use orbkit_errors::OrbError;
use serde::{Deserialize, Serialize};

use crate::client::ClientConfig;
use crate::registry::{
    CachedRegistry, KvRegistry, KvRegistryConfig, MemoryRegistry, MemoryRegistryConfig, Registry,
};
use crate::server::ServerConfig;
use crate::telemetry::LoggingConfig;

pub const DEFAULT_ENV_PREFIX: &str = "ORB_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file {0} does not exist")]
    MissingFile(String),
    #[error(transparent)]
    Parse(#[from] Box<figment::Error>),
    #[error("unknown registry plugin {0:?}")]
    UnknownRegistry(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Parse(Box::new(err))
    }
}

impl From<ConfigError> for OrbError {
    fn from(err: ConfigError) -> Self {
        OrbError::BAD_REQUEST.wrap(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryPlugin {
    #[default]
    Memory,
    #[serde(alias = "kv")]
    Kvstore,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    pub plugin: RegistryPlugin,
    pub memory: MemoryRegistryConfig,
    pub kvstore: KvRegistryConfig,
    /// Serve lookups from a watch-driven cache in front of the backend.
    pub cache: bool,
}

impl RegistryConfig {
    #[must_use]
    pub fn with_plugin(mut self, plugin: RegistryPlugin) -> Self {
        self.plugin = plugin;
        self
    }

    #[must_use]
    pub fn with_cache(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }

    /// Builds the configured backend. A `kvstore` registry uses the
    /// in-process key-value store.
    ///
    /// # Errors
    /// Fails when the cache cannot load the backend's records.
    pub async fn build(&self) -> Result<Arc<dyn Registry>, OrbError> {
        let backend: Arc<dyn Registry> = match self.plugin {
            RegistryPlugin::Memory => Arc::new(MemoryRegistry::new(&self.memory)),
            RegistryPlugin::Kvstore => Arc::new(KvRegistry::in_memory(self.kvstore.clone())),
        };
        tracing::debug!(plugin = backend.name(), cache = self.cache, "registry ready");
        if !self.cache {
            return Ok(backend);
        }
        let cached = CachedRegistry::new(backend);
        cached.start().await?;
        Ok(Arc::new(cached))
    }
}

/// Everything a process built on this crate reads at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrbConfig {
    pub logging: LoggingConfig,
    pub client: ClientConfig,
    pub server: ServerConfig,
    pub registry: RegistryConfig,
}

impl OrbConfig {
    /// The provider stack behind [`OrbConfig::load`], for callers that
    /// want to merge their own sources on top.
    ///
    /// # Errors
    /// Fails when `path` is given but does not exist.
    pub fn figment(path: Option<&Path>, env_prefix: &str) -> Result<Figment, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            if !path.is_file() {
                return Err(ConfigError::MissingFile(path.display().to_string()));
            }
            figment = figment.merge(Yaml::file(path));
        }
        Ok(figment.merge(Env::prefixed(env_prefix).split("__")))
    }

    /// Loads defaults, then `path`, then `<env_prefix>*` variables.
    ///
    /// # Errors
    /// Fails on a missing file, malformed YAML, unknown keys or values of
    /// the wrong type.
    pub fn load(path: Option<&Path>, env_prefix: &str) -> Result<Self, ConfigError> {
        let config = Self::from_figment(&Self::figment(path, env_prefix)?)?;
        tracing::debug!(
            file = path.map(|p| p.display().to_string()),
            entrypoints = config.server.entrypoints.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// # Errors
    /// Fails when the merged sources do not describe an [`OrbConfig`].
    pub fn from_figment(figment: &Figment) -> Result<Self, ConfigError> {
        Ok(figment.extract()?)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::io::Write as _;
    use std::time::Duration;

    use super::*;
    use crate::telemetry::LogFormat;

    const PREFIX: &str = "ORBKIT_CONFIG_TEST_UNSET_";

    fn yaml(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_without_file() {
        let cfg = OrbConfig::load(None, PREFIX).unwrap();
        assert_eq!(cfg.client.retries, 5);
        assert_eq!(cfg.registry.plugin, RegistryPlugin::Memory);
        assert!(cfg.server.entrypoints.is_empty());
    }

    #[test]
    fn test_yaml_overrides_defaults() {
        let file = yaml(
            r"
logging:
  level: debug
  format: json
client:
  retries: 1
  request_timeout: 250ms
  preferred_transports: [grpc, http]
server:
  entrypoints:
    - name: grpc-main
      plugin: grpc
      address: 127.0.0.1:0
      handler_timeout: 2s
registry:
  plugin: kvstore
  kvstore:
    delimiter: '#'
",
        );
        let cfg = OrbConfig::load(Some(file.path()), PREFIX).unwrap();
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert_eq!(cfg.client.retries, 1);
        assert_eq!(cfg.client.request_timeout, Duration::from_millis(250));
        assert_eq!(cfg.client.preferred_transports, vec!["grpc", "http"]);
        let ep = &cfg.server.entrypoints[0];
        assert_eq!(ep.plugin, "grpc");
        assert_eq!(ep.handler_timeout, Duration::from_secs(2));
        assert_eq!(cfg.registry.plugin, RegistryPlugin::Kvstore);
        assert_eq!(cfg.registry.kvstore.delimiter, "#");
    }

    #[test]
    fn test_later_sources_win() {
        let file = yaml("client:\n  retries: 1\n");
        let figment = OrbConfig::figment(Some(file.path()), PREFIX)
            .unwrap()
            .merge(Serialized::default("client.retries", 7));
        assert_eq!(OrbConfig::from_figment(&figment).unwrap().client.retries, 7);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let file = yaml("client:\n  retrys: 1\n");
        let err = OrbConfig::load(Some(file.path()), PREFIX).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert_eq!(OrbError::from(err).code(), 400);
    }

    #[test]
    fn test_missing_file() {
        let err = OrbConfig::load(Some(Path::new("/nonexistent/orb.yaml")), PREFIX).unwrap_err();
        assert!(matches!(err, ConfigError::MissingFile(_)));
    }

    #[tokio::test]
    async fn test_build_cached_kv_registry() {
        let cfg = RegistryConfig::default()
            .with_plugin(RegistryPlugin::Kvstore)
            .with_cache(true);
        let registry = cfg.build().await.unwrap();
        assert_eq!(registry.name(), "kvstore");
        assert_eq!(registry.get_service("nobody").await.unwrap_err().code(), 404);
    }
}
