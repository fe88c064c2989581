//! TLS material shared by the secure transports.
//!
//! Only PEM bytes are handled here; each transport turns them into its own
//! TLS configuration.

use std::path::{Path, PathBuf};

use orbkit_errors::OrbError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TlsConfig {
    /// Certificate chain, as a file.
    pub cert_file: Option<PathBuf>,
    /// Private key, as a file.
    pub key_file: Option<PathBuf>,
    /// Trust anchors for verifying the peer, as a file.
    pub ca_file: Option<PathBuf>,
    /// Certificate chain, inline PEM. Wins over `cert_file`.
    pub cert_pem: Option<String>,
    /// Private key, inline PEM. Wins over `key_file`.
    pub key_pem: Option<String>,
    /// Trust anchors, inline PEM. Wins over `ca_file`.
    pub ca_pem: Option<String>,
    /// Name to verify the server certificate against, instead of the host.
    pub server_name: Option<String>,
}

impl TlsConfig {
    /// Server identity from inline PEM.
    #[must_use]
    pub fn with_identity(mut self, cert_pem: impl Into<String>, key_pem: impl Into<String>) -> Self {
        self.cert_pem = Some(cert_pem.into());
        self.key_pem = Some(key_pem.into());
        self
    }

    #[must_use]
    pub fn with_ca(mut self, ca_pem: impl Into<String>) -> Self {
        self.ca_pem = Some(ca_pem.into());
        self
    }

    #[must_use]
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// # Errors
    /// Returns 500 when the configured file cannot be read.
    pub fn cert_chain(&self) -> Result<Option<Vec<u8>>, OrbError> {
        load(self.cert_pem.as_deref(), self.cert_file.as_deref())
    }

    /// # Errors
    /// Returns 500 when the configured file cannot be read.
    pub fn private_key(&self) -> Result<Option<Vec<u8>>, OrbError> {
        load(self.key_pem.as_deref(), self.key_file.as_deref())
    }

    /// # Errors
    /// Returns 500 when the configured file cannot be read.
    pub fn ca(&self) -> Result<Option<Vec<u8>>, OrbError> {
        load(self.ca_pem.as_deref(), self.ca_file.as_deref())
    }

    /// Certificate chain and key, both required for serving.
    ///
    /// # Errors
    /// Returns 400 when either half is missing, 500 when unreadable.
    pub fn identity(&self) -> Result<(Vec<u8>, Vec<u8>), OrbError> {
        match (self.cert_chain()?, self.private_key()?) {
            (Some(cert), Some(key)) => Ok((cert, key)),
            _ => Err(OrbError::BAD_REQUEST.wrap("tls requires both a certificate and a key")),
        }
    }
}

fn load(inline: Option<&str>, file: Option<&Path>) -> Result<Option<Vec<u8>>, OrbError> {
    if let Some(pem) = inline {
        return Ok(Some(pem.as_bytes().to_vec()));
    }
    let Some(path) = file else {
        return Ok(None);
    };
    std::fs::read(path).map(Some).map_err(|e| {
        OrbError::INTERNAL_SERVER_ERROR.wrap(format!("reading {}: {e}", path.display()))
    })
}
