//! rustls configurations from OrbKit TLS material.

use std::sync::Arc;

use orbkit::tls::TlsConfig;
use orbkit_errors::OrbError;
use rustls::RootCertStore;
use rustls::crypto::CryptoProvider;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};

/// ALPN for HTTP/2 and HTTP/1.1 over TLS, preferred first.
pub const ALPN_H2_HTTP1: &[&[u8]] = &[b"h2", b"http/1.1"];
/// ALPN for HTTP/3.
pub const ALPN_H3: &[&[u8]] = &[b"h3"];

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

fn bad(what: &str, err: impl std::fmt::Display) -> OrbError {
    OrbError::BAD_REQUEST.wrap(format!("{what}: {err}"))
}

fn certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, OrbError> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| bad("certificate pem", e))?;
    if certs.is_empty() {
        return Err(bad("certificate pem", "no certificates found"));
    }
    Ok(certs)
}

fn key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, OrbError> {
    PrivateKeyDer::from_pem_slice(pem).map_err(|e| bad("private key pem", e))
}

/// Server side, with the identity from `tls` and `alpn` advertised.
///
/// # Errors
/// Returns 400 when the identity is missing or unusable.
pub fn server_config(tls: &TlsConfig, alpn: &[&[u8]]) -> Result<rustls::ServerConfig, OrbError> {
    let (cert, private_key) = tls.identity()?;
    let mut config = rustls::ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| bad("tls versions", e))?
        .with_no_client_auth()
        .with_single_cert(certs(&cert)?, key(&private_key)?)
        .map_err(|e| bad("tls identity", e))?;
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(config)
}

/// Client side, trusting the CA from `tls` and presenting its identity when
/// one is configured.
///
/// # Errors
/// Returns 400 when the CA or the identity is unusable.
pub fn client_config(tls: &TlsConfig, alpn: &[&[u8]]) -> Result<rustls::ClientConfig, OrbError> {
    let mut roots = RootCertStore::empty();
    if let Some(ca) = tls.ca()? {
        for cert in certs(&ca)? {
            roots.add(cert).map_err(|e| bad("ca certificate", e))?;
        }
    }
    let builder = rustls::ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| bad("tls versions", e))?
        .with_root_certificates(roots);
    let mut config = match (tls.cert_chain()?, tls.private_key()?) {
        (Some(cert), Some(private_key)) => builder
            .with_client_auth_cert(certs(&cert)?, key(&private_key)?)
            .map_err(|e| bad("client identity", e))?,
        _ => builder.with_no_client_auth(),
    };
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(config)
}

/// The name a server certificate is verified against: the configured
/// override, else the host part of `address`.
///
/// # Errors
/// Returns 400 when the name is neither a DNS name nor an IP address.
pub fn server_name(tls: Option<&TlsConfig>, address: &str) -> Result<ServerName<'static>, OrbError> {
    let name = match tls.and_then(|t| t.server_name.clone()) {
        Some(name) => name,
        None => host(address).to_owned(),
    };
    ServerName::try_from(name).map_err(|e| bad("server name", e))
}

fn host(address: &str) -> &str {
    let host = match address.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => address,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}
