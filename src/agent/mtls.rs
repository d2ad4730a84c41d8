//! mTLS configuration for the agent listeners
//!
//! TLS material is sourced from paths named by environment variables under
//! a configurable prefix, captured once at startup:
//!
//! - `<PREFIX>_PROTOCOL` - `ssl` enables the mTLS listener
//! - `<PREFIX>_TLS_CRT` - path to the server certificate (PEM)
//! - `<PREFIX>_TLS_KEY` - path to the server private key (PEM)
//! - `<PREFIX>_TLS_CA` - path to the CA bundle used to verify agent
//!   client certificates (PEM)

use std::env;
use std::fs;
use std::path::Path;

use tonic::transport::{Certificate, Identity, ServerTlsConfig};

use crate::{Error, Result};

/// Default environment prefix for TLS material.
pub const DEFAULT_ENV_PREFIX: &str = "CORRAL_AGENT";

/// Which transport security the agent listeners use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityProtocol {
    /// No TLS listener.
    Plaintext,
    /// Mutually-authenticated TLS listener enabled.
    Ssl,
}

impl SecurityProtocol {
    /// Read `<PREFIX>_PROTOCOL` from the environment; anything other than
    /// `ssl` means plaintext.
    pub fn from_env(prefix: &str) -> Self {
        match env::var(format!("{prefix}_PROTOCOL")) {
            Ok(value) if value.eq_ignore_ascii_case("ssl") => SecurityProtocol::Ssl,
            _ => SecurityProtocol::Plaintext,
        }
    }
}

/// Server-side mTLS material.
///
/// The server presents its certificate to agents and verifies agent client
/// certificates against the CA bundle.
#[derive(Debug, Clone)]
pub struct ServerMtlsConfig {
    /// PEM-encoded server certificate.
    pub cert_pem: String,
    /// PEM-encoded server private key.
    pub key_pem: String,
    /// PEM-encoded CA bundle for verifying agent certificates.
    pub client_ca_pem: String,
}

impl ServerMtlsConfig {
    /// Build from in-memory PEM strings.
    pub fn from_pem(
        cert_pem: impl Into<String>,
        key_pem: impl Into<String>,
        client_ca_pem: impl Into<String>,
    ) -> Self {
        Self {
            cert_pem: cert_pem.into(),
            key_pem: key_pem.into(),
            client_ca_pem: client_ca_pem.into(),
        }
    }

    /// Load the three PEM files from disk.
    pub fn from_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
        ca_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let read = |path: &Path| {
            fs::read_to_string(path)
                .map_err(|e| Error::config(format!("reading {}: {e}", path.display())))
        };
        Ok(Self {
            cert_pem: read(cert_path.as_ref())?,
            key_pem: read(key_path.as_ref())?,
            client_ca_pem: read(ca_path.as_ref())?,
        })
    }

    /// Resolve the certificate paths from `<PREFIX>_TLS_CRT` /
    /// `<PREFIX>_TLS_KEY` / `<PREFIX>_TLS_CA` and load them.
    pub fn from_env(prefix: &str) -> Result<Self> {
        let var = |suffix: &str| {
            let name = format!("{prefix}_{suffix}");
            env::var(&name).map_err(|_| Error::config(format!("{name} is not set")))
        };
        Self::from_files(var("TLS_CRT")?, var("TLS_KEY")?, var("TLS_CA")?)
    }

    /// Convert to a tonic server TLS configuration requiring client
    /// certificates.
    pub fn to_tonic_config(&self) -> ServerTlsConfig {
        ServerTlsConfig::new()
            .identity(Identity::from_pem(&self.cert_pem, &self.key_pem))
            .client_ca_root(Certificate::from_pem(&self.client_ca_pem))
    }
}
