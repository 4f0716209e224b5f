//! Shared HTTP transport with local CA trust.
//!
//! The proxy serves TLS with a locally issued certificate authority. The
//! transport built here trusts that CA in addition to the system store; a
//! missing or unparsable CA file falls back to system trust only.
//! Certificate verification is never disabled.

use std::path::PathBuf;

use reqwest::{Certificate, Client};
use tracing::{debug, warn};

/// Environment variable overriding the certificate directory.
pub const CERTS_DIR_ENV: &str = "MCPPROXY_CERTS_DIR";

/// Builds the HTTP client shared by the stream supervisor and API calls.
///
/// The returned client is cheap to clone and safe for concurrent use; one
/// instance should back every component of a single SDK client.
pub fn build_http_client() -> reqwest::Result<Client> {
    let mut builder = Client::builder();

    if let Some(ca) = load_local_ca() {
        builder = builder.add_root_certificate(ca);
    }

    builder.build()
}

/// Loads the locally issued CA certificate, if present and parsable.
fn load_local_ca() -> Option<Certificate> {
    let path = local_ca_path()?;

    let pem = match std::fs::read(&path) {
        Ok(pem) => pem,
        Err(error) => {
            debug!(
                event = "local_ca_unavailable",
                path = %path.display(),
                error = %error,
            );
            return None;
        }
    };

    match Certificate::from_pem(&pem) {
        Ok(ca) => {
            debug!(event = "local_ca_loaded", path = %path.display());
            Some(ca)
        }
        Err(error) => {
            warn!(
                event = "local_ca_unparsable",
                path = %path.display(),
                error = %error,
            );
            None
        }
    }
}

/// Resolves the CA certificate location.
///
/// `$MCPPROXY_CERTS_DIR/ca.pem` when the override is set, otherwise
/// `~/.mcpproxy/certs/ca.pem`.
fn local_ca_path() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var(CERTS_DIR_ENV) {
        if !dir.is_empty() {
            return Some(PathBuf::from(dir).join("ca.pem"));
        }
    }

    dirs::home_dir().map(|home| home.join(".mcpproxy").join("certs").join("ca.pem"))
}
