//! TLS material for the HTTP listener and for outbound connections (NATS,
//! the primary resolver bootstrap fetch) that need a custom CA bundle.

use std::path::Path;
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use rustls::pki_types::CertificateDer;

static DEFAULT_ROOTS: OnceLock<Arc<rustls::RootCertStore>> = OnceLock::new();

fn default_roots() -> Arc<rustls::RootCertStore> {
    DEFAULT_ROOTS
        .get_or_init(|| {
            let mut store = rustls::RootCertStore::empty();
            match rustls_native_certs::load_native_certs() {
                Ok(certs) => {
                    let (added, ignored) = store.add_parsable_certificates(certs);
                    tracing::debug!(added, ignored, "loaded native root certificate store");
                }
                Err(err) => tracing::warn!(%err, "failed to load native root certificate store"),
            }
            Arc::new(store)
        })
        .clone()
}

/// Reads certificates from a PEM file. A missing directory entry returns an
/// empty list rather than an error; callers treat "no CA configured" as "use
/// the default root store".
pub fn read_certs_from_path(path: impl AsRef<Path>) -> Result<Vec<CertificateDer<'static>>> {
    let path = path.as_ref();
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let mut reader = std::io::BufReader::new(
        std::fs::File::open(path)
            .with_context(|| format!("failed to open certificate file {}", path.display()))?,
    );
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("failed to parse certificates in {}", path.display()))
}

/// Builds a client config rooted at the platform's native certificate store,
/// optionally extended with a custom CA bundle for self-signed deployments.
pub fn client_config(extra_ca: Option<&str>) -> Result<rustls::ClientConfig> {
    let mut roots = (*default_roots()).clone();
    if let Some(ca_path) = extra_ca {
        let extra = read_certs_from_path(ca_path)?;
        let (added, ignored) = roots.add_parsable_certificates(extra);
        tracing::debug!(added, ignored, "loaded extra CA bundle");
    }
    Ok(rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}
