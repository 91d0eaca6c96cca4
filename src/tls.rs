use anyhow::Context;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

/// TLS material for a [`Link`](crate::link::Link). Sides left as `None` run
/// plain TCP: `server` covers accepted connections, `client` covers
/// connectors (which use the connector's host string for SNI and
/// certificate validation).
#[derive(Clone, Default)]
pub struct TlsOptions {
    pub client: Option<Arc<ClientConfig>>,
    pub server: Option<Arc<ServerConfig>>,
}

impl TlsOptions {
    pub fn client_only(config: Arc<ClientConfig>) -> TlsOptions {
        TlsOptions {
            client: Some(config),
            server: None,
        }
    }

    pub fn server_only(config: Arc<ServerConfig>) -> TlsOptions {
        TlsOptions {
            client: None,
            server: Some(config),
        }
    }
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("opening certificate file {:?}", path))?,
    );
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parsing certificates from {:?}", path))?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {:?}", path);
    }
    Ok(certs)
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("opening key file {:?}", path))?,
    );
    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("parsing private key from {:?}", path))?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {:?}", path))
}

/// Server-side config from a PEM certificate chain and private key.
pub fn server_config(cert_pem: &Path, key_pem: &Path) -> anyhow::Result<Arc<ServerConfig>> {
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(load_certs(cert_pem)?, load_key(key_pem)?)?;
    Ok(Arc::new(config))
}

/// Client-side config trusting exactly the CA certificates in `ca_pem`.
pub fn client_config(ca_pem: &Path) -> anyhow::Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_pem)? {
        roots.add(cert)?;
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}
