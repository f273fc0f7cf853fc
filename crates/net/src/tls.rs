//! TLS context construction
//!
//! Both roles authenticate each other: the server presents its
//! certificate chain and verifies client certificates against the CA,
//! and clients do the reverse. Certificate chain and private key are
//! read from the same PEM bundle (the configured certfile).

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pemfile::{certs, read_one, Item};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::TlsPaths;
use crate::error::{Error, Result};

/// Load a certificate chain from a PEM file.
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| Error::Tls(format!("opening cert {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::Tls(format!("invalid certs in {}: {}", path.display(), e)))?;

    if certs.is_empty() {
        return Err(Error::Tls(format!(
            "{} did not contain any certificates",
            path.display()
        )));
    }

    Ok(certs)
}

/// Load a private key from a PEM file.
/// Supports PKCS1, PKCS8, and Sec1 (EC) formats.
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| Error::Tls(format!("opening key {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);

    // Iterate through PEM items until a valid key is found.
    loop {
        match read_one(&mut reader) {
            Ok(Some(Item::Pkcs1Key(key))) => return Ok(key.into()),
            Ok(Some(Item::Pkcs8Key(key))) => return Ok(key.into()),
            Ok(Some(Item::Sec1Key(key))) => return Ok(key.into()),
            Ok(None) => break, // End of file
            Ok(Some(_)) => {}  // A certificate or other item, ignore
            Err(e) => return Err(Error::Tls(format!("key parse error: {}", e))),
        }
    }

    Err(Error::Tls(format!(
        "no private key found in {}",
        path.display()
    )))
}

/// Build a root store holding the configured CA.
fn load_root_store(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| Error::Tls(format!("bad CA cert in {}: {}", path.display(), e)))?;
    }
    Ok(roots)
}

/// Acceptor for the server role: presents the certfile chain and
/// requires clients to present a certificate signed by the CA.
pub fn server_acceptor(paths: &TlsPaths) -> Result<TlsAcceptor> {
    let roots = load_root_store(&paths.cafile)?;
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| Error::Tls(format!("client verifier: {}", e)))?;

    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(
            load_certs(&paths.certfile)?,
            load_private_key(&paths.certfile)?,
        )
        .map_err(|e| Error::Tls(format!("server config: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Connector for the client role: verifies the server against the CA
/// and presents the certfile chain for client authentication.
pub fn client_connector(paths: &TlsPaths) -> Result<TlsConnector> {
    let roots = load_root_store(&paths.cafile)?;

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(
            load_certs(&paths.certfile)?,
            load_private_key(&paths.certfile)?,
        )
        .map_err(|e| Error::Tls(format!("client config: {}", e)))?;

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Server name for certificate verification, from the configured host
/// (DNS name or IP address).
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|e| Error::Tls(format!("invalid server name {:?}: {}", host, e)))
}
