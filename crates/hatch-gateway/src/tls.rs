//! TLS for the agent and client listeners.

use hatch_core::{HatchError, HatchResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Load certificate and key PEM files into an acceptor.
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> HatchResult<TlsAcceptor> {
    let cert_pem = std::fs::read(cert_path).map_err(|e| {
        HatchError::Other(format!("cannot read cert {}: {e}", cert_path.display()))
    })?;
    let key_pem = std::fs::read(key_path)
        .map_err(|e| HatchError::Other(format!("cannot read key {}: {e}", key_path.display())))?;

    let certs: Vec<rustls::pki_types::CertificateDer<'static>> =
        rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| HatchError::Other(format!("bad certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(HatchError::Other(format!(
            "no certificates in {}",
            cert_path.display()
        )));
    }
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| HatchError::Other(format!("bad key PEM: {e}")))?
        .ok_or_else(|| HatchError::Other("no private key found in PEM".into()))?;

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| HatchError::Other(format!("TLS setup failed: {e}")))?
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .map_err(|e| HatchError::Other(format!("TLS setup failed: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Write a self-signed development certificate into `dir`.
pub fn generate_self_signed_cert(dir: &Path) -> HatchResult<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(dir)?;
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");

    let gen_err = |e: rcgen::Error| HatchError::Other(format!("certificate generation failed: {e}"));
    let mut params = rcgen::CertificateParams::new(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ])
    .map_err(gen_err)?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "hatch-gateway dev cert");

    let key_pair = rcgen::KeyPair::generate().map_err(gen_err)?;
    let cert = params.self_signed(&key_pair).map_err(gen_err)?;

    std::fs::write(&cert_path, cert.pem())?;
    std::fs::write(&key_path, key_pair.serialize_pem())?;
    Ok((cert_path, key_path))
}
