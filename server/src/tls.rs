//! TLS listener material.
//!
//! The rustls server config advertises ALPN `http/1.1` and is swapped
//! atomically on certificate reload. Reload candidates are validated by
//! building a fresh config before the swap, so a half-written cert on disk
//! never takes down the listener. Existing connections keep the config
//! they handshook with.

use std::io::BufReader;
use std::sync::Arc;

use axum_server::tls_rustls::RustlsConfig;
use parking_lot::Mutex;
use rustls::pki_types::CertificateDer;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::Error;

pub struct TlsContext {
    config: RustlsConfig,
    cert_path: String,
    key_path: String,
    fingerprints: Mutex<(String, String)>,
}

impl TlsContext {
    /// Loads certificate and key and records their fingerprints for the
    /// reload check.
    pub fn load(cfg: &Config) -> Result<Self, Error> {
        let server_config = build_server_config(&cfg.ssl_certificate, &cfg.ssl_private_key)?;
        let fingerprints = (
            file_fingerprint(&cfg.ssl_certificate)?,
            file_fingerprint(&cfg.ssl_private_key)?,
        );

        if !cfg.ssl_ca_certificate.is_empty() {
            // Client certificates are not requested; the CA option is
            // accepted for config compatibility.
            warn!(path = %cfg.ssl_ca_certificate, "ssl_ca_certificate is set but client certificate verification is not performed");
        }

        Ok(Self {
            config: RustlsConfig::from_config(server_config),
            cert_path: cfg.ssl_certificate.clone(),
            key_path: cfg.ssl_private_key.clone(),
            fingerprints: Mutex::new(fingerprints),
        })
    }

    /// Handle for the TLS listener; reloads through this context are
    /// visible to it.
    pub fn rustls_config(&self) -> RustlsConfig {
        self.config.clone()
    }

    /// Reloads the certificate and key if either file changed on disk.
    /// Returns true when a reload happened.
    pub fn maybe_reload(&self) -> Result<bool, Error> {
        let current = (
            file_fingerprint(&self.cert_path)?,
            file_fingerprint(&self.key_path)?,
        );

        {
            let fingerprints = self.fingerprints.lock();
            if *fingerprints == current {
                return Ok(false);
            }
        }

        info!("change to TLS certificate or private key detected");
        self.swap(current)?;
        Ok(true)
    }

    /// Unconditional reload, for the HUP signal.
    pub fn force_reload(&self) -> Result<(), Error> {
        let current = (
            file_fingerprint(&self.cert_path)?,
            file_fingerprint(&self.key_path)?,
        );
        self.swap(current)
    }

    fn swap(&self, fingerprints: (String, String)) -> Result<(), Error> {
        // Building the config is the validation step; a parse failure
        // leaves the active config untouched.
        let new_config = build_server_config(&self.cert_path, &self.key_path)?;
        self.config.reload_from_config(new_config);
        *self.fingerprints.lock() = fingerprints;
        Ok(())
    }
}

fn build_server_config(cert_path: &str, key_path: &str) -> Result<Arc<rustls::ServerConfig>, Error> {
    let mut cert_reader = BufReader::new(std::fs::File::open(cert_path)?);
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_reader).collect::<Result<_, _>>()?;

    if certs.is_empty() {
        return Err(Error::Tls(format!("no certificates found in {cert_path}")));
    }

    let mut key_reader = BufReader::new(std::fs::File::open(key_path)?);
    let key = rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| Error::Tls(format!("no private key found in {key_path}")))?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(e.to_string()))?;

    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// SHA-256 fingerprint of a file's contents, hex encoded.
fn file_fingerprint(path: &str) -> Result<String, Error> {
    let data = std::fs::read(path)?;
    Ok(hex::encode(Sha256::digest(&data)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn fingerprint_tracks_file_contents() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "certificate one").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let first = file_fingerprint(&path).unwrap();
        assert_eq!(first, file_fingerprint(&path).unwrap());

        write!(file, " updated").unwrap();
        file.flush().unwrap();
        assert_ne!(first, file_fingerprint(&path).unwrap());
    }

    #[test]
    fn fingerprint_of_missing_file_errors() {
        assert!(file_fingerprint("/nonexistent/cert.pem").is_err());
    }

    #[test]
    fn config_without_certificates_is_rejected() {
        let mut empty = tempfile::NamedTempFile::new().unwrap();
        write!(empty, "not a pem").unwrap();
        let path = empty.path().to_str().unwrap();
        assert!(build_server_config(path, path).is_err());
    }
}
