//! Client certificate material for the mTLS registry transport
//!
//! Certificates rotate on a 90-day cycle, so the material is reloaded from
//! disk whenever the files change. Expired material is refused outright;
//! material within a week of expiry loads with a warning.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use notify::{RecursiveMode, Watcher};
use tracing::{info, warn};

use crate::registry::RegistryLookup;
use crate::CorrelatorError;

/// How close to expiry the material may get before load starts warning.
pub const EXPIRY_WARN_DAYS: i64 = 7;

#[derive(Debug)]
pub struct TlsMaterial {
    identity: reqwest::Identity,
    not_after: DateTime<Utc>,
}

impl TlsMaterial {
    /// Load and validate a PEM certificate/key pair. Fails when either file
    /// is unreadable, the PEM does not parse, no private key is present, or
    /// the certificate has expired.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, CorrelatorError> {
        let cert_pem = std::fs::read(cert_path)
            .map_err(|e| CorrelatorError::Certificate(format!("read {:?}: {}", cert_path, e)))?;
        let key_pem = std::fs::read(key_path)
            .map_err(|e| CorrelatorError::Certificate(format!("read {:?}: {}", key_path, e)))?;

        let (_, pem) = x509_parser::pem::parse_x509_pem(&cert_pem)
            .map_err(|e| CorrelatorError::Certificate(format!("bad certificate pem: {}", e)))?;
        let cert = pem
            .parse_x509()
            .map_err(|e| CorrelatorError::Certificate(format!("bad certificate: {}", e)))?;
        let not_after = DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
            .unwrap_or_default();

        let now = Utc::now();
        if not_after <= now {
            return Err(CorrelatorError::Certificate(format!(
                "client certificate expired at {}",
                not_after
            )));
        }
        if not_after - now < chrono::Duration::days(EXPIRY_WARN_DAYS) {
            warn!(
                "client certificate expires at {}, rotate it now",
                not_after
            );
        }

        let mut key_reader = std::io::Cursor::new(&key_pem);
        let items = rustls_pemfile::read_all(&mut key_reader)
            .map_err(|e| CorrelatorError::Certificate(format!("bad key pem: {}", e)))?;
        let has_key = items.iter().any(|item| {
            matches!(
                item,
                rustls_pemfile::Item::PKCS8Key(_)
                    | rustls_pemfile::Item::RSAKey(_)
                    | rustls_pemfile::Item::ECKey(_)
            )
        });
        if !has_key {
            return Err(CorrelatorError::Certificate(
                "no private key found in key file".into(),
            ));
        }

        let mut bundle = cert_pem;
        bundle.extend_from_slice(&key_pem);
        let identity = reqwest::Identity::from_pem(&bundle)
            .map_err(|e| CorrelatorError::Certificate(e.to_string()))?;

        Ok(Self { identity, not_after })
    }

    pub fn identity(&self) -> reqwest::Identity {
        self.identity.clone()
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }
}

/// Watch the certificate files and rebuild the registry transport on change.
/// The returned watcher must stay alive for the watch to keep running.
pub fn spawn_material_watcher(
    cert_path: PathBuf,
    key_path: PathBuf,
    registry: Arc<RegistryLookup>,
) -> Result<notify::RecommendedWatcher, CorrelatorError> {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(8);
    let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
        if let Ok(event) = result {
            if event.kind.is_modify() || event.kind.is_create() {
                let _ = tx.blocking_send(());
            }
        }
    })
    .map_err(|e| CorrelatorError::Certificate(e.to_string()))?;

    for path in [&cert_path, &key_path] {
        watcher
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|e| CorrelatorError::Certificate(format!("watch {:?}: {}", path, e)))?;
    }

    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            // rotation writes both files; settle before reloading
            tokio::time::sleep(Duration::from_millis(500)).await;
            while rx.try_recv().is_ok() {}

            match TlsMaterial::load(&cert_path, &key_path) {
                Ok(material) => {
                    info!(
                        "client certificate rotated, valid until {}",
                        material.not_after()
                    );
                    if let Err(e) = registry.rebuild_client(Some(material.identity())).await {
                        warn!("rebuilding registry transport failed: {}", e);
                    }
                }
                Err(e) => warn!("rotated certificate rejected, keeping old transport: {}", e),
            }
        }
    });

    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_material(dir: &Path, params: rcgen::CertificateParams) -> (PathBuf, PathBuf) {
        let cert = rcgen::Certificate::from_params(params).unwrap();
        let cert_path = dir.join("client.crt");
        let key_path = dir.join("client.key");
        std::fs::write(&cert_path, cert.serialize_pem().unwrap()).unwrap();
        std::fs::write(&key_path, cert.serialize_private_key_pem()).unwrap();
        (cert_path, key_path)
    }

    #[test]
    fn test_load_valid_material() {
        let dir = tempfile::tempdir().unwrap();
        let mut params = rcgen::CertificateParams::new(vec!["correlator".into()]);
        params.not_after = rcgen::date_time_ymd(2096, 1, 1);
        let (cert_path, key_path) = write_material(dir.path(), params);

        let material = TlsMaterial::load(&cert_path, &key_path).unwrap();
        assert!(material.not_after() > Utc::now());
    }

    #[test]
    fn test_expired_material_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut params = rcgen::CertificateParams::new(vec!["correlator".into()]);
        params.not_after = rcgen::date_time_ymd(2020, 1, 1);
        let (cert_path, key_path) = write_material(dir.path(), params);

        let err = TlsMaterial::load(&cert_path, &key_path).unwrap_err();
        assert!(matches!(err, CorrelatorError::Certificate(_)));
    }

    #[test]
    fn test_missing_files_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let err = TlsMaterial::load(&dir.path().join("a.crt"), &dir.path().join("a.key"))
            .unwrap_err();
        assert!(matches!(err, CorrelatorError::Certificate(_)));
    }

    #[test]
    fn test_garbage_certificate_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("bad.crt");
        let key_path = dir.path().join("bad.key");
        std::fs::write(&cert_path, "not a certificate").unwrap();
        std::fs::write(&key_path, "not a key").unwrap();
        assert!(TlsMaterial::load(&cert_path, &key_path).is_err());
    }
}
