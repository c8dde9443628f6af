use std::{
    fs,
    path::PathBuf,
    sync::{Mutex, RwLock},
    time::SystemTime,
};

use crate::error::ProviderError;

/// A PEM-encoded serving certificate chain and its private key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertAndKeyPem {
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

/// Source of the proxy's serving certificate.
///
/// The contents may change at any time, so consumers must call [`Self::current`]
/// on every TLS handshake instead of snapshotting the result.
pub trait ServingCertProvider: Send + Sync {
    fn current(&self) -> Result<CertAndKeyPem, ProviderError>;
}

/// Source of a client-CA trust bundle.
///
/// An empty bundle means this trust root currently contributes nothing.
/// Consumers must call [`Self::current_bundle`] on every validation instead
/// of snapshotting the result.
pub trait CaBundleProvider: Send + Sync {
    fn current_bundle(&self) -> Vec<u8>;
}

/// In-memory [`ServingCertProvider`] that can be swapped at runtime.
#[derive(Default)]
pub struct StaticCertProvider {
    inner: RwLock<Option<CertAndKeyPem>>,
}

impl StaticCertProvider {
    pub fn new(pair: CertAndKeyPem) -> Self {
        Self {
            inner: RwLock::new(Some(pair)),
        }
    }

    pub fn set(&self, pair: CertAndKeyPem) {
        *self.inner.write().expect("lock poisoned") = Some(pair);
    }
}

impl ServingCertProvider for StaticCertProvider {
    fn current(&self) -> Result<CertAndKeyPem, ProviderError> {
        self.inner
            .read()
            .expect("lock poisoned")
            .clone()
            .ok_or(ProviderError::Empty)
    }
}

/// In-memory [`CaBundleProvider`] that can be swapped at runtime.
#[derive(Default)]
pub struct StaticCaProvider {
    bundle: RwLock<Vec<u8>>,
}

impl StaticCaProvider {
    pub fn new(bundle: Vec<u8>) -> Self {
        Self {
            bundle: RwLock::new(bundle),
        }
    }

    pub fn set(&self, bundle: Vec<u8>) {
        *self.bundle.write().expect("lock poisoned") = bundle;
    }
}

impl CaBundleProvider for StaticCaProvider {
    fn current_bundle(&self) -> Vec<u8> {
        self.bundle.read().expect("lock poisoned").clone()
    }
}

/// Modification stamp of a file, used to detect rotation.
type FileStamp = (SystemTime, u64);

fn file_stamp(path: &PathBuf) -> Result<FileStamp, ProviderError> {
    let metadata = fs::metadata(path).map_err(|error| ProviderError::ReadError {
        error,
        path: path.clone(),
    })?;

    Ok((
        metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        metadata.len(),
    ))
}

fn read_file(path: &PathBuf) -> Result<Vec<u8>, ProviderError> {
    fs::read(path).map_err(|error| ProviderError::ReadError {
        error,
        path: path.clone(),
    })
}

/// File-backed [`ServingCertProvider`].
///
/// External rotation is a file replace. The files are re-read when their
/// modification stamps change, so a rotated pair is picked up on the next
/// handshake without a restart.
pub struct FileCertProvider {
    cert_path: PathBuf,
    key_path: PathBuf,
    cache: Mutex<Option<(FileStamp, FileStamp, CertAndKeyPem)>>,
}

impl FileCertProvider {
    pub fn new(cert_path: PathBuf, key_path: PathBuf) -> Self {
        Self {
            cert_path,
            key_path,
            cache: Mutex::new(None),
        }
    }
}

impl ServingCertProvider for FileCertProvider {
    fn current(&self) -> Result<CertAndKeyPem, ProviderError> {
        let cert_stamp = file_stamp(&self.cert_path)?;
        let key_stamp = file_stamp(&self.key_path)?;

        let mut cache = self.cache.lock().expect("lock poisoned");
        if let Some((cached_cert, cached_key, pair)) = cache.as_ref() {
            if *cached_cert == cert_stamp && *cached_key == key_stamp {
                return Ok(pair.clone());
            }
        }

        let pair = CertAndKeyPem {
            cert: read_file(&self.cert_path)?,
            key: read_file(&self.key_path)?,
        };
        *cache = Some((cert_stamp, key_stamp, pair.clone()));

        Ok(pair)
    }
}

/// File-backed [`CaBundleProvider`].
///
/// A missing or unreadable file yields an empty bundle rather than an error,
/// so one absent trust root does not block handshakes that the other root
/// could still satisfy.
pub struct FileCaProvider {
    path: PathBuf,
    cache: Mutex<Option<(FileStamp, Vec<u8>)>>,
}

impl FileCaProvider {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            cache: Mutex::new(None),
        }
    }
}

impl CaBundleProvider for FileCaProvider {
    fn current_bundle(&self) -> Vec<u8> {
        let Ok(stamp) = file_stamp(&self.path) else {
            return Vec::new();
        };

        let mut cache = self.cache.lock().expect("lock poisoned");
        if let Some((cached_stamp, bundle)) = cache.as_ref() {
            if *cached_stamp == stamp {
                return bundle.clone();
            }
        }

        let Ok(bundle) = read_file(&self.path).inspect_err(|error| {
            tracing::warn!(%error, "Failed to read a CA bundle file.");
        }) else {
            return Vec::new();
        };
        *cache = Some((stamp, bundle.clone()));

        bundle
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use super::*;
    use crate::generate::{cert_and_key_pem, generate_ca, generate_server_cert};

    #[test]
    fn static_provider_rotates() {
        let ca = generate_ca("ca").unwrap();
        let first = cert_and_key_pem(&generate_server_cert("one", &ca).unwrap());
        let second = cert_and_key_pem(&generate_server_cert("two", &ca).unwrap());

        let provider = StaticCertProvider::new(first.clone());
        assert_eq!(provider.current().unwrap(), first);

        provider.set(second.clone());
        assert_eq!(provider.current().unwrap(), second);
    }

    #[test]
    fn file_provider_reads_rotated_files() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("tls.crt");
        let key_path = dir.path().join("tls.key");

        let ca = generate_ca("ca").unwrap();
        let first = cert_and_key_pem(&generate_server_cert("one", &ca).unwrap());
        fs::write(&cert_path, &first.cert).unwrap();
        fs::write(&key_path, &first.key).unwrap();

        let provider = FileCertProvider::new(cert_path.clone(), key_path.clone());
        assert_eq!(provider.current().unwrap(), first);

        // Rotate. The new pair differs in length, so the stamp changes even
        // when the filesystem's mtime resolution is coarse.
        let second = cert_and_key_pem(&generate_server_cert("two-rotated", &ca).unwrap());
        fs::write(&cert_path, &second.cert).unwrap();
        fs::write(&key_path, &second.key).unwrap();
        assert_eq!(provider.current().unwrap(), second);
    }

    #[test]
    fn missing_ca_file_is_empty_bundle() {
        let provider = FileCaProvider::new("/definitely/not/here.pem".into());
        assert!(provider.current_bundle().is_empty());
    }
}
