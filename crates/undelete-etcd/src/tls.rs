use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use etcd_client::{Certificate, Identity, TlsOptions};
use undelete_core::store::StoreError;

const PEM_MARKER: &[u8] = b"-----BEGIN ";

/// Locations of the CA bundle and the client key pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// PEM material read from disk. The private key is never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    ca: Vec<u8>,
    cert: Vec<u8>,
    key: Vec<u8>,
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("ca_bytes", &self.ca.len())
            .field("cert_bytes", &self.cert.len())
            .field("key", &"<redacted>")
            .finish()
    }
}

impl TlsMaterial {
    pub fn load(paths: &TlsPaths) -> Result<Self, StoreError> {
        Ok(Self {
            ca: read_pem(&paths.ca)?,
            cert: read_pem(&paths.cert)?,
            key: read_pem(&paths.key)?,
        })
    }

    /// Client TLS options that present the key pair and verify the server against the CA.
    /// `server_name` replaces the dial host as the name checked against the certificate.
    pub fn to_options(&self, server_name: Option<&str>) -> TlsOptions {
        let options = TlsOptions::new()
            .ca_certificate(Certificate::from_pem(&self.ca))
            .identity(Identity::from_pem(&self.cert, &self.key));
        match server_name {
            Some(name) => options.domain_name(name),
            None => options,
        }
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, StoreError> {
    let bytes = fs::read(path).map_err(|err| config_err(path, err))?;
    if !bytes.windows(PEM_MARKER.len()).any(|w| w == PEM_MARKER) {
        return Err(config_err(path, "no PEM block found"));
    }
    Ok(bytes)
}

fn config_err<E: ToString>(path: &Path, err: E) -> StoreError {
    StoreError::Config {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEM: &str = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).expect("write pem");
        path
    }

    #[test]
    fn loads_pem_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = TlsPaths {
            ca: write(dir.path(), "ca.crt", PEM),
            cert: write(dir.path(), "client.crt", PEM),
            key: write(dir.path(), "client.key", PEM),
        };

        let material = TlsMaterial::load(&paths).expect("load");
        assert_eq!(material.ca, PEM.as_bytes());
        assert!(!format!("{material:?}").contains("MIIB"));
    }

    #[test]
    fn missing_file_is_config_error_naming_the_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("absent.crt");
        let paths = TlsPaths {
            ca: missing.clone(),
            cert: write(dir.path(), "client.crt", PEM),
            key: write(dir.path(), "client.key", PEM),
        };

        let err = TlsMaterial::load(&paths).expect_err("should fail");
        assert!(matches!(
            err,
            StoreError::Config { ref path, .. } if path == &missing.display().to_string()
        ));
    }

    #[test]
    fn rejects_non_pem_material() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = TlsPaths {
            ca: write(dir.path(), "ca.crt", PEM),
            cert: write(dir.path(), "client.crt", PEM),
            key: write(dir.path(), "client.key", "not a key"),
        };

        let err = TlsMaterial::load(&paths).expect_err("should fail");
        assert!(matches!(err, StoreError::Config { ref reason, .. } if reason.contains("PEM")));
    }
}
