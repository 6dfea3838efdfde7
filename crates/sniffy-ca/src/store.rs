//! On-disk persistence of the root CA material.
//!
//! A store is a directory holding exactly two PEM artifacts, the root
//! certificate and its private key. Loading never regenerates over existing
//! state: a missing half, an unparsable artifact or a mismatched pair aborts.

use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use rcgen::KeyPair;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::{debug, info};

use crate::config::CaConfig;
use crate::error::CaError;
use crate::root::{Defect, RootMaterial};

/// Subdirectory of the home directory used when no path is given.
pub const DEFAULT_STORE_SUBDIR: &str = ".sniffy";
pub const CA_CERT_FILE_NAME: &str = "sniffy-ca.crt";
pub const CA_KEY_FILE_NAME: &str = "sniffy-ca.key";

#[cfg(unix)]
const DIR_MODE: u32 = 0o700;
const CERT_FILE_MODE: u32 = 0o644;
const KEY_FILE_MODE: u32 = 0o600;

/// Inputs for turning a user-supplied storage path into a directory.
///
/// Holds the home and working directories explicitly so resolution does not
/// depend on process-global state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreLocator {
    home: Option<PathBuf>,
    cwd: Option<PathBuf>,
}

impl StoreLocator {
    pub fn new(home: Option<PathBuf>, cwd: Option<PathBuf>) -> Self {
        Self { home, cwd }
    }

    /// Build a locator from `HOME`, then `USERPROFILE`, then the platform
    /// home directory, and the current working directory.
    pub fn from_env() -> Self {
        let home = ["HOME", "USERPROFILE"]
            .into_iter()
            .filter_map(env::var_os)
            .find(|value| !value.is_empty())
            .map(PathBuf::from)
            .or_else(dirs::home_dir);
        Self {
            home,
            cwd: env::current_dir().ok(),
        }
    }

    /// Resolve `input` to a storage directory, creating it if absent.
    ///
    /// Empty input means `<home>/.sniffy`; relative input is joined onto the
    /// working directory; absolute input is used as-is.
    pub fn resolve(&self, input: &str) -> Result<PathBuf, CaError> {
        let path = if input.is_empty() {
            self.home
                .as_ref()
                .map(|home| home.join(DEFAULT_STORE_SUBDIR))
                .ok_or_else(|| CaError::Path {
                    path: PathBuf::from(DEFAULT_STORE_SUBDIR),
                    source: io::Error::new(
                        io::ErrorKind::NotFound,
                        "home directory could not be determined",
                    ),
                })?
        } else if Path::new(input).is_absolute() {
            PathBuf::from(input)
        } else {
            self.cwd
                .as_ref()
                .map(|cwd| cwd.join(input))
                .ok_or_else(|| CaError::Path {
                    path: PathBuf::from(input),
                    source: io::Error::new(
                        io::ErrorKind::NotFound,
                        "working directory could not be determined",
                    ),
                })?
        };

        ensure_dir(&path)?;
        Ok(path)
    }
}

/// A resolved storage directory and the artifact paths inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Store {
    dir: PathBuf,
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl Store {
    /// Resolve `input` through `locator` and open the store there.
    pub fn open(locator: &StoreLocator, input: &str) -> Result<Self, CaError> {
        let dir = locator.resolve(input)?;
        Ok(Self::at(dir))
    }

    /// A store rooted at an already-resolved directory.
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            cert_path: dir.join(CA_CERT_FILE_NAME),
            key_path: dir.join(CA_KEY_FILE_NAME),
            dir,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// Load the root material if both artifacts exist, generate and persist
    /// it if neither does, and fail on anything in between.
    pub fn load_or_create(&self, config: &CaConfig) -> Result<RootMaterial, CaError> {
        let cert_exists = exists(&self.cert_path)?;
        let key_exists = exists(&self.key_path)?;

        match (cert_exists, key_exists) {
            (true, true) => self.load(),
            (false, false) => {
                let root = RootMaterial::generate(config)?;
                self.persist(&root)?;
                Ok(root)
            }
            (true, false) => Err(CaError::corrupt(
                &self.key_path,
                format!("missing while {CA_CERT_FILE_NAME} exists"),
            )),
            (false, true) => Err(CaError::corrupt(
                &self.cert_path,
                format!("missing while {CA_KEY_FILE_NAME} exists"),
            )),
        }
    }

    fn load(&self) -> Result<RootMaterial, CaError> {
        let cert_pem = read_pem(&self.cert_path)?;
        let key_pem = read_pem(&self.key_path)?;

        let cert_der = parse_cert(&cert_pem).map_err(|e| CaError::corrupt(&self.cert_path, e))?;
        let key_pair = parse_key(&key_pem).map_err(|e| CaError::corrupt(&self.key_path, e))?;

        let root =
            RootMaterial::from_parts(cert_der, cert_pem, key_pair, key_pem).map_err(|defect| {
                match defect {
                    Defect::Certificate(reason) => CaError::corrupt(&self.cert_path, reason),
                    Defect::Key(reason) => CaError::corrupt(&self.key_path, reason),
                }
            })?;

        info!(
            path = %self.dir.display(),
            fingerprint = %root.certificate().fingerprint(),
            "loaded root CA"
        );
        Ok(root)
    }

    fn persist(&self, root: &RootMaterial) -> Result<(), CaError> {
        write_new_file(
            &self.cert_path,
            root.certificate().pem().as_bytes(),
            CERT_FILE_MODE,
        )?;
        if let Err(e) = write_new_file(
            &self.key_path,
            root.key_pem().as_bytes(),
            KEY_FILE_MODE,
        ) {
            let _ = fs::remove_file(&self.cert_path);
            return Err(e);
        }

        info!(
            path = %self.dir.display(),
            fingerprint = %root.certificate().fingerprint(),
            "persisted new root CA"
        );
        Ok(())
    }
}

fn ensure_dir(path: &Path) -> Result<(), CaError> {
    let path_err = |source: io::Error| CaError::Path {
        path: path.to_path_buf(),
        source,
    };

    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(path_err(io::Error::other("exists but is not a directory"))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            create_dir(path).map_err(path_err)?;
            debug!(path = %path.display(), "created storage directory");
            Ok(())
        }
        Err(e) => Err(path_err(e)),
    }
}

#[cfg(unix)]
fn create_dir(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    fs::DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(path)
}

#[cfg(not(unix))]
fn create_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}

fn exists(path: &Path) -> Result<bool, CaError> {
    path.try_exists().map_err(|source| CaError::Access {
        path: path.to_path_buf(),
        source,
    })
}

fn read_pem(path: &Path) -> Result<String, CaError> {
    let bytes = fs::read(path).map_err(|source| CaError::Access {
        path: path.to_path_buf(),
        source,
    })?;
    String::from_utf8(bytes).map_err(|_| CaError::corrupt(path, "not a UTF-8 PEM file"))
}

fn parse_cert(pem: &str) -> Result<CertificateDer<'static>, String> {
    let mut reader = io::BufReader::new(pem.as_bytes());
    let first = rustls_pemfile::certs(&mut reader).next();
    first
        .ok_or_else(|| "no certificate found in PEM".to_string())?
        .map_err(|e| format!("failed to parse certificate PEM: {e}"))
}

fn parse_key(pem: &str) -> Result<KeyPair, String> {
    let mut reader = io::BufReader::new(pem.as_bytes());
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut reader)
        .map_err(|e| format!("failed to parse key PEM: {e}"))?
        .ok_or_else(|| "no private key found in PEM".to_string())?;
    KeyPair::try_from(&key).map_err(|e| format!("unsupported private key: {e}"))
}

/// Create `path` exclusively with the given unix mode and write `contents`.
fn write_new_file(path: &Path, contents: &[u8], mode: u32) -> Result<(), CaError> {
    let path_err = |source: io::Error| CaError::Path {
        path: path.to_path_buf(),
        source,
    };

    let mut opts = fs::OpenOptions::new();
    opts.create_new(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = opts.open(path).map_err(path_err)?;
    fill_or_remove(path, || {
        file.write_all(contents)?;
        file.sync_all()
    })
}

/// Run `fill` against a freshly created `path`, deleting the file if it
/// fails so no partial artifact is left behind.
fn fill_or_remove(path: &Path, fill: impl FnOnce() -> io::Result<()>) -> Result<(), CaError> {
    fill().map_err(|source| {
        let _ = fs::remove_file(path);
        CaError::Path {
            path: path.to_path_buf(),
            source,
        }
    })
}
