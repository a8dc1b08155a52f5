use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::certificates::CertificateChain;
use crate::domains::DomainGroup;

/// RSA account key, directly under the storage root.
pub const ACCOUNT_KEY_FILE: &str = "accountKey.pem";
/// Certificate private key inside a bundle directory.
pub const PRIVKEY_FILE: &str = "privkey.pem";
/// Leaf followed by every intermediate.
pub const FULLCHAIN_FILE: &str = "fullchain.pem";
/// Leaf certificate only.
pub const CERT_FILE: &str = "cert.pem";
/// Intermediates only; absent when the server sent none.
pub const CHAIN_FILE: &str = "chain.pem";

#[derive(Debug, Error)]
#[error("failed to write {path}: {source}")]
pub struct StorageError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    /// Readable by everyone the umask allows.
    Public,
    /// `0600` on Unix.
    Private,
}

/// On-disk layout under one storage root:
///
/// ```text
/// {root}/accountKey.pem
/// {root}/{stem}.key
/// {root}/{stem}/privkey.pem
/// {root}/{stem}/fullchain.pem
/// {root}/{stem}/cert.pem
/// {root}/{stem}/chain.pem     (only with intermediates)
/// ```
///
/// `stem` is the primary domain with `*` replaced by `_`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn account_key_path(&self) -> PathBuf {
        self.root.join(ACCOUNT_KEY_FILE)
    }

    #[must_use]
    pub fn certificate_key_path(&self, group: &DomainGroup) -> PathBuf {
        self.root.join(format!("{}.key", group.file_stem()))
    }

    #[must_use]
    pub fn bundle_dir(&self, group: &DomainGroup) -> PathBuf {
        self.root.join(group.file_stem())
    }

    #[must_use]
    pub fn bundle_paths(&self, group: &DomainGroup) -> BundlePaths {
        let dir = self.bundle_dir(group);
        BundlePaths {
            private_key: dir.join(PRIVKEY_FILE),
            full_chain: dir.join(FULLCHAIN_FILE),
            certificate: dir.join(CERT_FILE),
            chain: dir.join(CHAIN_FILE),
        }
    }

    /// Writes `privkey.pem` and `fullchain.pem`, then splits the chain into
    /// `cert.pem` and `chain.pem`.
    ///
    /// A stale `chain.pem` from an earlier issuance is removed when the new
    /// chain carries no intermediates. Nothing is rolled back on failure.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` naming the file that could not be written.
    pub fn write_bundle(
        &self,
        group: &DomainGroup,
        private_key_pem: &str,
        chain: &CertificateChain,
    ) -> Result<BundlePaths, StorageError> {
        let paths = self.bundle_paths(group);
        write_pem(&paths.private_key, private_key_pem, FileMode::Private)
            .map_err(|source| StorageError::at(&paths.private_key, source))?;
        write_pem(&paths.full_chain, &chain.full_chain_pem(), FileMode::Public)
            .map_err(|source| StorageError::at(&paths.full_chain, source))?;
        write_pem(&paths.certificate, chain.leaf(), FileMode::Public)
            .map_err(|source| StorageError::at(&paths.certificate, source))?;

        match chain.chain_pem() {
            Some(intermediates) => write_pem(&paths.chain, &intermediates, FileMode::Public)
                .map_err(|source| StorageError::at(&paths.chain, source))?,
            None => match fs::remove_file(&paths.chain) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(StorageError::at(&paths.chain, source)),
            },
        }

        debug!(
            group = group.primary(),
            dir = %self.bundle_dir(group).display(),
            intermediates = chain.intermediates().len(),
            "certificate bundle written"
        );
        Ok(paths)
    }
}

/// Files of one issued bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundlePaths {
    pub private_key: PathBuf,
    pub full_chain: PathBuf,
    pub certificate: PathBuf,
    pub chain: PathBuf,
}

impl StorageError {
    fn at(path: &Path, source: io::Error) -> Self {
        Self {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Writes PEM text with a single trailing newline, creating parent
/// directories as needed.
pub(crate) fn write_pem(path: &Path, value: &str, mode: FileMode) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut normalized = value.trim().to_owned();
    normalized.push('\n');

    let mut file = open_for_write(path, mode)?;
    file.write_all(normalized.as_bytes())?;
    restrict_permissions(&file, mode)?;
    Ok(())
}

#[cfg(unix)]
fn open_for_write(path: &Path, mode: FileMode) -> io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    if mode == FileMode::Private {
        options.mode(0o600);
    }
    options.open(path)
}

#[cfg(not(unix))]
fn open_for_write(path: &Path, _mode: FileMode) -> io::Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

/// `mode` only applies to newly created files, so existing ones are
/// tightened explicitly.
#[cfg(unix)]
fn restrict_permissions(file: &fs::File, mode: FileMode) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if mode == FileMode::Private {
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(not(unix))]
#[allow(clippy::unnecessary_wraps)]
const fn restrict_permissions(_file: &fs::File, _mode: FileMode) -> io::Result<()> {
    Ok(())
}
