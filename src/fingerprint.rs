//! Drift detection for the discovered node identity.
//!
//! A [`Fingerprint`] is the SHA-256 digest of a canonical byte snapshot. The
//! agent persists the digest between runs and compares a freshly computed one
//! against it; a mismatch surfaces as [`Error::Validation`], telling the caller
//! that the monitored target changed since the digest was recorded.
use std::fmt;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Length of the hex encoded SHA-256 digest.
pub const DIGEST_HEX_LEN: usize = 64;

/// A freshly computed digest disagrees with the persisted one.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("hash mismatch detected, expected {expected}, got {actual}")]
pub struct ValidationError {
    expected: String,
    actual: String,
}

impl ValidationError {
    /// The previously persisted digest.
    pub fn expected(&self) -> &str {
        &self.expected
    }

    /// The digest computed in this run.
    pub fn actual(&self) -> &str {
        &self.actual
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("unexpected hash length, expected {expected}, got {0}", expected = DIGEST_HEX_LEN)]
    DigestLength(usize),
    #[error("unexpected number of bytes written: {written}/{expected}")]
    ShortWrite { written: usize, expected: usize },
    #[error("failed to read previous fingerprint: {0}")]
    Read(#[source] io::Error),
    #[error("failed to write fingerprint: {0}")]
    Write(#[source] io::Error),
    #[error("failed to access fingerprint file `{path}`: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// The drift signal, if this error is one.
    pub fn as_validation(&self) -> Option<&ValidationError> {
        match self {
            Self::Validation(err) => Some(err),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Hex encoded SHA-256 digest of one snapshot. Immutable once computed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    hash: String,
}

impl Fingerprint {
    /// Hashes `data`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DigestLength`] if the encoded digest does not have the
    /// expected length.
    pub fn compute(data: &[u8]) -> Result<Self> {
        let hash = hex::encode(Sha256::digest(data));
        if hash.len() != DIGEST_HEX_LEN {
            return Err(Error::DigestLength(hash.len()));
        }
        Ok(Self { hash })
    }

    /// Computes the fingerprint of `data` and validates it against the digest
    /// readable from `previous`. Nothing is persisted.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] if a previous digest exists and differs.
    /// - [`Error::Read`] if `previous` cannot be read.
    /// - Construction errors from [`compute`](Self::compute).
    pub fn new_with_validation(data: &[u8], previous: impl Read) -> Result<Self> {
        let fingerprint = Self::compute(data)?;
        fingerprint.validate_against(previous)?;
        Ok(fingerprint)
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Compares against the digest readable from `previous`. An empty previous
    /// digest (first run) always validates. Surrounding whitespace is ignored.
    pub fn validate_against(&self, mut previous: impl Read) -> Result<()> {
        let mut raw = String::with_capacity(DIGEST_HEX_LEN);
        previous.read_to_string(&mut raw).map_err(Error::Read)?;

        let expected = raw.trim();
        if !expected.is_empty() && expected != self.hash {
            return Err(ValidationError {
                expected: expected.to_owned(),
                actual: self.hash.clone(),
            }
            .into());
        }
        Ok(())
    }

    /// Writes the textual digest to `out`.
    ///
    /// # Errors
    ///
    /// - [`Error::ShortWrite`] if `out` stops accepting bytes mid-digest.
    /// - [`Error::Write`] on any other I/O failure.
    pub fn persist(&self, mut out: impl Write) -> Result<()> {
        let bytes = self.hash.as_bytes();
        let mut written = 0;
        while written < bytes.len() {
            match out.write(&bytes[written..]) {
                Ok(0) => {
                    return Err(Error::ShortWrite {
                        written,
                        expected: bytes.len(),
                    });
                }
                Ok(n) => written += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(Error::Write(err)),
            }
        }
        out.flush().map_err(Error::Write)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hash)
    }
}

/// File backed store for a persisted digest.
#[derive(Debug, Clone)]
pub struct FingerprintFile {
    path: PathBuf,
}

impl FingerprintFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens the persisted digest for reading. A missing file reads as empty.
    pub fn reader(&self) -> Result<Box<dyn Read>> {
        match std::fs::File::open(&self.path) {
            Ok(file) => Ok(Box::new(file)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Box::new(io::empty())),
            Err(source) => Err(Error::File {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Replaces the stored digest. The digest is written to a sibling file and
    /// renamed into place.
    pub fn store(&self, fingerprint: &Fingerprint) -> Result<()> {
        let file_error = |source| Error::File {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(file_error)?;
        }
        let staging = self.path.with_extension("tmp");
        let file = std::fs::File::create(&staging).map_err(file_error)?;
        fingerprint.persist(file)?;
        std::fs::rename(&staging, &self.path).map_err(file_error)?;
        log::debug!(
            "Persisted fingerprint {} to `{}`",
            fingerprint,
            self.path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_compute_is_hex_sha256() {
        let fp = Fingerprint::compute(b"abc").unwrap();
        assert_eq!(
            fp.hash(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_validates_against_same_digest() {
        let fp = Fingerprint::compute(b"node").unwrap();
        let mut store = Vec::new();
        fp.persist(&mut store).unwrap();
        assert!(fp.validate_against(Cursor::new(store)).is_ok());
    }

    #[test]
    fn test_mismatch_carries_both_digests() {
        let previous = Fingerprint::compute(b"old").unwrap();
        let err = Fingerprint::new_with_validation(b"new", Cursor::new(previous.hash().to_owned()))
            .unwrap_err();
        let validation = err.as_validation().expect("validation error");
        assert_eq!(validation.expected(), previous.hash());
        assert_eq!(
            validation.actual(),
            Fingerprint::compute(b"new").unwrap().hash()
        );
    }

    #[test]
    fn test_empty_previous_validates() {
        let fp = Fingerprint::new_with_validation(b"first run", io::empty()).unwrap();
        assert_eq!(fp.hash().len(), DIGEST_HEX_LEN);
        assert!(fp.validate_against(Cursor::new("  \n")).is_ok());
    }

    #[test]
    fn test_trailing_newline_is_ignored() {
        let fp = Fingerprint::compute(b"node").unwrap();
        assert!(fp.validate_against(Cursor::new(format!("{}\n", fp.hash()))).is_ok());
    }

    #[test]
    fn test_short_write_is_an_error() {
        let fp = Fingerprint::compute(b"node").unwrap();
        let mut buf = [0u8; 10];
        let err = fp.persist(&mut buf[..]).unwrap_err();
        assert!(matches!(
            err,
            Error::ShortWrite {
                written: 10,
                expected: DIGEST_HEX_LEN,
            }
        ));
        assert_eq!(
            err.to_string(),
            format!("unexpected number of bytes written: 10/{DIGEST_HEX_LEN}")
        );
    }

    #[test]
    fn test_digest_length_message_names_both_lengths() {
        let err = Error::DigestLength(12);
        assert_eq!(
            err.to_string(),
            format!("unexpected hash length, expected {DIGEST_HEX_LEN}, got 12")
        );
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FingerprintFile::new(dir.path().join("state/node.fingerprint"));

        let fp = Fingerprint::new_with_validation(b"id-1", store.reader().unwrap()).unwrap();
        store.store(&fp).unwrap();
        assert!(Fingerprint::new_with_validation(b"id-1", store.reader().unwrap()).is_ok());

        let err = Fingerprint::new_with_validation(b"id-2", store.reader().unwrap()).unwrap_err();
        assert!(err.as_validation().is_some());
    }
}
