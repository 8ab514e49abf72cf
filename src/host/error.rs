use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("detected container runtime environment, but missing host root mount at `{0}`")]
    MissingRootMount(PathBuf),
    #[error("failed to read symlink `{path}`: {source}")]
    ReadSymlink {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read file `{path}`: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed `{path}`: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

impl Error {
    /// Whether the error stems from a path that does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::ReadFile { source, .. } | Self::ReadSymlink { source, .. } => {
                source.kind() == std::io::ErrorKind::NotFound
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
