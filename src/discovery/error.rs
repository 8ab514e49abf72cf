use std::fmt;
use std::time::Duration;

use super::{Backend, containerd, docker, systemd};

/// Failure of a single backend call.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error(transparent)]
    Docker(#[from] docker::Error),
    #[error(transparent)]
    Containerd(#[from] containerd::Error),
    #[error(transparent)]
    Systemd(#[from] systemd::Error),
    #[error("no answer within {0:?}")]
    Timeout(Duration),
    #[error("{0} is disabled")]
    Disabled(Backend),
}

impl ProbeError {
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Self::Docker(err) => err.is_permission_denied(),
            Self::Containerd(err) => err.is_permission_denied(),
            Self::Systemd(err) => err.is_permission_denied(),
            Self::Timeout(_) | Self::Disabled(_) => false,
        }
    }
}

/// A backend that could not be queried, with operator guidance.
#[derive(Debug)]
pub struct BackendFailure {
    pub backend: Backend,
    pub error: ProbeError,
}

impl BackendFailure {
    /// What the operator has to grant when the backend refused access.
    pub fn hint(&self) -> Option<&'static str> {
        if !self.error.is_permission_denied() {
            return None;
        }
        Some(match self.backend {
            Backend::Docker => {
                "the agent needs read/write access to the docker socket (run it as root, \
                 add it to the `docker` group or mount the socket)"
            }
            Backend::Containerd => {
                "the agent needs access to the containerd socket, which is usually root only"
            }
            Backend::Systemd => "the agent needs permission to execute systemctl and journalctl",
        })
    }
}

impl fmt::Display for BackendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.backend, self.error)?;
        if let Some(hint) = self.hint() {
            write!(f, " (hint: {hint})")?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no discovery backend is enabled")]
    NoBackend,
    #[error("no running node matched {patterns:?} on {}", join(searched))]
    NotFound {
        searched: Vec<Backend>,
        patterns: Vec<String>,
    },
    #[error("no discovery backend could be reached: {}", join(failures))]
    Unreachable { failures: Vec<BackendFailure> },
}

impl Error {
    /// Whether retrying later may succeed without operator action.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, Error>;

/// Kind of the first I/O error in the source chain of `err`.
pub(crate) fn io_error_kind(err: &(dyn std::error::Error + 'static)) -> Option<std::io::ErrorKind> {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            return Some(io.kind());
        }
        current = err.source();
    }
    None
}
