use std::path::PathBuf;

use super::Field;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Discovery(#[from] crate::discovery::Error),
    #[error(transparent)]
    Host(#[from] crate::host::Error),
    #[error("discovered {chain} node lacks {}", join(missing))]
    Incomplete {
        chain: &'static str,
        missing: Vec<Field>,
    },
    #[error("{0} node is not discovered yet")]
    NotConfigured(&'static str),
    #[error("unknown chain `{name}`, supported are {}", supported.join(", "))]
    UnknownChain {
        name: String,
        supported: &'static [&'static str],
    },
    #[error("invalid pattern `{pattern}`: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("failed to encode node identity: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to access identity cache `{path}`: {source}")]
    Cache {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode identity cache `{path}`: {source}")]
    CacheDecode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn join(fields: &[Field]) -> String {
    fields
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, Error>;
