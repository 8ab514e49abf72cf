#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Host(#[from] crate::host::Error),
    #[error("node process {pid} is gone")]
    ProcessGone { pid: u32 },
    #[error("invalid ignore pattern `{pattern}`: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
