#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("stream registry is already started, sinks cannot be changed while running")]
    AlreadyStarted,
    #[error("a sink named `{0}` is already registered")]
    DuplicateSink(String),
    #[error("failed to connect to database: {0}")]
    Connection(#[source] sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("failed to insert samples: {0}")]
    Insert(#[source] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
