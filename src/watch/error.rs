#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown overflow policy `{0}`, expected `block` or `drop-oldest`")]
    UnknownOverflowPolicy(String),
}

pub type Result<T> = std::result::Result<T, Error>;
