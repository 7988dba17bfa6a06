use thiserror::Error;

/// Error taxonomy shared across the firmware core.
///
/// Components map their failures onto these variants so that callers can make
/// recover/surface/fail-safe decisions without inspecting strings.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("not found")]
    NotFound,
    #[error("integrity error: both primary and spare copies are corrupt")]
    Integrity,
    #[error("authentication failed")]
    Auth,
    #[error("crypto error: {0}")]
    Crypto(&'static str),
    #[error("version rejected: new={new} current={current}")]
    VersionRejected { new: u32, current: u32 },
    #[error("timed out")]
    Timeout,
    #[error("out of memory")]
    NoMemory,
    #[error("storage backend failure: {0}")]
    Backend(String),
    #[error("i/o failure: {0}")]
    Io(String),
    #[error("unauthorized: {0}")]
    Unauthorized(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
