use std::io;

/// Errors surfaced by the database engines.
///
/// Callers are expected to treat [`Error::NotFound`] specially and everything
/// else as a plain failure; the variants exist so that the failure can be
/// logged with enough detail to act on.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The requested record, blob or key does not exist.
    #[error("not found")]
    NotFound,

    /// A write operation was attempted on a read-only handle.
    #[error("database is read-only")]
    ReadOnly,

    /// The file contents do not match what the format requires.
    #[error("corrupt database: {0}")]
    Corrupt(String),

    /// The caller passed an argument the engine cannot represent.
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }
}

/// Shorthand used throughout the crate.
pub fn corrupt(msg: impl Into<String>) -> Error {
    Error::Corrupt(msg.into())
}

pub type Result<T> = std::result::Result<T, Error>;
