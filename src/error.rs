use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the bus core.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum Error {
    #[error("not a valid well-known name")]
    InvalidName,
    #[error("connection owns too many names")]
    QuotaExceeded,
    #[error("name is taken and the owner does not allow replacement")]
    NameTaken,
    #[error("connection has no claim on this name")]
    NotPermitted,
    #[error("no such name or connection")]
    NotFound,
    #[error("pool exhausted")]
    OutOfMemory,
}
