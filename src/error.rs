use std::fmt::Display;

/// cinderkv errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// An operation was attempted after `close()`.
    Closed,
    /// Invalid user input: empty key, oversized key or value.
    Validation(String),
    /// An IO error from the filesystem.
    IO(String),
    /// Corrupted persisted state: a CRC mismatch in the middle of the WAL,
    /// an undecodable manifest or sidecar, or a manifest referencing a
    /// missing SSTable.
    Corruption(String),
    /// A manual flush was requested while the active memtable is empty.
    EmptyMemtable,
    /// A full compaction was requested while no SSTables exist.
    EmptyCompaction,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Closed => write!(f, "store is closed"),
            Error::Validation(msg) => write!(f, "invalid input: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::EmptyMemtable => write!(f, "cannot flush an empty memtable"),
            Error::EmptyCompaction => write!(f, "no sstables to compact"),
        }
    }
}

/// A cinderkv Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Corruption(err.to_string())
    }
}
