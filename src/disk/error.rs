//! Disk-specific error types, narrower than the crate-wide [`crate::error::Error`],
//! mirroring the split the engine's disk module has always kept between
//! "torrent couldn't be allocated", "a write failed" and "a read failed".

use std::fmt;

/// Failure allocating a new torrent's on-disk storage.
#[derive(Debug)]
pub(crate) enum NewTorrentError {
    Io(std::io::Error),
}

impl fmt::Display for NewTorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "torrent storage IO error: {}", e),
        }
    }
}

impl std::error::Error for NewTorrentError {}

impl From<std::io::Error> for NewTorrentError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Failure writing a verified piece to disk.
#[derive(Debug)]
pub(crate) enum WriteError {
    Io(std::io::Error),
    InvalidPieceIndex,
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "piece write IO error: {}", e),
            Self::InvalidPieceIndex => write!(f, "invalid piece index"),
        }
    }
}

impl std::error::Error for WriteError {}

impl From<std::io::Error> for WriteError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Failure reading a piece back from disk.
#[derive(Debug)]
pub(crate) enum ReadError {
    Io(std::io::Error),
    InvalidPieceIndex,
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "piece read IO error: {}", e),
            Self::InvalidPieceIndex => write!(f, "invalid piece index"),
        }
    }
}

impl std::error::Error for ReadError {}

impl From<std::io::Error> for ReadError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

pub(crate) type NewTorrentResult<T> = std::result::Result<T, NewTorrentError>;
pub(crate) type WriteResult<T> = std::result::Result<T, WriteError>;
pub(crate) type ReadResult<T> = std::result::Result<T, ReadError>;
