//! The crate-wide error type and a `Result` alias built around it.
//!
//! Sessions never leak these to peers: a session's own failure is converted
//! into a disconnect (and, where attributable, a ban) by `peer::session`
//! rather than being propagated. This type exists for the boundary the
//! orchestrator and the persistence loop actually care about.

use std::fmt;

use crate::{FileIndex, PieceIndex};

/// The crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the core engine.
#[derive(Debug)]
pub enum Error {
    /// Wraps an IO error occurring anywhere in the engine (socket or file).
    Io(std::io::Error),
    /// The peer's handshake declared an info hash that doesn't match ours.
    InvalidPeerInfoHash,
    /// The peer claims to have every piece (is a seed) but later sent a
    /// `have` message, which the protocol forbids for seeds.
    SeedSentHave,
    /// We expected the peer to be a seed (or at least to announce an initial
    /// bitfield) but it wasn't/didn't.
    PeerNotSeed,
    /// A bitfield message arrived outside of the greeting state.
    BitfieldNotAfterHandshake,
    /// The peer's bitfield had a set bit past the last valid piece index, or
    /// had non-zero padding bits.
    InvalidBitfield,
    /// A `have`/`request`/`cancel`/`piece` message referred to a piece index
    /// that doesn't exist in this torrent.
    InvalidPieceIndex,
    /// The torrent's metainfo couldn't be bencoded back out to derive the
    /// info hash (a malformed `.torrent` file).
    InvalidMetainfo,
    /// A request referred to a file index that doesn't exist.
    InvalidFileIndex(FileIndex),
    /// A block's offset/length doesn't tile validly within its piece.
    InvalidBlockInfo,
    /// The peer sent a `piece` message for a block we never requested.
    UnexpectedBlock,
    /// The peer queued more outstanding requests than we allow, a DoS
    /// indicator.
    RequestQueueOverflow,
    /// A declared message length exceeds the allowed ceiling.
    MessageTooLarge { len: u32, max: u32 },
    /// An unsupported/unknown message id was received.
    InvalidMessageId(u8),
    /// A piece index used to look up a `DownloadingPiece` doesn't exist in
    /// the piece picker's slab (a programming-error-shaped bug if hit).
    UnknownDownloadingPiece(PieceIndex),
    /// A torrent id used to address a disk command doesn't correspond to any
    /// torrent the disk task knows about.
    InvalidTorrentId,
    /// A background task (disk, piece picker, peer session) could not be
    /// reached because its channel's receiving half was dropped.
    ChannelClosed,
    /// The operation was cancelled.
    Cancelled,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO error: {}", e),
            Self::InvalidPeerInfoHash => {
                write!(f, "peer handshake info hash mismatch")
            }
            Self::SeedSentHave => {
                write!(f, "peer declared itself a seed but sent have")
            }
            Self::PeerNotSeed => write!(f, "peer is not a seed"),
            Self::BitfieldNotAfterHandshake => {
                write!(f, "bitfield message received outside greeting state")
            }
            Self::InvalidBitfield => write!(f, "malformed bitfield"),
            Self::InvalidPieceIndex => write!(f, "invalid piece index"),
            Self::InvalidMetainfo => write!(f, "malformed torrent metainfo"),
            Self::InvalidFileIndex(i) => write!(f, "invalid file index {}", i),
            Self::InvalidBlockInfo => write!(f, "invalid block info"),
            Self::UnexpectedBlock => {
                write!(f, "received a block that was never requested")
            }
            Self::RequestQueueOverflow => {
                write!(f, "peer's request queue exceeded the allowed cap")
            }
            Self::MessageTooLarge { len, max } => write!(
                f,
                "message length {} exceeds maximum allowed {}",
                len, max
            ),
            Self::InvalidMessageId(id) => {
                write!(f, "unsupported message id {}", id)
            }
            Self::UnknownDownloadingPiece(i) => {
                write!(f, "no downloading piece entry for piece {}", i)
            }
            Self::InvalidTorrentId => write!(f, "invalid torrent id"),
            Self::ChannelClosed => {
                write!(f, "internal channel closed unexpectedly")
            }
            Self::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::ChannelClosed
    }
}

impl From<tokio::sync::mpsc::error::UnboundedSendError> for Error {
    fn from(_: tokio::sync::mpsc::error::UnboundedSendError) -> Self {
        Self::ChannelClosed
    }
}

impl From<tokio::time::Elapsed> for Error {
    fn from(_: tokio::time::Elapsed) -> Self {
        Self::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "operation timed out",
        ))
    }
}
