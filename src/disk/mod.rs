//! The File Manager: owns every torrent's file handles, maps the flat piece
//! space onto byte offsets across them, and performs hashing and positioned
//! reads/writes off the async executor via a blocking-task pool.

pub(crate) mod error;
mod io;

use std::{collections::HashMap, sync::Arc};

use tokio::{sync::mpsc, task};

use crate::{
    error::{Error, Result},
    storage_info::StorageInfo,
    PieceIndex, Sha1Hash, TorrentId,
};

use error::*;
pub(crate) use io::Stats;
use io::Torrent;

/// Commands accepted by the disk task.
enum Command {
    NewTorrent {
        id: TorrentId,
        info: StorageInfo,
        piece_hashes: Vec<Sha1Hash>,
        reply: tokio::sync::oneshot::Sender<
            NewTorrentResult<std::collections::HashSet<PieceIndex>>,
        >,
    },
    WritePiece {
        id: TorrentId,
        index: PieceIndex,
        data: Vec<u8>,
        reply: tokio::sync::oneshot::Sender<WriteResult<()>>,
    },
    ReadPiece {
        id: TorrentId,
        index: PieceIndex,
        begin: u32,
        length: u32,
        reply: tokio::sync::oneshot::Sender<ReadResult<Vec<u8>>>,
    },
    VerifyPiece {
        id: TorrentId,
        index: PieceIndex,
        data: Vec<u8>,
        reply: tokio::sync::oneshot::Sender<bool>,
    },
    ReopenReadonly {
        id: TorrentId,
    },
    Shutdown,
}

/// A cheaply cloneable handle used by the rest of the engine to talk to the
/// disk task.
#[derive(Clone)]
pub(crate) struct DiskHandle {
    cmd_chan: mpsc::UnboundedSender<Command>,
}

impl DiskHandle {
    /// Allocates (or opens, for resumption) a torrent's on-disk storage.
    /// Returns the set of piece indices that already verify against the
    /// descriptor's hash list.
    pub async fn new_torrent(
        &self,
        id: TorrentId,
        info: StorageInfo,
        piece_hashes: Vec<Sha1Hash>,
    ) -> Result<std::collections::HashSet<PieceIndex>> {
        let (reply, recv) = tokio::sync::oneshot::channel();
        self.cmd_chan
            .send(Command::NewTorrent {
                id,
                info,
                piece_hashes,
                reply,
            })
            .map_err(|_| Error::ChannelClosed)?;
        recv.await
            .map_err(|_| Error::ChannelClosed)?
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))
    }

    /// Persists a verified, correctly-sized piece.
    pub async fn write_piece(
        &self,
        id: TorrentId,
        index: PieceIndex,
        data: Vec<u8>,
    ) -> Result<()> {
        let (reply, recv) = tokio::sync::oneshot::channel();
        self.cmd_chan
            .send(Command::WritePiece {
                id,
                index,
                data,
                reply,
            })
            .map_err(|_| Error::ChannelClosed)?;
        recv.await
            .map_err(|_| Error::ChannelClosed)?
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))
    }

    /// Reads `length` bytes starting at `begin` within piece `index`.
    pub async fn get_piece(
        &self,
        id: TorrentId,
        index: PieceIndex,
        begin: u32,
        length: u32,
    ) -> Result<Vec<u8>> {
        let (reply, recv) = tokio::sync::oneshot::channel();
        self.cmd_chan
            .send(Command::ReadPiece {
                id,
                index,
                begin,
                length,
                reply,
            })
            .map_err(|_| Error::ChannelClosed)?;
        recv.await
            .map_err(|_| Error::ChannelClosed)?
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))
    }

    /// Hashes `data` and compares it against the descriptor's hash for
    /// `index`.
    pub async fn verify_piece(
        &self,
        id: TorrentId,
        index: PieceIndex,
        data: Vec<u8>,
    ) -> Result<bool> {
        let (reply, recv) = tokio::sync::oneshot::channel();
        self.cmd_chan
            .send(Command::VerifyPiece {
                id,
                index,
                data,
                reply,
            })
            .map_err(|_| Error::ChannelClosed)?;
        recv.await.map_err(|_| Error::ChannelClosed)
    }

    /// Closes a completed torrent for writing and reopens its files
    /// read-only.
    pub fn reopen_readonly(&self, id: TorrentId) -> Result<()> {
        self.cmd_chan
            .send(Command::ReopenReadonly { id })
            .map_err(|_| Error::ChannelClosed)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.cmd_chan
            .send(Command::Shutdown)
            .map_err(|_| Error::ChannelClosed)
    }
}

/// The disk task itself: owns every torrent's file handles and runs the
/// command loop that serializes access to them.
pub(crate) struct Disk {
    torrents: HashMap<TorrentId, Arc<Torrent>>,
    cmd_port: mpsc::UnboundedReceiver<Command>,
}

impl Disk {
    /// Creates a new disk task and returns a handle to it.
    pub fn new() -> (Self, DiskHandle) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                torrents: HashMap::new(),
                cmd_port,
            },
            DiskHandle { cmd_chan },
        )
    }

    /// Runs the disk task's command loop until a [`Command::Shutdown`] is
    /// received or every sender has been dropped.
    pub async fn start(&mut self) {
        log::info!("starting disk IO event loop");
        while let Some(cmd) = self.cmd_port.recv().await {
            match cmd {
                Command::NewTorrent {
                    id,
                    info,
                    piece_hashes,
                    reply,
                } => {
                    let result = task::spawn_blocking(move || {
                        Torrent::new(info, piece_hashes)
                    })
                    .await
                    .expect("disk blocking task panicked");
                    match result {
                        Ok(torrent) => {
                            let torrent = Arc::new(torrent);
                            let scan_torrent = Arc::clone(&torrent);
                            let complete = task::spawn_blocking(move || {
                                scan_torrent.scan_existing_pieces()
                            })
                            .await
                            .expect("disk blocking task panicked");
                            self.torrents.insert(id, torrent);
                            let _ = reply.send(Ok(complete));
                        }
                        Err(e) => {
                            let _ = reply.send(Err(e));
                        }
                    }
                }
                Command::WritePiece {
                    id,
                    index,
                    data,
                    reply,
                } => {
                    let torrent = self.torrents.get(&id).cloned();
                    task::spawn(async move {
                        let result = match torrent {
                            Some(torrent) => {
                                task::spawn_blocking(move || {
                                    torrent.write_piece(index, &data)
                                })
                                .await
                                .expect("disk blocking task panicked")
                            }
                            None => Err(error::WriteError::InvalidPieceIndex),
                        };
                        let _ = reply.send(result);
                    });
                }
                Command::ReadPiece {
                    id,
                    index,
                    begin,
                    length,
                    reply,
                } => {
                    let torrent = self.torrents.get(&id).cloned();
                    task::spawn(async move {
                        let result = match torrent {
                            Some(torrent) => {
                                task::spawn_blocking(move || {
                                    torrent.get_piece(index, begin, length)
                                })
                                .await
                                .expect("disk blocking task panicked")
                            }
                            None => Err(error::ReadError::InvalidPieceIndex),
                        };
                        let _ = reply.send(result);
                    });
                }
                Command::VerifyPiece {
                    id,
                    index,
                    data,
                    reply,
                } => {
                    let torrent = self.torrents.get(&id).cloned();
                    task::spawn(async move {
                        let verified = match torrent {
                            Some(torrent) => {
                                task::spawn_blocking(move || {
                                    torrent.verify_piece(index, &data)
                                })
                                .await
                                .expect("disk blocking task panicked")
                            }
                            None => false,
                        };
                        let _ = reply.send(verified);
                    });
                }
                Command::ReopenReadonly { id } => {
                    if let Some(torrent) = self.torrents.get(&id).cloned() {
                        task::spawn_blocking(move || {
                            if let Err(e) = torrent.reopen_readonly() {
                                log::warn!(
                                    "failed to reopen torrent {} read-only: {}",
                                    id,
                                    e
                                );
                            }
                        });
                    }
                }
                Command::Shutdown => {
                    log::info!("shutting down disk IO event loop");
                    break;
                }
            }
        }
    }
}
