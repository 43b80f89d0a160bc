use std::{
    fs::{self, OpenOptions},
    os::unix::io::AsRawFd,
    path::Path,
    sync::Mutex,
};

use lru::LruCache;
use nix::sys::uio::{pread, pwritev};
use sha1::{Digest, Sha1};

use crate::{
    block_count, block_len,
    disk::error::*,
    iovecs::IoVecs,
    storage_info::{sanitize_path_component, FsStructure, StorageInfo},
    FileInfo, PieceIndex, Sha1Hash,
};

/// A single file backing part (or all) of a torrent's download.
struct TorrentFile {
    info: FileInfo,
    handle: std::fs::File,
}

impl TorrentFile {
    /// Performs a single positioned vectored write, returning the number of
    /// bytes actually written (may be short).
    fn write_vectored_at(
        &self,
        iovecs: &IoVecs<'_>,
        offset: u64,
    ) -> std::io::Result<usize> {
        let bufs = iovecs.buffers();
        pwritev(self.handle.as_raw_fd(), &bufs, offset as i64)
            .map_err(nix_to_io_error)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        pread(self.handle.as_raw_fd(), buf, offset as i64).map_err(nix_to_io_error)
    }
}

fn nix_to_io_error(e: nix::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, e)
}

/// Disk IO statistics, reported by the orchestrator for diagnostics.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Stats {
    pub write_count: u64,
    pub write_failure_count: u64,
    pub read_count: u64,
    pub read_failure_count: u64,
}

/// A cached piece read, keyed by index, so repeated block requests within
/// the same piece don't each cause a disk read.
struct CachedPiece {
    data: Vec<u8>,
}

/// Owns a torrent's file handles and mediates all reads/writes to them.
///
/// Positioned vectored reads/writes run on a blocking-task thread pool (the
/// caller is expected to invoke [`Torrent::write_piece`]/[`Torrent::get_piece`]
/// from within `tokio::task::spawn_blocking`), so hashing and disk IO never
/// stall the peer sessions' executor.
pub(crate) struct Torrent {
    info: StorageInfo,
    files: Vec<Mutex<TorrentFile>>,
    piece_hashes: Vec<Sha1Hash>,
    read_cache: Mutex<LruCache<PieceIndex, CachedPiece>>,
    stats: Mutex<Stats>,
    read_only: std::sync::atomic::AtomicBool,
}

const READ_CACHE_CAPACITY: usize = 32;

impl Torrent {
    /// Creates the torrent's on-disk directory structure and opens (or
    /// creates) every backing file, sanitizing every path component taken
    /// from the metainfo.
    pub fn new(
        info: StorageInfo,
        piece_hashes: Vec<Sha1Hash>,
    ) -> NewTorrentResult<Self> {
        let files = match &info.structure {
            FsStructure::File(file) => {
                let path =
                    info.download_dir.join(sanitize_path_component(
                        &file.path.to_string_lossy(),
                    ));
                log::debug!(
                    "torrent is a single {} byte file at {:?}",
                    file.len,
                    path
                );
                let opened = open_file(&path)?;
                vec![Mutex::new(TorrentFile {
                    info: FileInfo {
                        path,
                        len: file.len,
                        torrent_offset: file.torrent_offset,
                    },
                    handle: opened.handle,
                })]
            }
            FsStructure::Archive { files } => {
                debug_assert!(!files.is_empty());
                log::debug!("torrent is multi-file: {} files", files.len());
                fs::create_dir_all(&info.download_dir)?;
                let mut handles = Vec::with_capacity(files.len());
                for file in files {
                    let sanitized: std::path::PathBuf = file
                        .path
                        .components()
                        .map(|c| sanitize_path_component(
                            &c.as_os_str().to_string_lossy(),
                        ))
                        .collect();
                    let path = info.download_dir.join(&sanitized);
                    if let Some(subdir) = path.parent() {
                        if !subdir.exists() {
                            fs::create_dir_all(subdir)?;
                        }
                    }
                    let opened = open_file(&path)?;
                    handles.push(Mutex::new(TorrentFile {
                        info: FileInfo {
                            path,
                            len: file.len,
                            torrent_offset: file.torrent_offset,
                        },
                        handle: opened.handle,
                    }));
                }
                handles
            }
        };

        Ok(Self {
            info,
            files,
            piece_hashes,
            read_cache: Mutex::new(LruCache::new(READ_CACHE_CAPACITY)),
            stats: Mutex::new(Stats::default()),
            read_only: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Writes a verified, correctly-sized piece to disk, decomposing the
    /// write across every file it spans.
    pub fn write_piece(
        &self,
        index: PieceIndex,
        data: &[u8],
    ) -> WriteResult<()> {
        let file_range = self
            .info
            .files_intersecting_piece(index)
            .map_err(|_| WriteError::InvalidPieceIndex)?;
        let piece_offset = self.info.torrent_piece_offset(index);

        let mut iovecs = IoVecs::unbounded(std::iter::once(data));
        let mut torrent_offset = piece_offset;
        for file_index in file_range {
            let file = self.files[file_index].lock().unwrap();
            let file_slice = file.info.get_slice(torrent_offset, iovecs.len());
            let write_len = file_slice.len.min(iovecs.len());
            let (head, tail) = iovecs.into_tail(write_len);
            let n = file
                .write_vectored_at(&head, file_slice.offset)
                .map_err(WriteError::Io)?;
            if n as u64 != write_len {
                return Err(WriteError::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "short vectored write",
                )));
            }
            torrent_offset += write_len;
            iovecs = tail;
        }

        let mut stats = self.stats.lock().unwrap();
        stats.write_count += 1;
        drop(stats);

        self.read_cache.lock().unwrap().put(
            index,
            CachedPiece {
                data: data.to_vec(),
            },
        );

        Ok(())
    }

    /// Reads `length` bytes starting at `begin` within piece `index`,
    /// serving from the read cache when possible.
    pub fn get_piece(
        &self,
        index: PieceIndex,
        begin: u32,
        length: u32,
    ) -> ReadResult<Vec<u8>> {
        if let Some(cached) = self.read_cache.lock().unwrap().get(&index) {
            let start = begin as usize;
            let end = (start + length as usize).min(cached.data.len());
            return Ok(cached.data[start..end].to_vec());
        }

        let piece_len = self
            .info
            .piece_len(index)
            .map_err(|_| ReadError::InvalidPieceIndex)?;
        let mut buf = vec![0u8; piece_len as usize];
        self.read_piece_into(index, &mut buf)?;

        let mut stats = self.stats.lock().unwrap();
        stats.read_count += 1;
        drop(stats);

        let start = begin as usize;
        let end = (start + length as usize).min(buf.len());
        let result = buf[start..end].to_vec();
        self.read_cache
            .lock()
            .unwrap()
            .put(index, CachedPiece { data: buf });
        Ok(result)
    }

    fn read_piece_into(
        &self,
        index: PieceIndex,
        buf: &mut [u8],
    ) -> ReadResult<()> {
        let file_range = self
            .info
            .files_intersecting_piece(index)
            .map_err(|_| ReadError::InvalidPieceIndex)?;
        let piece_offset = self.info.torrent_piece_offset(index);

        let mut written = 0usize;
        let mut torrent_offset = piece_offset;
        for file_index in file_range {
            let file = self.files[file_index].lock().unwrap();
            let slice = file
                .info
                .get_slice(torrent_offset, (buf.len() - written) as u64);
            let chunk = &mut buf[written..written + slice.len as usize];
            let n = file.read_at(chunk, slice.offset).map_err(ReadError::Io)?;
            // a short read past the end of an existing file is padded with
            // zero bytes (only possible on a truncated final piece during
            // resumption).
            for b in &mut chunk[n..] {
                *b = 0;
            }
            written += slice.len as usize;
            torrent_offset += slice.len;
        }
        Ok(())
    }

    /// Scans whatever bytes already exist on disk for every piece and
    /// returns the indices whose hash already verifies, used to
    /// pre-populate the completion bitmap before any peer connects.
    pub fn scan_existing_pieces(&self) -> std::collections::HashSet<PieceIndex> {
        let mut complete = std::collections::HashSet::new();
        for index in 0..self.info.piece_count {
            let piece_len = match self.info.piece_len(index) {
                Ok(len) => len,
                Err(_) => continue,
            };
            let mut buf = vec![0u8; piece_len as usize];
            if self.read_piece_into(index, &mut buf).is_err() {
                continue;
            }
            let mut hasher = Sha1::new();
            hasher.update(&buf);
            let digest: Sha1Hash = hasher.finalize().into();
            if Some(&digest) == self.piece_hashes.get(index) {
                complete.insert(index);
            }
        }
        log::info!(
            "resumption scan found {} of {} pieces already complete",
            complete.len(),
            self.info.piece_count
        );
        complete
    }

    /// Verifies a completed piece's hash against the descriptor.
    pub fn verify_piece(&self, index: PieceIndex, data: &[u8]) -> bool {
        debug_assert_eq!(data.len(), block_len_sum(&self.info, index));
        let mut hasher = Sha1::new();
        hasher.update(data);
        let digest: Sha1Hash = hasher.finalize().into();
        Some(&digest) == self.piece_hashes.get(index)
    }

    /// Closes the torrent for writing and reopens every file read-only,
    /// handing off to a seeding collaborator.
    pub fn reopen_readonly(&self) -> std::io::Result<()> {
        self.read_only
            .store(true, std::sync::atomic::Ordering::SeqCst);
        for file in &self.files {
            let mut file = file.lock().unwrap();
            file.handle = OpenOptions::new().read(true).open(&file.info.path)?;
        }
        Ok(())
    }

    pub fn stats(&self) -> Stats {
        *self.stats.lock().unwrap()
    }
}

fn block_len_sum(info: &StorageInfo, index: PieceIndex) -> usize {
    let piece_len = info.piece_len(index).unwrap_or(0);
    (0..block_count(piece_len))
        .map(|i| block_len(piece_len, i) as usize)
        .sum()
}

fn open_file(path: &Path) -> std::io::Result<TorrentFile> {
    let handle = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)?;
    Ok(TorrentFile {
        info: FileInfo {
            path: path.to_path_buf(),
            len: 0,
            torrent_offset: 0,
        },
        handle,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn single_file_storage(dir: &Path, len: u64, piece_len: u32) -> StorageInfo {
        let piece_count = ((len + piece_len as u64 - 1) / piece_len as u64) as usize;
        let last_piece_len = (len - piece_len as u64 * (piece_count as u64 - 1)) as u32;
        StorageInfo {
            piece_count,
            piece_len,
            last_piece_len,
            download_len: len,
            download_dir: dir.to_path_buf(),
            structure: FsStructure::File(FileInfo {
                path: PathBuf::from("payload.bin"),
                len,
                torrent_offset: 0,
            }),
        }
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let tmp = std::env::temp_dir().join(format!(
            "torrent-core-test-{}",
            std::process::id()
        ));
        fs::create_dir_all(&tmp).unwrap();
        let storage = single_file_storage(&tmp, 32, 16);
        let hashes = vec![[0u8; 20]; 2];
        let torrent = Torrent::new(storage, hashes).unwrap();

        let piece = vec![7u8; 16];
        torrent.write_piece(0, &piece).unwrap();
        let read_back = torrent.get_piece(0, 0, 16).unwrap();
        assert_eq!(read_back, piece);

        fs::remove_dir_all(&tmp).ok();
    }
}
