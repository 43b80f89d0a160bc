//! The global coordinator that decides which block to request from which
//! peer, tracks per-piece availability, owns the set of in-flight and failed
//! blocks, and flips the swarm into endgame mode near completion.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
};

use rand::{rngs::StdRng, seq::IteratorRandom, SeedableRng};
use tokio::sync::{broadcast, mpsc};

use crate::{
    download::{DownloadingPiece, FailedPiece},
    error::*,
    storage_info::StorageInfo,
    Bitfield, BlockInfo, PieceIndex,
};

/// A piece's completion status as tracked by the picker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PieceState {
    Missing,
    Downloading,
    Complete,
}

/// One entry per piece index.
#[derive(Clone, Debug)]
pub(crate) struct PieceMapEntry {
    pub status: PieceState,
    pub peer_count: u32,
}

/// The outcome of asking the picker for the next block to request.
#[derive(Debug)]
pub(crate) enum GetBlockResult {
    /// Request this block next.
    Block(BlockInfo),
    /// The peer has nothing we need right now.
    None,
    /// The swarm just entered (or already is in) endgame mode; this is the
    /// first time this particular peer has been told. The session should
    /// switch to endgame sampling via [`PiecePicker::endgame_candidates`].
    Endgame,
}

/// A fully assembled, hash-verified-pending piece handed to the persistence
/// loop via the results queue.
#[derive(Debug)]
pub(crate) struct CompletedPiece {
    pub index: PieceIndex,
    pub data: Vec<u8>,
    pub responders: HashMap<BlockInfo, SocketAddr>,
}

/// The global piece picker, shared behind a lock by every peer session of a
/// torrent.
pub(crate) struct PiecePicker {
    storage: Arc<StorageInfo>,
    map: Vec<PieceMapEntry>,
    downloading: HashMap<PieceIndex, DownloadingPiece>,
    failed: HashMap<PieceIndex, FailedPiece>,
    num_pieces_left: usize,
    endgame: bool,
    endgame_threshold: usize,
    endgame_notified: HashSet<SocketAddr>,
    results_tx: mpsc::UnboundedSender<CompletedPiece>,
    have_tx: broadcast::Sender<PieceIndex>,
}

impl PiecePicker {
    /// Creates a picker with every piece `Missing`, optionally seeding
    /// pieces already verified by a resumption scan as `Complete`.
    pub fn new(
        storage: Arc<StorageInfo>,
        endgame_threshold: usize,
        already_complete: &HashSet<PieceIndex>,
    ) -> (Self, mpsc::UnboundedReceiver<CompletedPiece>) {
        let map = (0..storage.piece_count)
            .map(|i| PieceMapEntry {
                status: if already_complete.contains(&i) {
                    PieceState::Complete
                } else {
                    PieceState::Missing
                },
                peer_count: 0,
            })
            .collect();
        let num_pieces_left = storage.piece_count - already_complete.len();
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let (have_tx, _) = broadcast::channel(256.max(storage.piece_count));
        (
            Self {
                storage,
                map,
                downloading: HashMap::new(),
                failed: HashMap::new(),
                num_pieces_left,
                endgame: false,
                endgame_threshold,
                endgame_notified: HashSet::new(),
                results_tx,
                have_tx,
            },
            results_rx,
        )
    }

    /// Subscribes to HAVE notifications broadcast whenever a piece
    /// completes.
    pub fn subscribe_haves(&self) -> broadcast::Receiver<PieceIndex> {
        self.have_tx.subscribe()
    }

    pub fn num_pieces_left(&self) -> usize {
        self.num_pieces_left
    }

    pub fn is_complete(&self) -> bool {
        self.num_pieces_left == 0
    }

    /// Increments `peer_count[i]` for every set bit in a peer's initial
    /// bitfield.
    pub fn add_peer_bitfield(&mut self, bitfield: &Bitfield) {
        for i in bitfield.iter_ones() {
            if let Some(entry) = self.map.get_mut(i) {
                entry.peer_count += 1;
            }
        }
        self.maybe_enter_endgame();
    }

    /// Applies a `+1`/`-1` availability delta for a single piece, on HAVE
    /// (`+1`) or peer disconnect (`-1` per previously-held bit).
    pub fn change_availability(&mut self, index: PieceIndex, delta: i32) {
        if let Some(entry) = self.map.get_mut(index) {
            if delta >= 0 {
                entry.peer_count += delta as u32;
            } else {
                entry.peer_count = entry.peer_count.saturating_sub((-delta) as u32);
            }
        }
        if delta > 0 {
            self.maybe_enter_endgame();
        }
    }

    fn maybe_enter_endgame(&mut self) {
        if !self.endgame && self.num_pieces_left <= self.endgame_threshold {
            log::info!(
                "entering endgame mode, {} pieces left",
                self.num_pieces_left
            );
            self.endgame = true;
        }
    }

    pub fn is_endgame(&self) -> bool {
        self.endgame
    }

    /// Returns the next block to request from a peer advertising
    /// `peer_bitfield`, or signals endgame transition, honoring the
    /// selection policy: prefer continuing an in-progress piece, else
    /// rarest-first with random tie-break among Missing pieces.
    pub fn get_block(
        &mut self,
        peer_bitfield: &Bitfield,
        peer: SocketAddr,
    ) -> GetBlockResult {
        if self.endgame {
            if self.endgame_notified.insert(peer) {
                return GetBlockResult::Endgame;
            }
            return GetBlockResult::None;
        }

        // 1. continue an already-downloading piece the peer has.
        for (&index, piece) in self.downloading.iter_mut() {
            if has_bit(peer_bitfield, index) {
                if let Some(block) = piece.pick_block(peer) {
                    return GetBlockResult::Block(block);
                }
            }
        }

        // 2. rarest-first among Missing pieces the peer advertises.
        let candidate = self
            .map
            .iter()
            .enumerate()
            .filter(|(i, entry)| {
                entry.status == PieceState::Missing && has_bit(peer_bitfield, *i)
            })
            .min_by_key(|(_, entry)| entry.peer_count)
            .map(|(i, entry)| (i, entry.peer_count));

        let rarest_count = match candidate {
            Some((_, count)) => count,
            None => return GetBlockResult::None,
        };

        let mut rng = StdRng::from_entropy();
        let chosen = self
            .map
            .iter()
            .enumerate()
            .filter(|(i, entry)| {
                entry.status == PieceState::Missing
                    && entry.peer_count == rarest_count
                    && has_bit(peer_bitfield, *i)
            })
            .map(|(i, _)| i)
            .choose(&mut rng);

        let index = match chosen {
            Some(i) => i,
            None => return GetBlockResult::None,
        };

        let piece_len = match self.storage.piece_len(index) {
            Ok(len) => len,
            Err(_) => return GetBlockResult::None,
        };
        self.map[index].status = PieceState::Downloading;
        let mut piece = DownloadingPiece::new(index, piece_len);
        let block = piece.pick_block(peer);
        self.downloading.insert(index, piece);
        match block {
            Some(block) => GetBlockResult::Block(block),
            None => GetBlockResult::None,
        }
    }

    /// Returns every unselected or in-flight block of every peer-advertised
    /// downloading piece, used by the session's endgame sampling.
    pub fn endgame_candidates(
        &self,
        peer_bitfield: &Bitfield,
    ) -> HashSet<BlockInfo> {
        let mut out = HashSet::new();
        for (&index, piece) in self.downloading.iter() {
            if has_bit(peer_bitfield, index) {
                out.extend(piece.outstanding_blocks());
            }
        }
        out
    }

    pub fn peer_count(&self, index: PieceIndex) -> u32 {
        self.map.get(index).map(|e| e.peer_count).unwrap_or(0)
    }

    /// Whether `block` has not yet been received from any peer. Used by a
    /// session's endgame pump to tell which of its own still-outstanding
    /// endgame requests were satisfied by a racing peer and can be
    /// cancelled.
    pub fn is_block_outstanding(&self, block: &BlockInfo) -> bool {
        self.downloading
            .get(&block.piece_index)
            .map(|piece| piece.outstanding_blocks().contains(block))
            .unwrap_or(false)
    }

    /// Returns an in-flight block to the unselected pool. Called on peer
    /// teardown for every block still in that peer's in-flight set.
    pub fn deselect_block(&mut self, block: BlockInfo) {
        if let Some(piece) = self.downloading.get_mut(&block.piece_index) {
            piece.deselect_block(block);
        }
    }

    /// Records a received block; when the owning piece becomes complete,
    /// pushes it onto the results queue for the persistence loop.
    pub fn report_block(
        &mut self,
        block: BlockInfo,
        data: &[u8],
        peer: SocketAddr,
    ) -> Result<()> {
        let piece = self
            .downloading
            .get_mut(&block.piece_index)
            .ok_or(Error::UnknownDownloadingPiece(block.piece_index))?;
        piece.receive_block(block, data, peer)?;
        if piece.is_complete() {
            let piece = self
                .downloading
                .remove(&block.piece_index)
                .expect("piece just checked complete");
            let (data, responders) = piece.into_parts();
            let completed = CompletedPiece {
                index: block.piece_index,
                data,
                responders,
            };
            self.results_tx.send(completed).map_err(|_| Error::ChannelClosed)?;
        }
        Ok(())
    }

    /// Re-enqueues a hash-mismatched piece, keeping history for ban
    /// detection. Returns the peers implicated once at least two failed
    /// attempts' responders intersect.
    pub fn add_failed_piece(
        &mut self,
        index: PieceIndex,
        responders: HashSet<SocketAddr>,
    ) -> Option<HashSet<SocketAddr>> {
        self.map[index].status = PieceState::Missing;
        let bad_peers = match self.failed.get_mut(&index) {
            Some(failed) => {
                failed.record_attempt(responders);
                failed.bad_peers()
            }
            None => {
                self.failed.insert(index, FailedPiece::new(index, responders));
                None
            }
        };
        bad_peers
    }

    /// Marks a piece `Complete`, decrements `num_pieces_left`, and
    /// broadcasts a HAVE to every live peer session.
    pub fn mark_complete_and_announce(&mut self, index: PieceIndex) {
        self.map[index].status = PieceState::Complete;
        self.failed.remove(&index);
        self.num_pieces_left -= 1;
        self.maybe_enter_endgame();
        // an unreceived broadcast (no subscribers yet) is not an error.
        let _ = self.have_tx.send(index);
    }

    pub fn status(&self, index: PieceIndex) -> PieceState {
        self.map[index].status
    }

    /// Returns the completion bitmap, used to build our outgoing BITFIELD
    /// message in the greeting state.
    pub fn completion_bitfield(&self) -> Bitfield {
        self.map
            .iter()
            .map(|e| e.status == PieceState::Complete)
            .collect()
    }
}

/// Returns whether bit `i` is set in `bitfield`, treating an out-of-range
/// index as unset rather than panicking.
fn has_bit(bitfield: &Bitfield, i: usize) -> bool {
    i < bitfield.len() && bitfield[i]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_info::{FileInfo, FsStructure};
    use std::path::PathBuf;

    fn storage(piece_count: usize, piece_len: u32) -> Arc<StorageInfo> {
        let download_len = piece_len as u64 * piece_count as u64;
        Arc::new(StorageInfo {
            piece_count,
            piece_len,
            last_piece_len: piece_len,
            download_len,
            download_dir: PathBuf::from("/tmp"),
            structure: FsStructure::File(FileInfo {
                path: PathBuf::from("f"),
                len: download_len,
                torrent_offset: 0,
            }),
        })
    }

    fn full_bitfield(n: usize) -> Bitfield {
        (0..n).map(|_| true).collect()
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn test_rarest_first_selection() {
        let (mut picker, _rx) = PiecePicker::new(
            storage(4, crate::BLOCK_LEN),
            0,
            &HashSet::new(),
        );
        // piece 2 is rarer than the rest
        for i in 0..4 {
            picker.change_availability(i, if i == 2 { 1 } else { 3 });
        }
        let bf = full_bitfield(4);
        match picker.get_block(&bf, addr(1)) {
            GetBlockResult::Block(block) => assert_eq!(block.piece_index, 2),
            other => panic!("expected a block, got {:?}", other),
        }
    }

    #[test]
    fn test_continues_in_progress_piece_before_picking_new() {
        let (mut picker, _rx) =
            PiecePicker::new(storage(2, 2 * crate::BLOCK_LEN), 0, &HashSet::new());
        let bf = full_bitfield(2);
        let first = match picker.get_block(&bf, addr(1)) {
            GetBlockResult::Block(b) => b,
            other => panic!("expected a block, got {:?}", other),
        };
        // second pick from the same peer should continue piece 0, not start
        // piece 1, since piece 0 still has unselected blocks
        match picker.get_block(&bf, addr(1)) {
            GetBlockResult::Block(b) => {
                assert_eq!(b.piece_index, first.piece_index)
            }
            other => panic!("expected a block, got {:?}", other),
        }
    }

    #[test]
    fn test_endgame_signalled_once_per_peer() {
        let (mut picker, _rx) =
            PiecePicker::new(storage(1, crate::BLOCK_LEN), 1, &HashSet::new());
        let bf = full_bitfield(1);
        assert!(matches!(
            picker.get_block(&bf, addr(1)),
            GetBlockResult::Endgame
        ));
        assert!(matches!(
            picker.get_block(&bf, addr(1)),
            GetBlockResult::None
        ));
        assert!(matches!(
            picker.get_block(&bf, addr(2)),
            GetBlockResult::Endgame
        ));
    }

    #[test]
    fn test_report_block_completes_piece_and_queues_result() {
        let (mut picker, mut rx) =
            PiecePicker::new(storage(1, crate::BLOCK_LEN), 0, &HashSet::new());
        let bf = full_bitfield(1);
        let block = match picker.get_block(&bf, addr(1)) {
            GetBlockResult::Block(b) => b,
            other => panic!("expected a block, got {:?}", other),
        };
        picker
            .report_block(block, &vec![0u8; block.len as usize], addr(1))
            .unwrap();
        let completed = rx.try_recv().expect("piece should be queued");
        assert_eq!(completed.index, 0);
    }
}
