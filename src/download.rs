//! Per-piece block bookkeeping owned exclusively by the piece picker.
//!
//! A [`DownloadingPiece`] tracks which blocks of a piece are still
//! unselected, which are in flight (and to whom they were assigned), and
//! which responder supplied each received block. When a piece fails its
//! hash check it is downgraded to a [`FailedPiece`], which keeps just
//! enough of that history to attribute the corruption to a peer once a
//! second failure's responder set overlaps with the first.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
};

use crate::{block_count, block_len, BlockInfo, PieceIndex};

/// A piece whose blocks are being actively requested.
#[derive(Debug)]
pub(crate) struct DownloadingPiece {
    pub index: PieceIndex,
    /// The nominal length of this piece (`P`, or `L_last` for the last
    /// piece).
    pub expected_len: u32,
    /// Dense byte buffer the size of `expected_len`, filled in as blocks
    /// arrive.
    buf: Vec<u8>,
    /// Blocks not yet requested from any peer.
    unselected: HashSet<BlockInfo>,
    /// Blocks currently requested, keyed by the peer they were requested
    /// from.
    in_flight: HashMap<BlockInfo, SocketAddr>,
    /// Blocks that have arrived, along with which peer supplied them.
    received_from: HashMap<BlockInfo, SocketAddr>,
}

impl DownloadingPiece {
    /// Creates a new downloading piece with every block unselected.
    pub fn new(index: PieceIndex, piece_len: u32) -> Self {
        let mut unselected = HashSet::new();
        for i in 0..block_count(piece_len) {
            let offset = i as u32 * crate::BLOCK_LEN;
            let len = block_len(piece_len, i);
            unselected.insert(BlockInfo {
                piece_index: index,
                offset,
                len,
            });
        }
        Self {
            index,
            expected_len: piece_len,
            buf: vec![0; piece_len as usize],
            unselected,
            in_flight: HashMap::new(),
            received_from: HashMap::new(),
        }
    }

    /// Picks an arbitrary still-unselected block, marking it in-flight to
    /// `peer`. Returns `None` if every block has already been selected.
    pub fn pick_block(&mut self, peer: SocketAddr) -> Option<BlockInfo> {
        let block = *self.unselected.iter().next()?;
        self.unselected.remove(&block);
        self.in_flight.insert(block, peer);
        Some(block)
    }

    /// Returns an in-flight block back to the unselected pool. Called on
    /// peer teardown.
    pub fn deselect_block(&mut self, block: BlockInfo) {
        if self.in_flight.remove(&block).is_some() {
            self.unselected.insert(block);
        }
    }

    /// Records a received block from `peer`, copying its payload into the
    /// piece's assembled buffer.
    ///
    /// Returns an error if the block doesn't tile within the piece, or was
    /// never requested.
    pub fn receive_block(
        &mut self,
        block: BlockInfo,
        data: &[u8],
        peer: SocketAddr,
    ) -> crate::error::Result<()> {
        if block.offset as usize + block.len as usize > self.buf.len()
            || data.len() != block.len as usize
        {
            return Err(crate::error::Error::InvalidBlockInfo);
        }
        self.in_flight.remove(&block);
        self.unselected.remove(&block);
        let start = block.offset as usize;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.received_from.insert(block, peer);
        Ok(())
    }

    /// A piece is complete once every block has arrived: `unselected` and
    /// `in_flight` are both empty, and the received count matches the total
    /// block count.
    pub fn is_complete(&self) -> bool {
        self.unselected.is_empty()
            && self.in_flight.is_empty()
            && self.received_from.len() == block_count(self.expected_len)
    }

    /// Returns the assembled piece data.
    ///
    /// # Panics
    ///
    /// Panics if the piece isn't complete yet.
    pub fn data(&self) -> &[u8] {
        assert!(self.is_complete(), "piece is not yet complete");
        &self.buf
    }

    /// Consumes the piece, returning its data and the responder map, used
    /// when handing the piece off to the persistence loop or downgrading it
    /// to a [`FailedPiece`].
    pub fn into_parts(self) -> (Vec<u8>, HashMap<BlockInfo, SocketAddr>) {
        (self.buf, self.received_from)
    }

    /// Every peer address that contributed at least one block to this
    /// piece so far.
    pub fn responders(&self) -> HashSet<SocketAddr> {
        self.received_from.values().copied().collect()
    }

    /// Every block not yet received: unselected plus in-flight. Used by
    /// endgame sampling to find blocks still worth racing for.
    pub fn outstanding_blocks(&self) -> HashSet<BlockInfo> {
        self.unselected
            .iter()
            .copied()
            .chain(self.in_flight.keys().copied())
            .collect()
    }
}

/// A snapshot of a [`DownloadingPiece`] taken after a hash mismatch,
/// retaining the per-block responder map so that repeated failures across
/// distinct peer sets can attribute corruption.
#[derive(Debug)]
pub(crate) struct FailedPiece {
    pub index: PieceIndex,
    /// One entry per failed attempt; each entry is the set of peers that
    /// supplied at least one block in that attempt.
    attempts: Vec<HashSet<SocketAddr>>,
}

impl FailedPiece {
    /// Starts a new failure history for `index` with the first failed
    /// attempt's responders.
    pub fn new(index: PieceIndex, responders: HashSet<SocketAddr>) -> Self {
        Self {
            index,
            attempts: vec![responders],
        }
    }

    /// Appends another failed attempt's responders to the history.
    pub fn record_attempt(&mut self, responders: HashSet<SocketAddr>) {
        self.attempts.push(responders);
    }

    /// Returns the peers implicated by the intersection of responders
    /// across all failed attempts so far, or `None` if fewer than two
    /// attempts have failed (the intersection isn't meaningful with a
    /// single data point).
    pub fn bad_peers(&self) -> Option<HashSet<SocketAddr>> {
        if self.attempts.len() < 2 {
            return None;
        }
        let mut iter = self.attempts.iter();
        let first = iter.next()?.clone();
        Some(iter.fold(first, |acc, set| {
            acc.intersection(set).copied().collect()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn test_pick_and_complete() {
        let mut piece = DownloadingPiece::new(0, crate::BLOCK_LEN);
        assert!(!piece.is_complete());
        let block = piece.pick_block(addr(1)).unwrap();
        assert!(piece.pick_block(addr(1)).is_none());
        piece
            .receive_block(block, &vec![0u8; block.len as usize], addr(1))
            .unwrap();
        assert!(piece.is_complete());
        assert_eq!(piece.data().len(), crate::BLOCK_LEN as usize);
    }

    #[test]
    fn test_deselect_returns_block_to_pool() {
        let mut piece = DownloadingPiece::new(0, crate::BLOCK_LEN);
        let block = piece.pick_block(addr(1)).unwrap();
        piece.deselect_block(block);
        // block is selectable again
        assert_eq!(piece.pick_block(addr(2)), Some(block));
    }

    #[test]
    fn test_bad_peers_requires_two_attempts() {
        let mut peers1 = HashSet::new();
        peers1.insert(addr(1));
        peers1.insert(addr(2));
        let mut failed = FailedPiece::new(0, peers1);
        assert_eq!(failed.bad_peers(), None);

        let mut peers2 = HashSet::new();
        peers2.insert(addr(2));
        peers2.insert(addr(3));
        failed.record_attempt(peers2);

        let mut expected = HashSet::new();
        expected.insert(addr(2));
        assert_eq!(failed.bad_peers(), Some(expected));
    }
}
