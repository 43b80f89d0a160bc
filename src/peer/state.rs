//! Per-peer state: connection flags, availability, pipeline sizing and
//! endgame bookkeeping, owned exclusively by that peer's session.

use std::{
    collections::HashSet,
    net::SocketAddr,
    time::Instant,
};

use crate::{conf::SessionConf, counter::ThroughputCounter, Bitfield, BlockInfo, PeerId};

/// Connection state machine states (spec §4.E).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum State {
    Connecting,
    Handshaking,
    Greeting,
    Active,
    Closing,
}

/// Per-peer connection state.
pub(crate) struct PeerState {
    pub addr: SocketAddr,
    pub peer_id: Option<PeerId>,
    pub state: State,

    /// If the peer is choking us, we don't expect to receive blocks.
    pub is_choked: bool,
    /// If we're interested, the peer has pieces that we don't have.
    pub is_interested: bool,
    /// If we're choking the peer, we don't serve their requests.
    pub is_peer_choked: bool,
    /// If the peer is interested in us, they mean to download from us.
    pub is_peer_interested: bool,

    pub bitfield: Bitfield,
    pub is_seed: bool,

    pub pipeline_size: usize,
    pub in_flight_requests: HashSet<BlockInfo>,

    pub is_endgame: bool,
    pub endgame_requested: HashSet<BlockInfo>,
    pub endgame_cancelled: HashSet<BlockInfo>,

    /// Requests the remote peer has sent us, not yet served.
    pub outbound_queue: std::collections::VecDeque<BlockInfo>,
    /// Incremented for each PIECE we accept, decremented as we serve
    /// requests in kind (tit-for-tat balance).
    pub balance_counter: usize,

    pub last_message_at: Instant,
    pub rate: ThroughputCounter,

    /// Set once the session must be torn down (protocol violation, ban).
    pub dirty: bool,
}

impl PeerState {
    pub fn new(addr: SocketAddr, piece_count: usize) -> Self {
        Self {
            addr,
            peer_id: None,
            state: State::Connecting,
            is_choked: true,
            is_interested: false,
            is_peer_choked: true,
            is_peer_interested: false,
            bitfield: Bitfield::repeat(false, piece_count),
            is_seed: false,
            pipeline_size: 4,
            in_flight_requests: HashSet::new(),
            is_endgame: false,
            endgame_requested: HashSet::new(),
            endgame_cancelled: HashSet::new(),
            outbound_queue: std::collections::VecDeque::new(),
            balance_counter: 0,
            last_message_at: Instant::now(),
            rate: ThroughputCounter::new(),
            dirty: false,
        }
    }

    /// Sets bit `i` in the peer's bitfield and, if every bit is now set,
    /// marks the peer a seed. Returns whether the bit was newly set.
    pub fn set_have(&mut self, i: usize) -> bool {
        if i >= self.bitfield.len() {
            return false;
        }
        let was_set = self.bitfield[i];
        self.bitfield.set(i, true);
        if self.bitfield.all() {
            self.is_seed = true;
        }
        !was_set
    }

    /// Applies the pipeline-size heuristic (spec §4.D) after a PIECE
    /// arrives.
    ///
    /// `dt` below `50 ms` is ignored (the previous pipeline size is kept)
    /// since such a short interval makes for an unstable rate sample.
    pub fn update_pipeline_size(
        &mut self,
        bytes: u64,
        conf: &SessionConf,
        endgame_budget: usize,
    ) {
        self.rate.update(bytes);
        let rate = self.rate.tick();
        if self.is_endgame {
            self.pipeline_size =
                (rate + 2.0).min(endgame_budget as f64) as usize;
        } else {
            let size = if rate < 20.0 {
                rate + 2.0
            } else {
                rate / 5.0 + 18.0
            };
            self.pipeline_size = (size as usize)
                .max(conf.min_pipeline_size)
                .min(conf.max_pipeline_size);
        }
    }
}
