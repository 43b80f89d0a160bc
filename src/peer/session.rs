//! The per-connection state machine: one task per peer, tying together the
//! wire codec, peer state, piece picker and file manager.

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use futures::{select, stream::SplitSink, SinkExt, StreamExt};
use rand::Rng;
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, RwLock},
    time,
};
use tokio_util::codec::{Framed, FramedParts};

/// The write half of a peer connection once split for the active loop,
/// letting the read half be polled in the `select!` loop independently.
type PeerSink = SplitSink<Framed<TcpStream, PeerCodec>, Message>;

use crate::{
    choke::ChokingManager,
    collab::BannedPeersDb,
    conf::SessionConf,
    disk::DiskHandle,
    error::*,
    peer::{
        codec::{Handshake, HandshakeCodec, Message, PeerCodec},
        state::{PeerState, State},
    },
    piece_picker::{GetBlockResult, PiecePicker},
    BlockInfo, PeerId, PieceIndex, Sha1Hash,
};

/// Commands the orchestrator may send to a live session.
pub(crate) enum Command {
    Shutdown,
}

/// State shared by every session of a single torrent.
pub(crate) struct TorrentShared {
    pub info_hash: Sha1Hash,
    pub client_id: PeerId,
    pub piece_count: usize,
    pub picker: Arc<RwLock<PiecePicker>>,
    pub disk: DiskHandle,
    pub torrent_id: crate::TorrentId,
    pub choke: Arc<ChokingManager>,
    pub conf: SessionConf,
    pub live_peers: Arc<RwLock<std::collections::HashSet<SocketAddr>>>,
    pub endgame_budget: std::sync::atomic::AtomicUsize,
    pub banned: Arc<dyn BannedPeersDb>,
    /// Command senders of every live session, keyed by peer address, so the
    /// persistence loop can disconnect a peer implicated in repeated piece
    /// corruption.
    pub session_cmds: RwLock<HashMap<SocketAddr, mpsc::UnboundedSender<Command>>>,
}

/// A single peer connection.
pub(crate) struct PeerSession {
    shared: Arc<TorrentShared>,
    addr: SocketAddr,
    peer_id: PeerId,
    peer: PeerState,
    cmd_port: mpsc::UnboundedReceiver<Command>,
    have_rx: broadcast::Receiver<PieceIndex>,
}

impl PeerSession {
    /// Creates a session for an outbound connection, registering its
    /// command channel so the orchestrator can later ask it to shut down.
    pub async fn outbound(
        addr: SocketAddr,
        shared: Arc<TorrentShared>,
    ) -> (Self, mpsc::UnboundedSender<Command>) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let have_rx = shared.picker.read().await.subscribe_haves();
        let peer = PeerState::new(addr, shared.piece_count);
        (
            Self {
                shared,
                addr,
                peer_id: [0; 20],
                peer,
                cmd_port,
                have_rx,
            },
            cmd_chan,
        )
    }

    /// Drives the session to completion: connect, handshake, greet, run the
    /// active loop, and always run the closing sequence on the way out.
    pub async fn run(mut self) {
        let result = self.run_inner().await;
        if let Err(e) = &result {
            log::info!("session with {} ending: {}", self.addr, e);
            if is_ban_worthy(e) {
                self.peer.dirty = true;
            }
        }
        self.close().await;
    }

    async fn run_inner(&mut self) -> Result<()> {
        self.peer.state = State::Connecting;
        log::info!("connecting to {}", self.addr);
        let socket = time::timeout(
            self.shared.conf.connect_timeout,
            TcpStream::connect(self.addr),
        )
        .await??;

        self.peer.state = State::Handshaking;
        let mut socket = Framed::new(socket, HandshakeCodec);
        let handshake = Handshake::new(self.shared.info_hash, self.shared.client_id);
        socket.send(handshake).await?;

        let peer_handshake = time::timeout(
            self.shared.conf.handshake_timeout,
            socket.next(),
        )
        .await?
        .ok_or(Error::ChannelClosed)??;
        if peer_handshake.info_hash != self.shared.info_hash {
            return Err(Error::InvalidPeerInfoHash);
        }
        self.peer_id = peer_handshake.peer_id;

        let parts = socket.into_parts();
        let mut parts = FramedParts::new(parts.io, PeerCodec);
        parts.read_buf = parts.read_buf;
        parts.write_buf = parts.write_buf;
        let mut socket = Framed::from_parts(parts);

        self.peer.state = State::Greeting;
        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();
        {
            let picker = self.shared.picker.read().await;
            sink.send(Message::Bitfield(picker.completion_bitfield())).await?;
        }
        sink.send(Message::Interested).await?;
        self.peer.is_interested = true;
        self.shared.live_peers.write().await.insert(self.addr);
        self.peer.state = State::Active;

        loop {
            let keepalive = time::sleep(self.shared.conf.keepalive_interval).fuse();
            futures::pin_mut!(keepalive);
            select! {
                msg = stream.select_next_some() => {
                    self.handle_msg(msg?, &mut sink).await?;
                }
                index = self.have_rx.recv().fuse() => {
                    if let Ok(index) = index {
                        sink.send(Message::Have(index as u32)).await?;
                    }
                }
                cmd = self.cmd_port.recv().fuse() => {
                    match cmd {
                        Some(Command::Shutdown) | None => return Ok(()),
                    }
                }
                _ = keepalive => {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "no message within keepalive window",
                    )));
                }
            }

            self.sync_choke_state(&mut sink).await?;
            self.run_request_pump(&mut sink).await?;
            self.serve_requests(&mut sink).await?;
        }
    }

    /// Brings our choke state for this peer in line with the choking
    /// manager's latest decision, sending a CHOKE/UNCHOKE if it changed.
    async fn sync_choke_state(&mut self, sink: &mut PeerSink) -> Result<()> {
        let should_unchoke = self.shared.choke.should_unchoke(&self.addr).await;
        if should_unchoke == self.peer.is_peer_choked {
            if should_unchoke {
                self.peer.is_peer_choked = false;
                sink.send(Message::Unchoke).await?;
            } else {
                self.peer.is_peer_choked = true;
                self.peer.outbound_queue.clear();
                self.peer.balance_counter = 0;
                sink.send(Message::Choke).await?;
            }
        }
        Ok(())
    }

    async fn handle_msg(
        &mut self,
        msg: Message,
        sink: &mut PeerSink,
    ) -> Result<()> {
        match msg {
            Message::KeepAlive => {}
            Message::Choke => {
                self.peer.is_choked = true;
                for block in self.peer.in_flight_requests.drain() {
                    self.shared.picker.write().await.deselect_block(block);
                }
                sink.send(Message::Interested).await?;
            }
            Message::Unchoke => {
                self.peer.is_choked = false;
            }
            Message::Interested => {
                self.peer.is_peer_interested = true;
                self.shared.choke.report_interested(self.addr).await;
            }
            Message::NotInterested => {
                self.peer.is_peer_interested = false;
                self.shared.choke.report_uninterested(self.addr).await;
            }
            Message::Have(index) => {
                let index = index as PieceIndex;
                if self.peer.is_seed {
                    return Err(Error::SeedSentHave);
                }
                if self.peer.set_have(index) {
                    self.shared.picker.write().await.change_availability(index, 1);
                }
            }
            Message::Bitfield(bits) => {
                if self.peer.state != State::Greeting && self.peer.state != State::Active
                {
                    return Err(Error::BitfieldNotAfterHandshake);
                }
                let piece_count = self.shared.piece_count;
                if bits.iter_ones().any(|i| i >= piece_count) {
                    return Err(Error::InvalidBitfield);
                }
                let mut picker = self.shared.picker.write().await;
                for i in bits.iter_ones() {
                    if self.peer.set_have(i) {
                        picker.change_availability(i, 1);
                    }
                }
            }
            Message::Request(info) => {
                if !self.peer.is_peer_choked && self.has_piece(info.piece_index).await {
                    if self.peer.outbound_queue.len() >= self.shared.conf.max_queued_requests {
                        return Err(Error::RequestQueueOverflow);
                    }
                    self.peer.outbound_queue.push_back(info);
                }
            }
            Message::Cancel(info) => {
                self.peer.outbound_queue.retain(|b| *b != info);
            }
            Message::Block { info, data } => {
                self.handle_block(info, data).await?;
            }
        }
        Ok(())
    }

    async fn has_piece(&self, index: PieceIndex) -> bool {
        use crate::piece_picker::PieceState;
        self.shared.picker.read().await.status(index) == PieceState::Complete
    }

    async fn handle_block(&mut self, info: BlockInfo, data: Vec<u8>) -> Result<()> {
        // a cancel was already sent for this block (another peer delivered
        // it first); this arrival raced the cancel, shrink back down
        // instead of treating it as a protocol violation or re-reporting
        // already-complete data to the picker.
        if self.peer.is_endgame && self.peer.endgame_cancelled.remove(&info) {
            self.peer.endgame_requested.remove(&info);
            self.peer.pipeline_size = self.peer.pipeline_size.saturating_sub(1);
            self.shared
                .endgame_budget
                .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            return Ok(());
        }

        let was_tracked = if self.peer.is_endgame {
            self.peer.endgame_requested.remove(&info)
        } else {
            self.peer.in_flight_requests.remove(&info)
        };
        if !was_tracked {
            return Err(Error::UnexpectedBlock);
        }

        self.peer.balance_counter += 1;
        let endgame_budget = self
            .shared
            .endgame_budget
            .load(std::sync::atomic::Ordering::SeqCst);
        self.peer
            .update_pipeline_size(data.len() as u64, &self.shared.conf, endgame_budget);

        let result = self
            .shared
            .picker
            .write()
            .await
            .report_block(info, &data, self.addr);
        match result {
            Ok(()) => Ok(()),
            // the piece this block belonged to already completed via
            // another peer's delivery and was dropped from the picker's
            // downloading set before our own CANCEL caught up with this
            // one; harmless in endgame, suppress rather than disconnect.
            Err(Error::UnknownDownloadingPiece(_)) if self.peer.is_endgame => {
                self.peer.pipeline_size = self.peer.pipeline_size.saturating_sub(1);
                self.shared
                    .endgame_budget
                    .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn run_request_pump(
        &mut self,
        sink: &mut PeerSink,
    ) -> Result<()> {
        if self.peer.is_choked {
            return Ok(());
        }

        if !self.peer.is_endgame {
            while self.peer.in_flight_requests.len() < self.peer.pipeline_size {
                let result = self
                    .shared
                    .picker
                    .write()
                    .await
                    .get_block(&self.peer.bitfield, self.addr);
                match result {
                    GetBlockResult::Block(block) => {
                        sink.send(Message::Request(block)).await?;
                        self.peer.in_flight_requests.insert(block);
                        time::sleep(self.shared.conf.request_pump_yield).await;
                    }
                    GetBlockResult::Endgame => {
                        self.peer.is_endgame = true;
                        break;
                    }
                    GetBlockResult::None => break,
                }
            }
        }

        if self.peer.is_endgame {
            self.run_endgame_pump(sink).await?;
        }

        Ok(())
    }

    async fn run_endgame_pump(
        &mut self,
        sink: &mut PeerSink,
    ) -> Result<()> {
        let candidates = {
            let picker = self.shared.picker.read().await;
            let mut candidates: Vec<BlockInfo> = picker
                .endgame_candidates(&self.peer.bitfield)
                .into_iter()
                .filter(|b| {
                    !self.peer.endgame_requested.contains(b)
                        && !self.peer.in_flight_requests.contains(b)
                })
                .collect();
            // reseed from the peer's own identity so jitter is
            // reproducible per-peer without biasing overall availability,
            // matching the source's endgame tie-break convention.
            use rand::SeedableRng;
            let seed = self.addr.port() as u64;
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
            candidates.sort_by(|a, b| {
                let score_a = picker.peer_count(a.piece_index) as f64 + rng.gen::<f64>();
                let score_b = picker.peer_count(b.piece_index) as f64 + rng.gen::<f64>();
                score_b.partial_cmp(&score_a).unwrap()
            });
            candidates
        };

        for block in candidates {
            sink.send(Message::Request(block)).await?;
            self.peer.endgame_requested.insert(block);
            time::sleep(self.shared.conf.endgame_request_pump_yield).await;
        }

        let need_cancel: Vec<BlockInfo> = {
            let picker = self.shared.picker.read().await;
            self.peer
                .endgame_requested
                .iter()
                .filter(|b| {
                    !self.peer.endgame_cancelled.contains(b) && !picker.is_block_outstanding(b)
                })
                .copied()
                .collect()
        };
        for block in need_cancel {
            sink.send(Message::Cancel(block)).await?;
            self.peer.endgame_cancelled.insert(block);
            self.peer.pipeline_size += 1;
            self.shared
                .endgame_budget
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }

        Ok(())
    }

    /// Tit-for-tat serving: each accepted PIECE buys one served request.
    async fn serve_requests(
        &mut self,
        sink: &mut PeerSink,
    ) -> Result<()> {
        while self.peer.balance_counter > 0 {
            let info = match self.peer.outbound_queue.pop_front() {
                Some(info) => info,
                None => break,
            };
            let data = self
                .shared
                .disk
                .get_piece(self.shared.torrent_id, info.piece_index, info.offset, info.len)
                .await?;
            sink
                .send(Message::Block { info, data })
                .await?;
            self.peer.balance_counter -= 1;
        }
        Ok(())
    }

    /// Always run on any exit path: close the transport, deregister,
    /// declare uninterested, return in-flight blocks, and fix up
    /// availability counts.
    async fn close(&mut self) {
        if self.peer.dirty {
            log::warn!("banning {} for a protocol violation", self.addr);
            self.shared.banned.insert_ip(self.addr.ip());
        }

        self.shared.live_peers.write().await.remove(&self.addr);
        self.shared.session_cmds.write().await.remove(&self.addr);
        self.shared.choke.report_uninterested(self.addr).await;

        let mut picker = self.shared.picker.write().await;
        for block in self.peer.in_flight_requests.drain() {
            picker.deselect_block(block);
        }
        // decrement for every bit the peer ever advertised, endgame or not:
        // availability was incremented unconditionally in handle_msg, so it
        // must be reversed unconditionally here too.
        for i in self.peer.bitfield.iter_ones() {
            picker.change_availability(i, -1);
        }
    }
}

/// Whether a session-ending error reflects a protocol violation severe
/// enough to ban the peer's IP, as opposed to an ordinary transport error
/// (reset, EOF, timeout) which carries no penalty.
fn is_ban_worthy(e: &Error) -> bool {
    matches!(
        e,
        Error::RequestQueueOverflow
            | Error::SeedSentHave
            | Error::BitfieldNotAfterHandshake
            | Error::InvalidBitfield
            | Error::UnexpectedBlock
            | Error::InvalidBlockInfo
            | Error::InvalidMessageId(_)
            | Error::MessageTooLarge { .. }
    )
}
