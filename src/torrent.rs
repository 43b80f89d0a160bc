//! Per-torrent orchestration: allocates storage through the File Manager,
//! owns the piece picker and choking manager shared by every peer session,
//! connects peers, and runs the persistence loop that verifies and writes
//! completed pieces (spec component F).

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{atomic::AtomicUsize, Arc},
    time::Duration,
};

use tokio::sync::{mpsc, oneshot, RwLock};

use crate::{
    block_count,
    choke::ChokingManager,
    collab::{BannedPeersDb, CompletedTorrentsDb},
    conf::TorrentConf,
    disk::DiskHandle,
    error::*,
    metainfo::Metainfo,
    peer::{Command, PeerSession, TorrentShared},
    piece_picker::PiecePicker,
    storage_info::StorageInfo,
    PeerId, TorrentId,
};

/// The only two conditions this crate ever surfaces to an embedding
/// application about a torrent's overall progress (spec §7's propagation
/// policy): individual session and piece failures never escape this far.
#[derive(Debug)]
pub(crate) enum TorrentStatus {
    Completed,
    Unrecoverable(Error),
}

/// A handle used by the engine to drive a running torrent: connect peers
/// and await its terminal status.
pub(crate) struct TorrentHandle {
    pub(crate) shared: Arc<TorrentShared>,
    pub(crate) done: oneshot::Receiver<TorrentStatus>,
}

impl TorrentHandle {
    /// Dials an outbound peer and spawns its session, unless the address is
    /// banned or already connected.
    pub async fn connect_peer(&self, addr: SocketAddr) {
        connect_peer(&self.shared, addr).await;
    }

    /// Waits for the torrent to finish, successfully or not.
    pub async fn completion(self) -> TorrentStatus {
        self.done
            .await
            .unwrap_or_else(|_| TorrentStatus::Unrecoverable(Error::ChannelClosed))
    }
}

/// Dials an outbound peer and spawns its session, unless the address is
/// banned or already connected. Free function so the engine can drive a
/// torrent by its shared state alone, without holding a `TorrentHandle`.
pub(crate) async fn connect_peer(shared: &Arc<TorrentShared>, addr: SocketAddr) {
    if shared.banned.contains(&addr.ip()) {
        log::info!("refusing to dial banned peer {}", addr);
        return;
    }
    if shared.live_peers.read().await.contains(&addr) {
        return;
    }
    let (session, cmd_tx) = PeerSession::outbound(addr, Arc::clone(shared)).await;
    shared.session_cmds.write().await.insert(addr, cmd_tx);
    tokio::spawn(session.run());
}

/// Allocates a torrent's storage, starts its background tasks (persistence
/// loop, choking ticker) and returns a handle to it.
pub(crate) async fn start(
    id: TorrentId,
    metainfo: &Metainfo,
    conf: TorrentConf,
    client_id: PeerId,
    disk: DiskHandle,
    banned: Arc<dyn BannedPeersDb>,
    completed_db: Arc<dyn CompletedTorrentsDb>,
) -> Result<TorrentHandle> {
    let info_hash = metainfo
        .create_info_hash()
        .map_err(|_| Error::InvalidMetainfo)?;
    let storage = StorageInfo::new(metainfo, conf.download_dir.clone());
    let piece_count = storage.piece_count;
    let piece_hashes = metainfo.piece_hashes();
    log::info!(
        "starting torrent {} ({} pieces, {} bytes)",
        id,
        piece_count,
        storage.download_len
    );

    let already_complete = disk
        .new_torrent(id, storage.clone(), piece_hashes.clone())
        .await?;

    // floor the endgame threshold at 1 so a torrent doesn't sit forever
    // just short of completion waiting on a single slow peer, and cap it so
    // duplicate traffic during endgame stays bounded by the pipeline
    // ceiling regardless of how many peers remain connected.
    let blocks_per_piece = block_count(storage.piece_len).max(1);
    let endgame_threshold = conf
        .session
        .endgame_piece_threshold
        .max(1)
        .min((conf.session.max_pipeline_size + blocks_per_piece - 1) / blocks_per_piece);

    let (picker, results_rx) =
        PiecePicker::new(Arc::new(storage), endgame_threshold, &already_complete);
    let picker = Arc::new(RwLock::new(picker));

    let choke = Arc::new(ChokingManager::new(conf.max_connected_peer_count));

    let shared = Arc::new(TorrentShared {
        info_hash,
        client_id,
        piece_count,
        picker: Arc::clone(&picker),
        disk: disk.clone(),
        torrent_id: id,
        choke: Arc::clone(&choke),
        conf: conf.session,
        live_peers: Arc::new(RwLock::new(std::collections::HashSet::new())),
        endgame_budget: AtomicUsize::new(conf.session.initial_endgame_budget),
        banned,
        session_cmds: RwLock::new(HashMap::new()),
    });

    let (done_tx, done_rx) = oneshot::channel();

    tokio::spawn(run_persistence_loop(
        Arc::clone(&shared),
        results_rx,
        completed_db,
        done_tx,
    ));
    tokio::spawn(run_choke_ticker(Arc::clone(&choke)));

    Ok(TorrentHandle {
        shared,
        done: done_rx,
    })
}

/// Consumes the piece picker's completed-piece queue: verifies, persists,
/// and announces each piece, banning and disconnecting peers implicated in
/// repeated corruption, until the torrent completes or disk IO fails
/// fatally.
async fn run_persistence_loop(
    shared: Arc<TorrentShared>,
    mut results_rx: mpsc::UnboundedReceiver<crate::piece_picker::CompletedPiece>,
    completed_db: Arc<dyn CompletedTorrentsDb>,
    done_tx: oneshot::Sender<TorrentStatus>,
) {
    let mut corrupted_bytes: u64 = 0;

    let status = loop {
        let completed = match results_rx.recv().await {
            Some(c) => c,
            None => break TorrentStatus::Unrecoverable(Error::ChannelClosed),
        };

        let verified = match shared
            .disk
            .verify_piece(shared.torrent_id, completed.index, completed.data.clone())
            .await
        {
            Ok(v) => v,
            Err(e) => {
                log::error!("disk verify failed for torrent {}: {}", shared.torrent_id, e);
                break TorrentStatus::Unrecoverable(e);
            }
        };

        if !verified {
            corrupted_bytes += completed.data.len() as u64;
            log::warn!(
                "piece {} failed hash verification ({} bytes corrupted so far)",
                completed.index,
                corrupted_bytes
            );
            let responders: std::collections::HashSet<SocketAddr> =
                completed.responders.values().copied().collect();
            let bad_peers = shared
                .picker
                .write()
                .await
                .add_failed_piece(completed.index, responders);
            if let Some(bad_peers) = bad_peers {
                for addr in bad_peers {
                    log::warn!(
                        "banning {} for repeated corruption of piece {}",
                        addr,
                        completed.index
                    );
                    shared.banned.insert_ip(addr.ip());
                    if let Some(cmd_tx) = shared.session_cmds.read().await.get(&addr) {
                        let _ = cmd_tx.send(Command::Shutdown);
                    }
                }
            }
            continue;
        }

        if let Err(e) = shared
            .disk
            .write_piece(shared.torrent_id, completed.index, completed.data)
            .await
        {
            log::error!("disk write failed for torrent {}: {}", shared.torrent_id, e);
            break TorrentStatus::Unrecoverable(e);
        }

        let is_complete = {
            let mut picker = shared.picker.write().await;
            picker.mark_complete_and_announce(completed.index);
            picker.is_complete()
        };

        if is_complete {
            log::info!("torrent {} complete, reopening read-only", shared.torrent_id);
            if let Err(e) = shared.disk.reopen_readonly(shared.torrent_id) {
                log::error!("failed to reopen torrent {} read-only: {}", shared.torrent_id, e);
            }
            completed_db.insert(shared.torrent_id, shared.info_hash);
            break TorrentStatus::Completed;
        }
    };

    let _ = done_tx.send(status);
}

/// Periodically re-runs the unchoke policy so a policy that rotates slots
/// over time (unlike the default FIFO policy) gets the chance to.
async fn run_choke_ticker(choke: Arc<ChokingManager>) {
    let mut interval = tokio::time::interval(Duration::from_secs(10));
    loop {
        interval.tick().await;
        choke.tick().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_torrent_status_is_debuggable() {
        let status = TorrentStatus::Completed;
        assert_eq!(format!("{:?}", status), "Completed");
    }
}
