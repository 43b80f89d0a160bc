//! The top-level orchestrator (component G): owns the File Manager's disk
//! task and every running torrent, assigns each a randomly chosen id unique
//! within this engine, and funnels each torrent's terminal status back to
//! the embedding application. Tracker communication, peer discovery, and
//! everything else named as an external collaborator in the design this
//! engine implements are the caller's responsibility; this type only drives
//! the three in-scope parts (wire protocol, piece picker, file manager)
//! across as many torrents and peers as are added to it.

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use rand::Rng;
use tokio::sync::mpsc;

use crate::{
    collab::{BannedPeersDb, CompletedTorrentsDb, InMemoryBanList, InMemoryCompletedTorrents},
    conf::Conf,
    disk::{Disk, DiskHandle},
    error::{Error, Result},
    metainfo::Metainfo,
    peer::TorrentShared,
    torrent::{self, TorrentStatus},
    TorrentId,
};

/// The terminal outcome of a torrent. Per the propagation policy this core
/// follows, this is the only thing ever surfaced about a torrent's fate:
/// individual session failures and retried piece corruption never escape
/// this far.
#[derive(Debug)]
pub enum TorrentOutcome {
    Completed,
    Unrecoverable(Error),
}

impl From<TorrentStatus> for TorrentOutcome {
    fn from(status: TorrentStatus) -> Self {
        match status {
            TorrentStatus::Completed => Self::Completed,
            TorrentStatus::Unrecoverable(e) => Self::Unrecoverable(e),
        }
    }
}

/// A terminal status event for one of the engine's torrents, returned from
/// [`Engine::next_event`].
#[derive(Debug)]
pub struct TorrentEvent {
    pub id: TorrentId,
    pub outcome: TorrentOutcome,
}

/// Drives every torrent added to it plus the shared disk task.
///
/// The engine is the only public entry point into the core: an embedding
/// application constructs one, adds torrents to it, connects peers to them
/// (however it discovers their addresses, e.g. via a tracker client it owns
/// itself), and polls [`Engine::next_event`] for completion or failure.
pub struct Engine {
    conf: Conf,
    disk: DiskHandle,
    banned: Arc<dyn BannedPeersDb>,
    completed_db: Arc<dyn CompletedTorrentsDb>,
    torrents: HashMap<TorrentId, Arc<TorrentShared>>,
    events_tx: mpsc::UnboundedSender<TorrentEvent>,
    events_rx: mpsc::UnboundedReceiver<TorrentEvent>,
}

impl Engine {
    /// Starts the engine: spawns the disk task and returns a handle with no
    /// torrents running yet. Uses in-memory defaults for the ban list and
    /// completed-torrents record; see [`Engine::with_collaborators`] to
    /// supply persistent ones.
    pub fn new(conf: Conf) -> Self {
        Self::with_collaborators(
            conf,
            Arc::new(InMemoryBanList::default()),
            Arc::new(InMemoryCompletedTorrents::default()),
        )
    }

    /// Like [`Engine::new`], but with caller-supplied ban list and
    /// completed-torrents collaborators (e.g. backed by a real database).
    pub fn with_collaborators(
        conf: Conf,
        banned: Arc<dyn BannedPeersDb>,
        completed_db: Arc<dyn CompletedTorrentsDb>,
    ) -> Self {
        let (mut disk_task, disk) = Disk::new();
        tokio::spawn(async move { disk_task.start().await });
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            conf,
            disk,
            banned,
            completed_db,
            torrents: HashMap::new(),
            events_tx,
            events_rx,
        }
    }

    /// Allocates storage for `metainfo` under this engine's configured
    /// download directory, starts the torrent's background tasks, and
    /// returns the randomly assigned id by which it's addressed from now
    /// on. Per-torrent config defaults to the engine's, but the caller may
    /// override it.
    pub async fn add_torrent(&mut self, metainfo: &Metainfo) -> Result<TorrentId> {
        self.add_torrent_with_conf(metainfo, self.conf.torrent.clone())
            .await
    }

    /// Like [`Engine::add_torrent`], but with an explicit per-torrent
    /// configuration instead of the engine's default.
    pub async fn add_torrent_with_conf(
        &mut self,
        metainfo: &Metainfo,
        torrent_conf: crate::conf::TorrentConf,
    ) -> Result<TorrentId> {
        let id = self.next_torrent_id();
        let handle = torrent::start(
            id,
            metainfo,
            torrent_conf,
            self.conf.engine.client_id,
            self.disk.clone(),
            Arc::clone(&self.banned),
            Arc::clone(&self.completed_db),
        )
        .await?;

        self.torrents.insert(id, Arc::clone(&handle.shared));

        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let outcome = handle.completion().await.into();
            // the receiver only goes away when the engine itself is
            // dropped, in which case there's nowhere left to report to
            let _ = events_tx.send(TorrentEvent { id, outcome });
        });

        Ok(id)
    }

    /// Dials an outbound peer for the given torrent, unless it's banned or
    /// already connected. No-op if `id` doesn't name a running torrent.
    pub async fn connect_peer(&self, id: TorrentId, addr: SocketAddr) {
        if let Some(shared) = self.torrents.get(&id) {
            torrent::connect_peer(shared, addr).await;
        }
    }

    /// Awaits the next torrent to reach a terminal state. Returns `None`
    /// once every torrent ever added has reported and no more can arrive
    /// (only possible if the engine is dropped mid-await elsewhere).
    pub async fn next_event(&mut self) -> Option<TorrentEvent> {
        self.events_rx.recv().await
    }

    /// Shuts down the shared disk task. Running torrents' sessions are left
    /// to wind down on their own; call this only once they're done.
    pub fn shutdown(&self) -> Result<()> {
        self.disk.shutdown()
    }

    fn next_torrent_id(&self) -> TorrentId {
        let mut rng = rand::thread_rng();
        loop {
            let id: TorrentId = rng.gen();
            if !self.torrents.contains_key(&id) {
                return id;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_torrent_outcome_from_status() {
        assert!(matches!(
            TorrentOutcome::from(TorrentStatus::Completed),
            TorrentOutcome::Completed
        ));
        assert!(matches!(
            TorrentOutcome::from(TorrentStatus::Unrecoverable(Error::ChannelClosed)),
            TorrentOutcome::Unrecoverable(Error::ChannelClosed)
        ));
    }
}
