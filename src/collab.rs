//! External collaborator interfaces the core consults but does not own:
//! ban persistence and completed-torrent bookkeeping are an embedding
//! application's concern (see the external interfaces named in the design
//! this core follows), but an in-memory default is provided so the engine
//! runs standalone without one.

use std::{collections::HashSet, net::IpAddr, sync::RwLock};

use crate::{PeerId, Sha1Hash, TorrentId};

/// Persistent ban list consulted before dialing a peer and appended to on
/// a confirmed protocol violation.
pub trait BannedPeersDb: Send + Sync {
    fn contains(&self, ip: &IpAddr) -> bool;
    fn insert_ip(&self, ip: IpAddr);
}

/// Notified once, when a torrent's data is fully verified on disk.
pub trait CompletedTorrentsDb: Send + Sync {
    fn insert(&self, id: TorrentId, info_hash: Sha1Hash);
}

/// An in-process ban list, sufficient for a single run of the engine.
#[derive(Default)]
pub struct InMemoryBanList {
    banned: RwLock<HashSet<IpAddr>>,
}

impl BannedPeersDb for InMemoryBanList {
    fn contains(&self, ip: &IpAddr) -> bool {
        self.banned.read().unwrap().contains(ip)
    }

    fn insert_ip(&self, ip: IpAddr) {
        self.banned.write().unwrap().insert(ip);
    }
}

/// An in-process completed-torrents record, sufficient for a single run of
/// the engine.
#[derive(Default)]
pub struct InMemoryCompletedTorrents {
    completed: RwLock<HashSet<TorrentId>>,
}

impl CompletedTorrentsDb for InMemoryCompletedTorrents {
    fn insert(&self, id: TorrentId, _info_hash: Sha1Hash) {
        self.completed.write().unwrap().insert(id);
    }
}

/// Identifies a peer's client from the Azureus-style `-XX1234-` prefix of
/// its peer id, falling back to "Unknown" for anything else.
pub fn identify_client(peer_id: &PeerId) -> String {
    if peer_id[0] != b'-' || peer_id[7] != b'-' {
        return "Unknown".to_owned();
    }
    match std::str::from_utf8(&peer_id[1..3]).unwrap_or("??") {
        "qB" => "qBittorrent".to_owned(),
        "UT" => "uTorrent".to_owned(),
        "TR" => "Transmission".to_owned(),
        "DE" => "Deluge".to_owned(),
        "LT" => "libtorrent".to_owned(),
        "AZ" => "Azureus".to_owned(),
        other => format!("Unknown({})", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ban_list_roundtrip() {
        let bans = InMemoryBanList::default();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(!bans.contains(&ip));
        bans.insert_ip(ip);
        assert!(bans.contains(&ip));
    }

    #[test]
    fn test_identify_client_prefix() {
        let mut id = [0u8; 20];
        id[0] = b'-';
        id[1] = b'q';
        id[2] = b'B';
        id[7] = b'-';
        assert_eq!(identify_client(&id), "qBittorrent");
    }

    #[test]
    fn test_identify_client_unknown_shape() {
        let id = [0u8; 20];
        assert_eq!(identify_client(&id), "Unknown");
    }
}
