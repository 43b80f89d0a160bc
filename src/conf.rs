//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use crate::PeerId;

/// The default client id this engine announces to trackers and other peers.
pub const CLIENT_ID: &PeerId = b"cbt-0000000000000000";

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user. It uses the default client id, [`CLIENT_ID`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: *CLIENT_ID,
            },
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents by
/// default, but individual torrents may override this configuration.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,

    /// The minimum number of peers we want to keep in torrent at all times.
    /// This will be configurable later.
    pub min_requested_peer_count: usize,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// If the tracker doesn't provide a minimum announce interval, we default
    /// to announcing every 30 seconds.
    pub announce_interval: Duration,

    /// After this many attempts, the torrent stops announcing to a tracker.
    pub tracker_error_threshold: usize,

    /// Per-connection session tuning (pipeline bounds, timeouts, endgame).
    pub session: SessionConf,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // We always request at least 10 peers as anything less is a waste
            // of network round trip and it allows us to buffer up a bit more
            // than needed.
            min_requested_peer_count: 10,
            // This value is mostly picked for performance while keeping in mind
            // not to overwhelm the host.
            max_connected_peer_count: 50,
            // needs testing
            announce_interval: Duration::from_secs(60 * 60),
            // needs testing
            tracker_error_threshold: 15,
            session: SessionConf::default(),
        }
    }
}

/// Tuning knobs for an individual peer session's state machine.
///
/// These mirror the numeric constants named throughout the protocol design
/// rather than being hardcoded in `peer::session`, so an embedding
/// application (or a test) can tighten or loosen them without touching the
/// state machine itself.
#[derive(Clone, Copy, Debug)]
pub struct SessionConf {
    /// Lower bound of the non-endgame pipeline size (request queue length),
    /// regardless of what the rate heuristic computes.
    pub min_pipeline_size: usize,
    /// Upper bound of the non-endgame pipeline size.
    pub max_pipeline_size: usize,
    /// The request queue length we start a session with, before we have a
    /// rate sample to compute a pipeline size from.
    pub initial_pipeline_size: usize,
    /// Initial per-peer and global endgame request budget. Grows
    /// independently of the non-endgame ceiling as duplicate blocks get
    /// cancelled.
    pub initial_endgame_budget: usize,
    /// The maximum number of unfulfilled peer requests we queue before
    /// banning the peer as a suspected denial-of-service attempt.
    pub max_queued_requests: usize,
    /// Endgame activates once the number of not-yet-complete pieces drops to
    /// this many (or fewer). Clamped at runtime to be no larger than
    /// `ceil(max_pipeline_size / blocks_per_piece)` so a torrent with very
    /// few, very large pieces doesn't get an outsized duplicate-request
    /// storm.
    pub endgame_piece_threshold: usize,
    /// How long we wait for the TCP handshake to complete.
    pub handshake_timeout: Duration,
    /// How long we wait for the TCP connection to establish.
    pub connect_timeout: Duration,
    /// If a message read makes no progress for this long, the peer is
    /// considered dead and the session is torn down.
    pub keepalive_interval: Duration,
    /// Cooperative yield between non-endgame requests in the pump, letting
    /// other sessions make progress on the single-threaded executor.
    pub request_pump_yield: Duration,
    /// Cooperative yield between endgame requests; longer than the
    /// non-endgame yield since endgame duplicates are intentional and
    /// shouldn't be encouraged to race too eagerly.
    pub endgame_request_pump_yield: Duration,
}

impl Default for SessionConf {
    fn default() -> Self {
        Self {
            min_pipeline_size: 2,
            max_pipeline_size: 64,
            initial_pipeline_size: 4,
            initial_endgame_budget: 5,
            max_queued_requests: 500,
            endgame_piece_threshold: 1,
            handshake_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(3),
            // 2x the de facto 60s keepalive interval peers use.
            keepalive_interval: Duration::from_secs(120),
            request_pump_yield: Duration::from_millis(10),
            endgame_request_pump_yield: Duration::from_millis(100),
        }
    }
}
