use std::path::Path;

use indicatif::ProgressBar;
use tracing::{debug, info};

pub mod metadata;
pub mod peer;
pub mod util;

pub use metadata::bencode::{BencodeError, BencodeValue};
pub use metadata::file::{TorrentError, TorrentFile};
pub use metadata::tracker::{AnnounceParams, TrackerResponse};
pub use peer::Bitfield;
pub use peer::downloader::{DownloadSession, SessionConfig};
pub use peer::message::Message;

pub fn parse_torrent<P: AsRef<Path>>(path: P) -> std::result::Result<TorrentFile, TorrentError> {
    TorrentFile::from_path(path)
}

/// Announces, then downloads and verifies piece `index` from the first peer the tracker returns.
///
/// `progress` is advanced once per received block.
pub async fn download_piece(
    torrent: TorrentFile,
    index: u32,
    peer_id: [u8; 20],
    port: u16,
    config: SessionConfig,
    progress: ProgressBar,
) -> std::result::Result<Vec<u8>, Box<dyn std::error::Error>> {
    let params = AnnounceParams::new(&torrent, peer_id, port);
    let response = metadata::tracker::discover_peers(&torrent, &params).await?;
    let peer = *response.peers.first().ok_or("tracker returned no peers")?;
    info!(%peer, index, "downloading piece from first peer");

    let mut session = DownloadSession::connect(peer, torrent, peer_id, config).await?;
    session.set_progress(progress);
    let piece = session.download_piece(index).await?;
    if let Err(e) = session.close().await {
        debug!(error = %e, "peer connection did not shut down cleanly");
    }
    Ok(piece)
}
