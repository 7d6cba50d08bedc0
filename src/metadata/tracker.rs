use core::fmt;
use std::net::SocketAddrV4;
use std::result::Result;

use percent_encoding::{NON_ALPHANUMERIC, percent_encode};
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::metadata::bencode::{self, BencodeError, BencodeValue};
use crate::metadata::file::TorrentFile;

/// Bytes per entry in a compact peer list: 4 for the IPv4 address, 2 for the port.
const COMPACT_PEER_LENGTH: usize = 6;

pub type Peer = SocketAddrV4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerResponse {
    pub interval: Option<u64>,
    pub peers: Vec<Peer>,
}

/// Query parameters sent with an announce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceParams {
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("announce url `{0}` is invalid")]
    InvalidAnnounceUrl(String),
    #[error("tracker request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("tracker response is invalid bencode data: {0}")]
    NonBencodedTrackerResponse(#[from] BencodeError),
    #[error("tracker response is not a bencoded dictionary")]
    TrackerResponseNotADictionary,
    #[error("tracker refused the announce: {0}")]
    Failure(String),
    #[error("tracker response missing peers key")]
    MissingPeers,
    #[error("tracker response peers list is not a byte string")]
    MalformedPeersList,
    #[error("peers list byte length ({0}) is not a multiple of 6")]
    InvalidPeerListLength(usize),
    #[error("tracker response interval is not a non-negative integer")]
    MalformedInterval,
}

const FAILURE_REASON: &[u8] = b"failure reason";
const INTERVAL: &[u8] = b"interval";
const PEERS: &[u8] = b"peers";

impl AnnounceParams {
    /// A fresh announce: nothing transferred yet, the whole file left.
    pub fn new(file: &TorrentFile, peer_id: [u8; 20], port: u16) -> Self {
        AnnounceParams { peer_id, port, uploaded: 0, downloaded: 0, left: file.info.length }
    }
}

/// Decodes a compact peer list, preserving tracker order.
pub fn parse_compact_peers(bytes: &[u8]) -> Result<Vec<Peer>, TrackerError> {
    if bytes.len() % COMPACT_PEER_LENGTH != 0 {
        return Err(TrackerError::InvalidPeerListLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(COMPACT_PEER_LENGTH)
        .map(|chunk| {
            let ip = [chunk[0], chunk[1], chunk[2], chunk[3]];
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddrV4::new(ip.into(), port)
        })
        .collect())
}

impl TryFrom<&BencodeValue> for TrackerResponse {
    type Error = TrackerError;

    fn try_from(value: &BencodeValue) -> Result<Self, TrackerError> {
        let items = value.as_dict().map_err(|_| TrackerError::TrackerResponseNotADictionary)?;
        if let Some(reason) = items.get(FAILURE_REASON) {
            return Err(TrackerError::Failure(reason.to_string()));
        }
        let interval = match items.get(INTERVAL) {
            Some(v) => {
                let seconds = v.as_integer().map_err(|_| TrackerError::MalformedInterval)?;
                Some(u64::try_from(seconds).map_err(|_| TrackerError::MalformedInterval)?)
            }
            None => None,
        };
        let peers = items
            .get(PEERS)
            .ok_or(TrackerError::MissingPeers)?
            .as_bytes()
            .map_err(|_| TrackerError::MalformedPeersList)?;
        Ok(TrackerResponse { interval, peers: parse_compact_peers(peers)? })
    }
}

impl fmt::Display for TrackerResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, socket) in self.peers.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{socket}")?;
        }
        Ok(())
    }
}

/// Builds the announce url; `info_hash` and `peer_id` are percent-encoded raw bytes.
pub fn announce_url(file: &TorrentFile, params: &AnnounceParams) -> Result<Url, TrackerError> {
    let mut url = Url::parse(file.announce())
        .map_err(|_| TrackerError::InvalidAnnounceUrl(file.announce().to_string()))?;

    url.query_pairs_mut()
        .append_pair("port", &params.port.to_string())
        .append_pair("uploaded", &params.uploaded.to_string())
        .append_pair("downloaded", &params.downloaded.to_string())
        .append_pair("left", &params.left.to_string())
        .append_pair("compact", "1");

    // query_pairs_mut would form-encode these as text, so they are appended by hand.
    let encoded_hash = percent_encode(&file.info_hash, NON_ALPHANUMERIC).to_string();
    let encoded_id = percent_encode(&params.peer_id, NON_ALPHANUMERIC).to_string();
    let query = format!("{}&info_hash={}&peer_id={}", url.query().unwrap_or_default(), encoded_hash, encoded_id);
    url.set_query(Some(&query));
    url.set_fragment(None);
    Ok(url)
}

pub async fn discover_peers(file: &TorrentFile, params: &AnnounceParams) -> Result<TrackerResponse, TrackerError> {
    discover_peers_with(&Client::new(), file, params).await
}

pub async fn discover_peers_with(
    client: &Client,
    file: &TorrentFile,
    params: &AnnounceParams,
) -> Result<TrackerResponse, TrackerError> {
    let url = announce_url(file, params)?;
    debug!(%url, "announcing to tracker");

    let response = client.get(url).send().await?.error_for_status()?;
    let response_bytes = response.bytes().await?;

    let bencoded_response = bencode::decode(&response_bytes)?;
    let tracker_response = TrackerResponse::try_from(&bencoded_response)?;
    info!(num_peers = tracker_response.peers.len(), interval = ?tracker_response.interval, "tracker responded");

    Ok(tracker_response)
}
