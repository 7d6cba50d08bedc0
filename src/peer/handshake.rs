use std::io;
use std::result::Result;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const HANDSHAKE_LENGTH: usize = 68;
const P_STR: &[u8] = b"BitTorrent protocol";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentHandshake {
    pub flags: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake failed: {0}")]
    Io(#[from] io::Error),
    #[error("handshake must be {HANDSHAKE_LENGTH} bytes, got {0}")]
    InvalidLength(usize),
    #[error("peer does not speak the BitTorrent protocol")]
    InvalidProtocol,
    #[error("peer answered for a different info hash")]
    MismatchedInfoHash,
}

impl TorrentHandshake {
    pub fn new(info_hash: &[u8; 20], peer_id: &[u8; 20]) -> Self {
        TorrentHandshake { flags: [0; 8], info_hash: *info_hash, peer_id: *peer_id }
    }
}

impl TryFrom<&[u8]> for TorrentHandshake {
    type Error = HandshakeError;

    fn try_from(bytes: &[u8]) -> Result<Self, HandshakeError> {
        if bytes.len() != HANDSHAKE_LENGTH {
            return Err(HandshakeError::InvalidLength(bytes.len()));
        }
        if bytes[0] as usize != P_STR.len() || &bytes[1..20] != P_STR {
            return Err(HandshakeError::InvalidProtocol);
        }
        let mut handshake = TorrentHandshake { flags: [0; 8], info_hash: [0; 20], peer_id: [0; 20] };
        handshake.flags.copy_from_slice(&bytes[20..28]);
        handshake.info_hash.copy_from_slice(&bytes[28..48]);
        handshake.peer_id.copy_from_slice(&bytes[48..68]);
        Ok(handshake)
    }
}

impl From<&TorrentHandshake> for [u8; HANDSHAKE_LENGTH] {
    fn from(handshake: &TorrentHandshake) -> [u8; HANDSHAKE_LENGTH] {
        let mut bytes = [0u8; HANDSHAKE_LENGTH];
        bytes[0] = P_STR.len() as u8;
        bytes[1..20].copy_from_slice(P_STR);
        bytes[20..28].copy_from_slice(&handshake.flags);
        bytes[28..48].copy_from_slice(&handshake.info_hash);
        bytes[48..68].copy_from_slice(&handshake.peer_id);
        bytes
    }
}

/// Exchanges handshakes and returns the remote peer id.
///
/// The remote id is informational and not checked; the echoed info hash is.
pub async fn handshake<S>(stream: &mut S, info_hash: &[u8; 20], peer_id: &[u8; 20]) -> Result<[u8; 20], HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mine = TorrentHandshake::new(info_hash, peer_id);
    stream.write_all(&<[u8; HANDSHAKE_LENGTH]>::from(&mine)).await?;
    stream.flush().await?;

    let mut buf = [0u8; HANDSHAKE_LENGTH];
    stream.read_exact(&mut buf).await?;
    let theirs = TorrentHandshake::try_from(buf.as_slice())?;
    if theirs.info_hash != mine.info_hash {
        return Err(HandshakeError::MismatchedInfoHash);
    }
    Ok(theirs.peer_id)
}
