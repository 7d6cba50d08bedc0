use std::net::SocketAddrV4;
use std::time::Duration;

use indicatif::ProgressBar;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::metadata::file::{TorrentError, TorrentFile};
use crate::peer::Bitfield;
use crate::peer::handshake::{HandshakeError, handshake};
use crate::peer::message::{Message, MessageError, MessageId, wait_for};
use crate::util::sha1::sha1_hash;

pub const DEFAULT_BLOCK_SIZE: u32 = 16 * 1024;

/// A byte range of one piece, the unit of request and response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub piece_index: u32,
    pub begin: u32,
    pub length: u32,
}

/// Assembly buffer for a single piece.
#[derive(Debug)]
pub struct PieceBuffer {
    index: u32,
    block_size: u32,
    data: Vec<u8>,
    received: Vec<bool>,
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("block at offset {begin} with {length} bytes does not fit in a piece of {piece_length} bytes")]
    BlockOutOfRange { begin: u32, length: usize, piece_length: usize },
    #[error("piece {index} is missing blocks")]
    IncompletePiece { index: u32 },
    #[error("piece {index} failed hash verification")]
    PieceHashMismatch { index: u32 },
    #[error("piece of {0} bytes is too large to request")]
    PieceTooLarge(u64),
}

impl PieceBuffer {
    pub fn new(index: u32, length: u32, block_size: u32) -> Self {
        let block_size = block_size.max(1);
        let num_blocks = length.div_ceil(block_size) as usize;
        PieceBuffer { index, block_size, data: vec![0; length as usize], received: vec![false; num_blocks] }
    }

    /// Blocks covering the piece in order; the last one holds the remainder.
    pub fn blocks(&self) -> impl Iterator<Item = Block> + '_ {
        let length = self.data.len() as u32;
        (0..self.received.len() as u32).map(move |i| {
            let begin = i * self.block_size;
            Block { piece_index: self.index, begin, length: self.block_size.min(length - begin) }
        })
    }

    /// Copies `bytes` in at `begin`, marking every block it fully covers as received.
    pub fn write_block(&mut self, begin: u32, bytes: &[u8]) -> std::result::Result<(), DownloadError> {
        let start = begin as usize;
        let end = start.checked_add(bytes.len()).filter(|&end| end <= self.data.len()).ok_or(
            DownloadError::BlockOutOfRange { begin, length: bytes.len(), piece_length: self.data.len() },
        )?;
        self.data[start..end].copy_from_slice(bytes);

        let block_size = self.block_size as usize;
        for (i, received) in self.received.iter_mut().enumerate() {
            let block_start = i * block_size;
            let block_end = (block_start + block_size).min(self.data.len());
            if start <= block_start && block_end <= end {
                *received = true;
            }
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.received.iter().all(|&r| r)
    }

    /// Hands the piece over if every block arrived and its SHA-1 matches.
    pub fn verify(self, expected: &[u8; 20]) -> std::result::Result<Vec<u8>, DownloadError> {
        if !self.is_complete() {
            return Err(DownloadError::IncompletePiece { index: self.index });
        }
        if sha1_hash(&self.data) != *expected {
            return Err(DownloadError::PieceHashMismatch { index: self.index });
        }
        Ok(self.data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connected,
    Handshaking,
    AwaitingBitfield, // handshake done, peer owes us its bitfield
    Idle,             // bitfield seen, nothing asked yet
    Interested,       // interest sent, waiting for unchoke
    Downloading,      // unchoked, blocks may be requested
    Closed,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub block_size: u32,
    /// Deadline for each handshake and message read/write; `None` waits forever.
    pub message_timeout: Option<Duration>,
    /// Absorb `Have`, `Bitfield`, `Choke`, `Unchoke` and keep-alives that arrive
    /// while another message is awaited instead of failing the session.
    pub route_notifications: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig { block_size: DEFAULT_BLOCK_SIZE, message_timeout: None, route_notifications: false }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unable to connect to peer: {0}")]
    Connect(#[source] std::io::Error),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Torrent(#[from] TorrentError),
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error("timed out waiting for the peer")]
    Timeout,
    #[error("cannot {action} while the session is {state:?}")]
    InvalidState { action: &'static str, state: State },
}

type Result<T> = std::result::Result<T, SessionError>;

enum Awaited {
    Message(Message),
    Choked,
}

async fn with_timeout<T, E, F>(limit: Option<Duration>, operation: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: Into<SessionError>,
{
    match limit {
        Some(limit) => timeout(limit, operation).await.map_err(|_| SessionError::Timeout)?.map_err(Into::into),
        None => operation.await.map_err(Into::into),
    }
}

/// One connection to one peer, downloading pieces strictly one block at a time.
pub struct DownloadSession<S> {
    stream: S,
    torrent: TorrentFile,
    peer_id: [u8; 20],
    config: SessionConfig,
    state: State,
    remote_peer_id: Option<[u8; 20]>,
    peer_pieces: Option<Bitfield>,
    choked: bool,
    progress: ProgressBar,
}

impl DownloadSession<TcpStream> {
    pub async fn connect(
        address: SocketAddrV4,
        torrent: TorrentFile,
        peer_id: [u8; 20],
        config: SessionConfig,
    ) -> Result<Self> {
        let stream = match config.message_timeout {
            Some(limit) => timeout(limit, TcpStream::connect(address)).await.map_err(|_| SessionError::Timeout)?,
            None => TcpStream::connect(address).await,
        }
        .map_err(SessionError::Connect)?;
        info!(%address, "connected to peer");
        Ok(DownloadSession::new(stream, torrent, peer_id, config))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> DownloadSession<S> {
    pub fn new(stream: S, torrent: TorrentFile, peer_id: [u8; 20], config: SessionConfig) -> Self {
        DownloadSession {
            stream,
            torrent,
            peer_id,
            config,
            state: State::Connected,
            remote_peer_id: None,
            peer_pieces: None,
            choked: true,
            progress: ProgressBar::hidden(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn torrent(&self) -> &TorrentFile {
        &self.torrent
    }

    pub fn remote_peer_id(&self) -> Option<&[u8; 20]> {
        self.remote_peer_id.as_ref()
    }

    pub fn is_choked(&self) -> bool {
        self.choked
    }

    /// What the peer has announced about `index`; `None` before a usable bitfield arrived.
    pub fn peer_has_piece(&self, index: u32) -> Option<bool> {
        self.peer_pieces.as_ref().and_then(|bf| bf.has_piece(index as usize).ok())
    }

    /// Advanced by one for every block received.
    pub fn set_progress(&mut self, progress: ProgressBar) {
        self.progress = progress;
    }

    pub async fn close(&mut self) -> Result<()> {
        self.state = State::Closed;
        self.stream.shutdown().await.map_err(|e| SessionError::Message(MessageError::Connection(e)))
    }

    fn expect_state(&self, expected: State, action: &'static str) -> Result<()> {
        if self.state != expected {
            return Err(SessionError::InvalidState { action, state: self.state });
        }
        Ok(())
    }

    fn fail<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            warn!(error = %e, "closing session");
            self.state = State::Closed;
        }
        result
    }

    pub async fn handshake(&mut self) -> Result<[u8; 20]> {
        self.expect_state(State::Connected, "handshake")?;
        self.state = State::Handshaking;
        let limit = self.config.message_timeout;
        let result = with_timeout(limit, handshake(&mut self.stream, &self.torrent.info_hash, &self.peer_id)).await;
        let remote = self.fail(result)?;
        info!(remote_peer_id = %crate::util::to_string(&remote), "handshake complete");
        self.remote_peer_id = Some(remote);
        self.state = State::AwaitingBitfield;
        Ok(remote)
    }

    /// Bitfield in, Interested out, Unchoke in.
    pub async fn prepare(&mut self) -> Result<()> {
        self.expect_state(State::AwaitingBitfield, "prepare")?;
        let result = self.prepare_inner().await;
        self.fail(result)
    }

    async fn prepare_inner(&mut self) -> Result<()> {
        if let Awaited::Message(Message::Bitfield { bitmap }) = self.expect(MessageId::Bitfield).await? {
            self.record_bitfield(bitmap);
        }
        self.state = State::Idle;

        self.send(Message::Interested).await?;
        self.state = State::Interested;

        self.expect(MessageId::Unchoke).await?;
        self.choked = false;
        self.state = State::Downloading;
        info!("peer unchoked us");
        Ok(())
    }

    /// Downloads and verifies piece `index`, handshaking and preparing first if needed.
    pub async fn download_piece(&mut self, index: u32) -> Result<Vec<u8>> {
        if self.state == State::Connected {
            self.handshake().await?;
        }
        if self.state == State::AwaitingBitfield {
            self.prepare().await?;
        }
        self.expect_state(State::Downloading, "download a piece")?;
        let result = self.download_piece_inner(index).await;
        self.fail(result)
    }

    async fn download_piece_inner(&mut self, index: u32) -> Result<Vec<u8>> {
        let piece_length = self.torrent.piece_length(index)?;
        let expected_hash = self.torrent.piece_hash(index)?;
        let length = u32::try_from(piece_length).map_err(|_| DownloadError::PieceTooLarge(piece_length))?;
        if self.peer_has_piece(index) == Some(false) {
            debug!(index, "peer bitfield does not list the piece, requesting anyway");
        }

        let mut buffer = PieceBuffer::new(index, length, self.config.block_size);
        let blocks: Vec<Block> = buffer.blocks().collect();
        info!(index, length, num_blocks = blocks.len(), "downloading piece");
        self.progress.set_length(blocks.len() as u64);
        self.progress.set_position(0);

        for block in blocks {
            let bytes = self.download_block(block).await?;
            buffer.write_block(block.begin, &bytes)?;
            self.progress.inc(1);
        }

        let data = buffer.verify(&expected_hash)?;
        info!(index, "piece verified");
        Ok(data)
    }

    async fn download_block(&mut self, block: Block) -> Result<Vec<u8>> {
        loop {
            if self.choked {
                self.expect(MessageId::Unchoke).await?;
                self.choked = false;
            }
            self.send(Message::Request { index: block.piece_index, begin: block.begin, length: block.length })
                .await?;
            // The response is trusted to answer this request, whatever its header says.
            if let Awaited::Message(Message::Piece { index, begin, bytes }) = self.expect(MessageId::Piece).await? {
                if index != block.piece_index || begin != block.begin {
                    debug!(index, begin, requested = ?block, "peer answered with a different block header");
                }
                return Ok(bytes);
            }
            debug!(?block, "choked mid-request, asking again after unchoke");
        }
    }

    async fn send(&mut self, message: Message) -> Result<()> {
        debug!(%message, "sending");
        with_timeout(self.config.message_timeout, message.send(&mut self.stream)).await
    }

    /// Waits for `expected`, routing notifications into session state when enabled.
    async fn expect(&mut self, expected: MessageId) -> Result<Awaited> {
        let limit = self.config.message_timeout;
        if !self.config.route_notifications {
            let message = with_timeout(limit, wait_for(&mut self.stream, expected)).await?;
            debug!(%message, "received");
            return Ok(Awaited::Message(message));
        }

        loop {
            let message = with_timeout(limit, Message::read_message(&mut self.stream)).await?;
            debug!(%message, "received");
            let Some(received) = message.id() else {
                continue;
            };
            if received == expected {
                return Ok(Awaited::Message(message));
            }
            match message {
                Message::Have { index } => self.record_have(index),
                Message::Bitfield { bitmap } => self.record_bitfield(bitmap),
                Message::Unchoke => self.choked = false,
                Message::Choke => {
                    self.choked = true;
                    if expected == MessageId::Piece {
                        return Ok(Awaited::Choked);
                    }
                }
                _ => return Err(MessageError::UnexpectedMessage { expected, received }.into()),
            }
        }
    }

    fn record_bitfield(&mut self, bitmap: Vec<u8>) {
        let num_pieces = match self.torrent.num_pieces() {
            Ok(n) => n,
            Err(_) => return,
        };
        match Bitfield::try_from_vec(bitmap, num_pieces) {
            Ok(bitfield) => {
                debug!(pieces = bitfield.num_set(), of = num_pieces, seeder = bitfield.all(), "peer bitfield");
                self.peer_pieces = Some(bitfield);
            }
            Err(e) => warn!(error = %e, "ignoring malformed bitfield"),
        }
    }

    fn record_have(&mut self, index: u32) {
        if let Some(bitfield) = self.peer_pieces.as_mut() {
            if let Err(e) = bitfield.mark_piece(index as usize) {
                warn!(error = %e, "ignoring have");
            }
        } else if let Ok(num_pieces) = self.torrent.num_pieces() {
            let mut bitfield = Bitfield::new(num_pieces, false);
            if bitfield.mark_piece(index as usize).is_ok() {
                self.peer_pieces = Some(bitfield);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, DuplexStream, duplex};

    use super::*;
    use crate::metadata::file::fixtures::torrent_bytes;
    use crate::peer::handshake::{HANDSHAKE_LENGTH, TorrentHandshake};

    const LOCAL_ID: [u8; 20] = *b"-TT0001-localpeer000";
    const REMOTE_ID: [u8; 20] = *b"-FK0001-fakeseeder00";
    const PIECE_LENGTH: usize = 40_000;

    fn content() -> Vec<u8> {
        (0..100_000u32).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn torrent() -> TorrentFile {
        TorrentFile::load(&torrent_bytes("http://tracker.test/announce", "content.bin", PIECE_LENGTH, &content()))
            .unwrap()
    }

    /// Scripted seeder serving `content()` with a few knobs for misbehavior.
    #[derive(Default, Clone)]
    struct FakePeer {
        bitfield: Vec<u8>,
        have_before_unchoke: Option<u32>,
        choke_first_request: bool,
        corrupt: bool,
        blank_headers: bool,
        silent: bool,
    }

    impl FakePeer {
        fn seeder() -> Self {
            FakePeer { bitfield: vec![0b1110_0000], ..Default::default() }
        }

        async fn run(self, mut stream: DuplexStream, info_hash: [u8; 20]) -> Vec<Message> {
            let mut requests = Vec::new();
            let mut buf = [0u8; HANDSHAKE_LENGTH];
            stream.read_exact(&mut buf).await.unwrap();
            if self.silent {
                tokio::time::sleep(Duration::from_secs(5)).await;
                return requests;
            }
            let reply = TorrentHandshake::new(&info_hash, &REMOTE_ID);
            stream.write_all(&<[u8; HANDSHAKE_LENGTH]>::from(&reply)).await.unwrap();

            Message::Bitfield { bitmap: self.bitfield.clone() }.send(&mut stream).await.unwrap();
            wait_for(&mut stream, MessageId::Interested).await.unwrap();
            if let Some(index) = self.have_before_unchoke {
                Message::Have { index }.send(&mut stream).await.unwrap();
            }
            Message::Unchoke.send(&mut stream).await.unwrap();

            let data = content();
            let mut choked_once = false;
            while let Ok(message) = Message::read_message(&mut stream).await {
                let Message::Request { index, begin, length } = message else {
                    continue;
                };
                requests.push(message.clone());
                if self.choke_first_request && !choked_once {
                    choked_once = true;
                    Message::Choke.send(&mut stream).await.unwrap();
                    Message::KeepAlive.send(&mut stream).await.unwrap();
                    Message::Unchoke.send(&mut stream).await.unwrap();
                    continue;
                }
                let start = index as usize * PIECE_LENGTH + begin as usize;
                let mut bytes = data[start..start + length as usize].to_vec();
                if self.corrupt {
                    bytes[0] ^= 0xFF;
                }
                let (index, begin) = if self.blank_headers { (0, 0) } else { (index, begin) };
                Message::Piece { index, begin, bytes }.send(&mut stream).await.unwrap();
            }
            requests
        }
    }

    fn start(peer: FakePeer, config: SessionConfig) -> (DownloadSession<DuplexStream>, tokio::task::JoinHandle<Vec<Message>>) {
        let (local, remote) = duplex(64 * 1024);
        let torrent = torrent();
        let server = tokio::spawn(peer.run(remote, torrent.info_hash));
        (DownloadSession::new(local, torrent, LOCAL_ID, config), server)
    }

    #[test]
    fn splits_piece_into_blocks() {
        let buffer = PieceBuffer::new(3, 40_000, DEFAULT_BLOCK_SIZE);
        let blocks: Vec<Block> = buffer.blocks().collect();
        assert_eq!(
            blocks,
            vec![
                Block { piece_index: 3, begin: 0, length: 16384 },
                Block { piece_index: 3, begin: 16384, length: 16384 },
                Block { piece_index: 3, begin: 32768, length: 7232 },
            ]
        );
        assert_eq!(PieceBuffer::new(0, 32768, DEFAULT_BLOCK_SIZE).blocks().count(), 2);
    }

    #[test]
    fn reassembles_blocks_received_out_of_order() {
        let data = content()[..40_000].to_vec();
        let mut buffer = PieceBuffer::new(0, 40_000, DEFAULT_BLOCK_SIZE);
        let mut blocks: Vec<Block> = buffer.blocks().collect();
        blocks.reverse();
        for block in blocks {
            let range = block.begin as usize..(block.begin + block.length) as usize;
            assert!(!buffer.is_complete());
            buffer.write_block(block.begin, &data[range]).unwrap();
        }
        assert_eq!(buffer.verify(&sha1_hash(&data)).unwrap(), data);
    }

    #[test]
    fn corrupted_byte_fails_verification() {
        let data = content()[..20_000].to_vec();
        let mut buffer = PieceBuffer::new(2, 20_000, DEFAULT_BLOCK_SIZE);
        let mut corrupted = data.clone();
        corrupted[12_345] ^= 1;
        buffer.write_block(0, &corrupted).unwrap();
        assert!(buffer.is_complete());
        assert!(matches!(buffer.verify(&sha1_hash(&data)), Err(DownloadError::PieceHashMismatch { index: 2 })));
    }

    #[test]
    fn rejects_blocks_outside_piece_and_missing_blocks() {
        let mut buffer = PieceBuffer::new(0, 100, 40);
        assert!(matches!(
            buffer.write_block(90, &[0; 20]),
            Err(DownloadError::BlockOutOfRange { begin: 90, length: 20, piece_length: 100 })
        ));
        buffer.write_block(0, &[0; 40]).unwrap();
        assert!(matches!(buffer.verify(&[0; 20]), Err(DownloadError::IncompletePiece { index: 0 })));
    }

    #[tokio::test]
    async fn downloads_pieces_over_one_session() {
        let (mut session, server) = start(FakePeer::seeder(), SessionConfig::default());
        let data = content();

        let first = session.download_piece(0).await.unwrap();
        assert_eq!(first, data[..PIECE_LENGTH]);
        assert_eq!(session.state(), State::Downloading);
        assert_eq!(session.remote_peer_id(), Some(&REMOTE_ID));
        assert_eq!(session.peer_has_piece(2), Some(true));

        let last = session.download_piece(2).await.unwrap();
        assert_eq!(last, data[2 * PIECE_LENGTH..]);
        session.close().await.unwrap();
        assert_eq!(session.state(), State::Closed);

        let requests = server.await.unwrap();
        assert_eq!(requests.len(), 5);
        assert_eq!(requests[0], Message::Request { index: 0, begin: 0, length: 16384 });
        assert_eq!(requests[2], Message::Request { index: 0, begin: 32768, length: 7232 });
        assert_eq!(requests[4], Message::Request { index: 2, begin: 16384, length: 3616 });
    }

    #[tokio::test]
    async fn hash_mismatch_closes_session() {
        let peer = FakePeer { corrupt: true, ..FakePeer::seeder() };
        let (mut session, _server) = start(peer, SessionConfig::default());
        let result = session.download_piece(1).await;
        assert!(matches!(result, Err(SessionError::Download(DownloadError::PieceHashMismatch { index: 1 }))));
        assert_eq!(session.state(), State::Closed);
        assert!(matches!(session.download_piece(1).await, Err(SessionError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn places_blocks_at_requested_offset() {
        let peer = FakePeer { blank_headers: true, ..FakePeer::seeder() };
        let (mut session, _server) = start(peer, SessionConfig::default());
        let piece = session.download_piece(1).await.unwrap();
        assert_eq!(piece, content()[PIECE_LENGTH..2 * PIECE_LENGTH]);
        assert_eq!(session.state(), State::Downloading);
    }

    #[tokio::test]
    async fn strict_session_fails_on_interleaved_have() {
        let peer = FakePeer { bitfield: vec![0b1100_0000], have_before_unchoke: Some(2), ..Default::default() };
        let (mut session, _server) = start(peer, SessionConfig::default());
        session.handshake().await.unwrap();
        let result = session.prepare().await;
        assert!(matches!(
            result,
            Err(SessionError::Message(MessageError::UnexpectedMessage {
                expected: MessageId::Unchoke,
                received: MessageId::Have
            }))
        ));
        assert_eq!(session.state(), State::Closed);
    }

    #[tokio::test]
    async fn routing_session_absorbs_notifications() {
        let peer = FakePeer {
            bitfield: vec![0b1100_0000],
            have_before_unchoke: Some(2),
            choke_first_request: true,
            ..Default::default()
        };
        let config = SessionConfig { route_notifications: true, ..SessionConfig::default() };
        let (mut session, server) = start(peer, config);

        session.handshake().await.unwrap();
        session.prepare().await.unwrap();
        assert_eq!(session.peer_has_piece(2), Some(true));
        assert!(!session.is_choked());

        let piece = session.download_piece(1).await.unwrap();
        assert_eq!(piece, content()[PIECE_LENGTH..2 * PIECE_LENGTH]);
        drop(session);

        let requests = server.await.unwrap();
        assert_eq!(requests.len(), 4);
        assert_eq!(requests[0], requests[1]);
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let peer = FakePeer { silent: true, ..FakePeer::seeder() };
        let config = SessionConfig { message_timeout: Some(Duration::from_millis(50)), ..SessionConfig::default() };
        let (mut session, _server) = start(peer, config);
        assert!(matches!(session.handshake().await, Err(SessionError::Timeout)));
        assert_eq!(session.state(), State::Closed);
    }

    #[tokio::test]
    async fn rejects_out_of_range_piece() {
        let (mut session, _server) = start(FakePeer::seeder(), SessionConfig::default());
        let result = session.download_piece(3).await;
        assert!(matches!(result, Err(SessionError::Torrent(TorrentError::PieceOutOfRange { index: 3, .. }))));
    }
}
