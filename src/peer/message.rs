use std::fmt;
use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames longer than this are refused before any payload is buffered.
pub const MAX_MESSAGE_LENGTH: u32 = 16 * 1024 * 1024;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageId {
    Choke         = 0,
    Unchoke       = 1,
    Interested    = 2,
    NotInterested = 3,
    Have          = 4,
    Bitfield      = 5,
    Request       = 6,
    Piece         = 7,
    Cancel        = 8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { index: u32 },
    Bitfield { bitmap: Vec<u8> },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, bytes: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("unknown message id {0}")]
    UnknownMessage(u8),
    #[error("connection error: {0}")]
    Connection(#[source] io::Error),
    #[error("connection closed in the middle of a message")]
    UnexpectedEof,
    #[error("message length {0} exceeds the {MAX_MESSAGE_LENGTH} byte limit")]
    TooLong(u32),
    #[error("{id:?} payload has {received} bytes, expected {expected}")]
    InvalidPayload { id: MessageId, expected: usize, received: usize },
    #[error("expected {expected:?} message, received {received:?}")]
    UnexpectedMessage { expected: MessageId, received: MessageId },
}

impl From<io::Error> for MessageError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof => MessageError::UnexpectedEof,
            _ => MessageError::Connection(e),
        }
    }
}

type Result<T> = std::result::Result<T, MessageError>;

impl TryFrom<u8> for MessageId {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            _ => Err(MessageError::UnknownMessage(value)),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Message::Bitfield { bitmap } => write!(f, "Bitfield({} bytes)", bitmap.len()),
            Message::Piece { index, begin, bytes } => {
                write!(f, "Piece(index={}, begin={}, {} bytes)", index, begin, bytes.len())
            }
            other => write!(f, "{:?}", other),
        }
    }
}

fn read_u32(payload: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([payload[offset], payload[offset + 1], payload[offset + 2], payload[offset + 3]])
}

fn check_payload(id: MessageId, payload: &[u8], expected: usize) -> Result<()> {
    if payload.len() != expected {
        Err(MessageError::InvalidPayload { id, expected, received: payload.len() })
    } else {
        Ok(())
    }
}

impl Message {
    /// `None` for keep-alive, which carries no id byte.
    pub fn id(&self) -> Option<MessageId> {
        let id = match self {
            Message::KeepAlive => return None,
            Message::Choke => MessageId::Choke,
            Message::Unchoke => MessageId::Unchoke,
            Message::Interested => MessageId::Interested,
            Message::NotInterested => MessageId::NotInterested,
            Message::Have { .. } => MessageId::Have,
            Message::Bitfield { .. } => MessageId::Bitfield,
            Message::Request { .. } => MessageId::Request,
            Message::Piece { .. } => MessageId::Piece,
            Message::Cancel { .. } => MessageId::Cancel,
        };
        Some(id)
    }

    /// The wire length prefix: id byte plus payload, or 0 for keep-alive.
    pub fn length(&self) -> u32 {
        let length = match self {
            Message::KeepAlive => 0,
            Message::Have { .. } => 1 + 4,
            Message::Bitfield { bitmap } => 1 + bitmap.len(),
            Message::Request { .. } | Message::Cancel { .. } => 1 + 12,
            Message::Piece { bytes, .. } => 1 + 8 + bytes.len(),
            _ => 1,
        };
        length as u32
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.length() as usize);
        buf.extend_from_slice(&self.length().to_be_bytes());
        if let Some(id) = self.id() {
            buf.push(id as u8);
        }
        match self {
            Message::Have { index } => buf.extend_from_slice(&index.to_be_bytes()),
            Message::Bitfield { bitmap } => buf.extend_from_slice(bitmap),
            Message::Request { index, begin, length } | Message::Cancel { index, begin, length } => {
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(&length.to_be_bytes());
            }
            Message::Piece { index, begin, bytes } => {
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(bytes);
            }
            _ => (),
        }
        buf
    }

    /// Interprets the body of one frame: the id byte and its payload.
    pub fn decode(id: u8, mut payload: Vec<u8>) -> Result<Self> {
        let id = MessageId::try_from(id)?;
        let message = match id {
            MessageId::Choke | MessageId::Unchoke | MessageId::Interested | MessageId::NotInterested => {
                check_payload(id, &payload, 0)?;
                match id {
                    MessageId::Choke => Message::Choke,
                    MessageId::Unchoke => Message::Unchoke,
                    MessageId::Interested => Message::Interested,
                    _ => Message::NotInterested,
                }
            }
            MessageId::Have => {
                check_payload(id, &payload, 4)?;
                Message::Have { index: read_u32(&payload, 0) }
            }
            MessageId::Bitfield => Message::Bitfield { bitmap: payload },
            MessageId::Request | MessageId::Cancel => {
                check_payload(id, &payload, 12)?;
                let (index, begin, length) = (read_u32(&payload, 0), read_u32(&payload, 4), read_u32(&payload, 8));
                if id == MessageId::Request {
                    Message::Request { index, begin, length }
                } else {
                    Message::Cancel { index, begin, length }
                }
            }
            MessageId::Piece => {
                if payload.len() < 8 {
                    return Err(MessageError::InvalidPayload { id, expected: 8, received: payload.len() });
                }
                let (index, begin) = (read_u32(&payload, 0), read_u32(&payload, 4));
                payload.drain(0..8);
                Message::Piece { index, begin, bytes: payload }
            }
        };
        Ok(message)
    }

    /// Reads exactly one frame; message boundaries come only from the length prefix.
    pub async fn read_message<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Self> {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await?;
        let length = u32::from_be_bytes(len_buf);
        if length == 0 {
            return Ok(Message::KeepAlive);
        }
        if length > MAX_MESSAGE_LENGTH {
            return Err(MessageError::TooLong(length));
        }

        let mut frame = vec![0u8; length as usize];
        stream.read_exact(&mut frame).await?;
        let payload = frame.split_off(1);
        Message::decode(frame[0], payload)
    }

    pub async fn send<W: AsyncWrite + Unpin>(&self, stream: &mut W) -> Result<()> {
        stream.write_all(&self.encode()).await.map_err(MessageError::Connection)?;
        stream.flush().await.map_err(MessageError::Connection)
    }
}

/// Reads the next message and fails unless it carries `expected`.
///
/// Keep-alives are skipped. Anything else is not buffered: a peer that sends
/// `Have` while we wait for `Unchoke` makes this fail.
pub async fn wait_for<R: AsyncRead + Unpin>(stream: &mut R, expected: MessageId) -> Result<Message> {
    loop {
        let message = Message::read_message(stream).await?;
        match message.id() {
            None => continue,
            Some(id) if id == expected => return Ok(message),
            Some(received) => return Err(MessageError::UnexpectedMessage { expected, received }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_all(mut bytes: &[u8]) -> Vec<Message> {
        let mut messages = Vec::new();
        while !bytes.is_empty() {
            messages.push(Message::read_message(&mut bytes).await.unwrap());
        }
        messages
    }

    #[test]
    fn encodes_wire_format() {
        assert_eq!(Message::KeepAlive.encode(), vec![0, 0, 0, 0]);
        assert_eq!(Message::Interested.encode(), vec![0, 0, 0, 1, 2]);
        assert_eq!(Message::Have { index: 258 }.encode(), vec![0, 0, 0, 5, 4, 0, 0, 1, 2]);
        assert_eq!(
            Message::Request { index: 1, begin: 16384, length: 16384 }.encode(),
            vec![0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0x40, 0, 0, 0, 0x40, 0]
        );
        assert_eq!(
            Message::Piece { index: 0, begin: 4, bytes: vec![9, 9] }.encode(),
            vec![0, 0, 0, 11, 7, 0, 0, 0, 0, 0, 0, 0, 4, 9, 9]
        );
        assert_eq!(Message::Bitfield { bitmap: vec![0xE0] }.length(), 2);
    }

    #[tokio::test]
    async fn reads_back_every_message_kind() {
        let messages = vec![
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have { index: 7 },
            Message::Bitfield { bitmap: vec![0b1010_0000, 0] },
            Message::Request { index: 2, begin: 0, length: 16384 },
            Message::Piece { index: 2, begin: 16384, bytes: vec![1, 2, 3] },
            Message::Cancel { index: 2, begin: 0, length: 16384 },
        ];
        let wire: Vec<u8> = messages.iter().flat_map(Message::encode).collect();
        assert_eq!(read_all(&wire).await, messages);
    }

    #[tokio::test]
    async fn send_writes_encoded_frame() {
        let mut out: Vec<u8> = Vec::new();
        Message::Unchoke.send(&mut out).await.unwrap();
        assert_eq!(out, vec![0, 0, 0, 1, 1]);
    }

    #[tokio::test]
    async fn keep_alive_has_no_id() {
        let mut wire: &[u8] = &[0, 0, 0, 0];
        let message = Message::read_message(&mut wire).await.unwrap();
        assert_eq!(message, Message::KeepAlive);
        assert_eq!(message.id(), None);
        assert_eq!(Message::Choke.id(), Some(MessageId::Choke));
    }

    #[tokio::test]
    async fn truncated_frame_is_unexpected_eof() {
        let mut wire: &[u8] = &[0, 0, 0, 5, 4, 0, 0];
        assert!(matches!(Message::read_message(&mut wire).await, Err(MessageError::UnexpectedEof)));
        let mut wire: &[u8] = &[0, 0];
        assert!(matches!(Message::read_message(&mut wire).await, Err(MessageError::UnexpectedEof)));
    }

    #[tokio::test]
    async fn rejects_bad_frames() {
        let mut wire: &[u8] = &[0, 0, 0, 2, 1, 0];
        assert!(matches!(
            Message::read_message(&mut wire).await,
            Err(MessageError::InvalidPayload { id: MessageId::Unchoke, expected: 0, received: 1 })
        ));

        let mut wire: &[u8] = &[0, 0, 0, 5, 7, 0, 0, 0, 0];
        assert!(matches!(
            Message::read_message(&mut wire).await,
            Err(MessageError::InvalidPayload { id: MessageId::Piece, expected: 8, received: 4 })
        ));

        let mut wire: &[u8] = &[0xFF, 0, 0, 0];
        assert!(matches!(Message::read_message(&mut wire).await, Err(MessageError::TooLong(_))));
    }

    #[tokio::test]
    async fn unknown_id_is_consumed_whole() {
        let mut wire: &[u8] = &[0, 0, 0, 3, 20, 0xAB, 0xCD, 0, 0, 0, 1, 1];
        assert!(matches!(Message::read_message(&mut wire).await, Err(MessageError::UnknownMessage(20))));
        assert_eq!(Message::read_message(&mut wire).await.unwrap(), Message::Unchoke);
    }

    #[tokio::test]
    async fn wait_for_returns_expected_message() {
        let wire: Vec<u8> = [Message::KeepAlive, Message::Unchoke].iter().flat_map(Message::encode).collect();
        let message = wait_for(&mut wire.as_slice(), MessageId::Unchoke).await.unwrap();
        assert_eq!(message, Message::Unchoke);
    }

    #[tokio::test]
    async fn wait_for_does_not_skip_interleaved_have() {
        let wire: Vec<u8> = [Message::Have { index: 3 }, Message::Unchoke].iter().flat_map(Message::encode).collect();
        let result = wait_for(&mut wire.as_slice(), MessageId::Unchoke).await;
        assert!(matches!(
            result,
            Err(MessageError::UnexpectedMessage { expected: MessageId::Unchoke, received: MessageId::Have })
        ));
    }
}
