use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use thiserror::Error;

use crate::metadata::bencode::{self, BencodeError, BencodeValue};
use crate::util::{self, sha1::sha1_hash};

/// Length of one SHA-1 piece hash inside `info.pieces`.
pub const HASH_LENGTH: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    announce: String,
    creation_date: Option<u64>,
    comment: Option<String>,
    created_by: Option<String>,
    private: bool,

    pub info: Info,
    pub info_hash: [u8; 20],
}

/// The single-file `info` dictionary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    pub name: String,
    pub length: u64,
    pub piece_length: u64,
    pub pieces: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("torrent file is not a bencoded dictionary")]
    NotADictionary,
    #[error("required key `{0}` is missing or has the wrong type")]
    MissingField(&'static str),
    #[error("key `{0}` maps to a negative integer ({1})")]
    NegativeInteger(&'static str, i64),
    #[error("`private` must be 0 or 1, found {0}")]
    InvalidPrivateValue(u64),
    #[error("`piece length` must be positive")]
    ZeroPieceLength,
    #[error("pieces blob length ({0}) is not a multiple of 20")]
    InvalidPiecesLength(usize),
    #[error("piece {index} out of range ({num_pieces} pieces)")]
    PieceOutOfRange { index: u32, num_pieces: usize },
    #[error("invalid bencode: {0}")]
    Bencode(#[from] BencodeError),
    #[error("unable to read torrent file: {0}")]
    Io(#[from] std::io::Error),
}

type Result<T> = std::result::Result<T, TorrentError>;

const ANNOUNCE: &[u8] = b"announce";
const CREATION_DATE: &[u8] = b"creation date";
const COMMENT: &[u8] = b"comment";
const CREATED_BY: &[u8] = b"created by";
const INFO: &[u8] = b"info";
const PIECE_LENGTH: &[u8] = b"piece length";
const PIECES: &[u8] = b"pieces";
const PRIVATE: &[u8] = b"private";
const NAME: &[u8] = b"name";
const LENGTH: &[u8] = b"length";

impl fmt::Display for TorrentFile {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Tracker URL: {}", self.announce)?;
        writeln!(f, "Length: {}", self.info.length)?;
        writeln!(f, "Info Hash: {}", self.info_hash_hex())?;
        writeln!(f, "Piece Length: {}", self.info.piece_length)?;
        if let Some(date) = &self.creation_date {
            writeln!(f, "Created: {} seconds since epoch", date)?;
        }
        if let Some(text) = &self.comment {
            writeln!(f, "Comment: {}", text)?;
        }
        if let Some(author) = &self.created_by {
            writeln!(f, "Created By: {}", author)?;
        }
        if self.private {
            writeln!(f, "Private: yes")?;
        }
        match self.piece_hashes() {
            Ok(hashes) => {
                write!(f, "Piece Hashes:")?;
                for hash in hashes {
                    write!(f, "\n{}", util::to_string(&hash))?;
                }
                Ok(())
            }
            Err(e) => write!(f, "Piece Hashes: {}", e),
        }
    }
}

impl TryFrom<&BencodeValue> for TorrentFile {
    type Error = TorrentError;

    fn try_from(value: &BencodeValue) -> Result<Self> {
        let items = value.as_dict().map_err(|_| TorrentError::NotADictionary)?;
        let info_value = items.get(INFO).ok_or(TorrentError::MissingField("info"))?;
        let info_items = info_value.as_dict().map_err(|_| TorrentError::MissingField("info"))?;

        let piece_length = required_uint(info_items, PIECE_LENGTH, "piece length")?;
        if piece_length == 0 {
            return Err(TorrentError::ZeroPieceLength);
        }
        let info = Info {
            name: required_string(info_items, NAME, "name")?,
            length: required_uint(info_items, LENGTH, "length")?,
            piece_length,
            pieces: info_items
                .get(PIECES)
                .and_then(|v| v.as_bytes().ok())
                .ok_or(TorrentError::MissingField("pieces"))?
                .to_vec(),
        };

        let private = match optional_uint(info_items, PRIVATE, "private")? {
            None | Some(0) => false,
            Some(1) => true,
            Some(v) => return Err(TorrentError::InvalidPrivateValue(v)),
        };

        // Hash the canonical re-encoding so source key order cannot change the identity.
        let info_hash = sha1_hash(&bencode::encode(info_value));

        Ok(TorrentFile {
            announce: required_string(items, ANNOUNCE, "announce")?,
            creation_date: optional_uint(items, CREATION_DATE, "creation date")?,
            comment: optional_string(items, COMMENT),
            created_by: optional_string(items, CREATED_BY),
            private,
            info,
            info_hash,
        })
    }
}

fn required_string(items: &BTreeMap<Vec<u8>, BencodeValue>, key: &[u8], name: &'static str) -> Result<String> {
    items
        .get(key)
        .and_then(|v| v.as_str().ok())
        .map(str::to_owned)
        .ok_or(TorrentError::MissingField(name))
}

fn optional_string(items: &BTreeMap<Vec<u8>, BencodeValue>, key: &[u8]) -> Option<String> {
    items.get(key).and_then(|v| v.as_str().ok()).map(str::to_owned)
}

fn optional_uint(items: &BTreeMap<Vec<u8>, BencodeValue>, key: &[u8], name: &'static str) -> Result<Option<u64>> {
    match items.get(key) {
        None => Ok(None),
        Some(value) => {
            let num = value.as_integer().map_err(|_| TorrentError::MissingField(name))?;
            u64::try_from(num).map(Some).map_err(|_| TorrentError::NegativeInteger(name, num))
        }
    }
}

fn required_uint(items: &BTreeMap<Vec<u8>, BencodeValue>, key: &[u8], name: &'static str) -> Result<u64> {
    optional_uint(items, key, name)?.ok_or(TorrentError::MissingField(name))
}

impl TorrentFile {
    /// Parses the raw contents of a `.torrent` file.
    pub fn load(bytes: &[u8]) -> Result<Self> {
        let value = bencode::decode(bytes)?;
        TorrentFile::try_from(&value)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::load(&bytes)
    }

    pub fn announce(&self) -> &str {
        &self.announce
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    pub fn created_by(&self) -> Option<&str> {
        self.created_by.as_deref()
    }

    pub fn creation_date(&self) -> Option<u64> {
        self.creation_date
    }

    pub fn is_private(&self) -> bool {
        self.private
    }

    pub fn info_hash_hex(&self) -> String {
        util::to_string(&self.info_hash)
    }

    /// Splits `info.pieces` into per-piece hashes; piece index is the chunk index.
    pub fn piece_hashes(&self) -> Result<Vec<[u8; 20]>> {
        let pieces = &self.info.pieces;
        if pieces.len() % HASH_LENGTH != 0 {
            return Err(TorrentError::InvalidPiecesLength(pieces.len()));
        }
        let mut hashes = Vec::with_capacity(pieces.len() / HASH_LENGTH);
        for chunk in pieces.chunks_exact(HASH_LENGTH) {
            let mut hash = [0u8; HASH_LENGTH];
            hash.copy_from_slice(chunk);
            hashes.push(hash);
        }
        Ok(hashes)
    }

    pub fn piece_hash(&self, index: u32) -> Result<[u8; 20]> {
        let hashes = self.piece_hashes()?;
        hashes
            .get(index as usize)
            .copied()
            .ok_or(TorrentError::PieceOutOfRange { index, num_pieces: hashes.len() })
    }

    pub fn num_pieces(&self) -> Result<usize> {
        Ok(self.piece_hashes()?.len())
    }

    /// Byte length of piece `index`; the final piece is clamped to what remains of `info.length`.
    pub fn piece_length(&self, index: u32) -> Result<u64> {
        let num_pieces = self.num_pieces()?;
        let out_of_range = TorrentError::PieceOutOfRange { index, num_pieces };
        if index as usize >= num_pieces {
            return Err(out_of_range);
        }
        let start = (index as u64).saturating_mul(self.info.piece_length);
        match self.info.length.saturating_sub(start).min(self.info.piece_length) {
            0 => Err(out_of_range),
            length => Ok(length),
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::collections::BTreeMap;

    use crate::metadata::bencode::{self, BencodeValue};
    use crate::util::sha1::sha1_hash;

    /// Bencoded single-file torrent whose piece hashes match `data`.
    pub(crate) fn torrent_bytes(announce: &str, name: &str, piece_length: usize, data: &[u8]) -> Vec<u8> {
        let pieces: Vec<u8> = data.chunks(piece_length).flat_map(|chunk| sha1_hash(chunk)).collect();
        let mut info = BTreeMap::new();
        info.insert(b"length".to_vec(), BencodeValue::Integer(data.len() as i64));
        info.insert(b"name".to_vec(), BencodeValue::from(name));
        info.insert(b"piece length".to_vec(), BencodeValue::Integer(piece_length as i64));
        info.insert(b"pieces".to_vec(), BencodeValue::ByteString(pieces));
        let mut top = BTreeMap::new();
        top.insert(b"announce".to_vec(), BencodeValue::from(announce));
        top.insert(b"info".to_vec(), BencodeValue::Dictionary(info));
        bencode::encode(&BencodeValue::Dictionary(top))
    }
}
