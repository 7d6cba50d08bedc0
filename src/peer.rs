pub mod downloader;
pub mod handshake;
pub mod message;

use rand::Rng;
use rand::distr::Alphanumeric;
use thiserror::Error;

/// Azureus-style client prefix for locally generated peer ids.
pub const PEER_ID_PREFIX: &[u8; 8] = b"-TT0001-";

/// Builds a peer id from `rng`: the client prefix followed by 12 alphanumeric bytes.
pub fn generate_peer_id<R: Rng + ?Sized>(rng: &mut R) -> [u8; 20] {
    let mut id = [0u8; 20];
    id[..PEER_ID_PREFIX.len()].copy_from_slice(PEER_ID_PREFIX);
    for byte in &mut id[PEER_ID_PREFIX.len()..] {
        *byte = rng.sample(Alphanumeric);
    }
    id
}

/// Piece availability, one bit per piece; the high bit of byte 0 is piece 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    masks: Vec<u8>,
    pub num: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BitfieldError {
    #[error("{num_elements} byte(s) cannot hold {num_fields} pieces")]
    Unrepresentible { num_fields: usize, num_elements: usize },
    #[error("piece {index} out of range ({len} pieces)")]
    PieceOutOfRange { index: usize, len: usize },
}

impl Bitfield {
    pub fn new(num: usize, set: bool) -> Self {
        let num_elements = num.div_ceil(8);
        let masks = if set { vec![0xFF; num_elements] } else { vec![0; num_elements] };
        let mut bf = Bitfield { masks, num };
        bf.clear_spare_bits();
        bf
    }

    /// Wraps a received bitmap; spare trailing bits and bytes are dropped.
    pub fn try_from_vec(mut v: Vec<u8>, num: usize) -> Result<Self, BitfieldError> {
        let num_elements = num.div_ceil(8);
        if v.len() < num_elements {
            return Err(BitfieldError::Unrepresentible { num_fields: num, num_elements: v.len() });
        }
        v.truncate(num_elements);
        let mut bf = Bitfield { masks: v, num };
        bf.clear_spare_bits();
        Ok(bf)
    }

    fn last_mask(&self) -> u8 {
        match self.num % 8 {
            0 => 0xFF,
            extra => !(0xFFu8 >> extra),
        }
    }

    fn clear_spare_bits(&mut self) {
        let last_mask = self.last_mask();
        if let Some(last) = self.masks.last_mut() {
            *last &= last_mask;
        }
    }

    fn index_check(&self, index: usize) -> Result<(), BitfieldError> {
        if index >= self.num {
            Err(BitfieldError::PieceOutOfRange { index, len: self.num })
        } else {
            Ok(())
        }
    }

    fn locate(index: usize) -> (usize, u8) {
        (index / 8, 1 << (7 - index % 8))
    }

    pub fn has_piece(&self, index: usize) -> Result<bool, BitfieldError> {
        self.index_check(index)?;
        let (element, mask) = Self::locate(index);
        Ok(self.masks[element] & mask == mask)
    }

    pub fn mark_piece(&mut self, index: usize) -> Result<(), BitfieldError> {
        self.index_check(index)?;
        let (element, mask) = Self::locate(index);
        self.masks[element] |= mask;
        Ok(())
    }

    pub fn num_set(&self) -> usize {
        self.masks.iter().map(|mask| mask.count_ones() as usize).sum()
    }

    pub fn all(&self) -> bool {
        self.num_set() == self.num
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.masks
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    #[test]
    fn peer_id_uses_prefix_and_injected_rng() {
        let id = generate_peer_id(&mut StdRng::seed_from_u64(7));
        assert_eq!(&id[..8], PEER_ID_PREFIX);
        assert!(id[8..].iter().all(u8::is_ascii_alphanumeric));
        assert_eq!(id, generate_peer_id(&mut StdRng::seed_from_u64(7)));
        assert_ne!(id, generate_peer_id(&mut StdRng::seed_from_u64(8)));
    }

    #[test]
    fn bitfield_reads_high_bit_first() {
        let bf = Bitfield::try_from_vec(vec![0b1000_0001, 0b0100_0000], 10).unwrap();
        assert_eq!(bf.has_piece(0), Ok(true));
        assert_eq!(bf.has_piece(1), Ok(false));
        assert_eq!(bf.has_piece(7), Ok(true));
        assert_eq!(bf.has_piece(9), Ok(true));
        assert_eq!(bf.has_piece(10), Err(BitfieldError::PieceOutOfRange { index: 10, len: 10 }));
    }

    #[test]
    fn bitfield_drops_spare_bits() {
        let bf = Bitfield::try_from_vec(vec![0xFF, 0xFF, 0xFF], 10).unwrap();
        assert_eq!(bf.as_bytes(), &[0xFF, 0xC0]);
        assert!(bf.all());
        assert_eq!(bf.num_set(), 10);
        assert_eq!(
            Bitfield::try_from_vec(vec![0xFF], 10),
            Err(BitfieldError::Unrepresentible { num_fields: 10, num_elements: 1 })
        );
    }

    #[test]
    fn bitfield_marks_pieces() {
        let mut bf = Bitfield::new(3, false);
        assert_eq!(bf.num_set(), 0);
        bf.mark_piece(2).unwrap();
        assert_eq!(bf.as_bytes(), &[0b0010_0000]);
        assert!(!bf.all());
        bf.mark_piece(0).unwrap();
        bf.mark_piece(1).unwrap();
        assert!(bf.all());
        assert_eq!(bf.mark_piece(3), Err(BitfieldError::PieceOutOfRange { index: 3, len: 3 }));
        assert_eq!(Bitfield::new(3, true).as_bytes(), &[0b1110_0000]);
    }
}
