use ::sha1::{Digest, Sha1};

pub fn sha1_hash(bytes: &[u8]) -> [u8; 20] {
    let digest = Sha1::digest(bytes);
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&digest);
    hash
}
