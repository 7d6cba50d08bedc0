pub mod io;
pub mod sha1;

pub fn to_string(bytes: &[u8]) -> String {
    hex::encode(bytes)
}
