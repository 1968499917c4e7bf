use std::fmt;

use sha2::{Digest, Sha256};

/// Length in bytes of a SHA-256 digest.
pub const HASH_LEN: usize = 32;
/// Length of a digest rendered as lowercase hex.
pub const HASH_HEX_LEN: usize = HASH_LEN * 2;

/// A SHA-256 content digest.
///
/// Every asset on the server is addressed by the digest of its bytes;
/// on the wire it travels as 32 raw bytes, on disk and in `map.json`
/// as 64 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash {
    pub data: [u8; HASH_LEN],
}

impl Hash {
    /// Interpret `bytes` as a digest.
    ///
    /// Panics if `bytes` is not exactly [`HASH_LEN`] long; use
    /// [`Hash::from_hex`] for untrusted input.
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut data = [0; HASH_LEN];
        data.copy_from_slice(bytes);
        Self { data }
    }

    pub fn from_hex(hex: &str) -> Result<Self, hex::FromHexError> {
        let mut data = [0; HASH_LEN];
        hex::decode_to_slice(hex, &mut data)?;
        Ok(Self { data })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.data)
    }
}

pub fn hash_bytes(bytes: impl AsRef<[u8]>) -> Hash {
    let digest = Sha256::digest(bytes.as_ref());
    Hash::from_slice(&digest)
}

/// Digest a file's contents without reading it into memory at once.
pub fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Hash> {
    use std::io::Read;

    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Hash::from_slice(&hasher.finalize()))
}

/// Whether `s` is a canonically encoded digest: exactly 64 lowercase
/// hex characters.
pub fn is_valid_hex_hash(s: &str) -> bool {
    s.len() == HASH_HEX_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}
