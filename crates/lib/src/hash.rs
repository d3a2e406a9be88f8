use std::fmt;

use serde::{Deserialize, Serialize};

pub const HASH_LEN: usize = 32;

/// A 32-byte BLAKE3 digest. Every content and history id in the store is one
/// of these, rendered as lowercase hex wherever a string key is needed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash {
    pub data: [u8; HASH_LEN],
}

impl Hash {
    pub const ZERO: Hash = Hash { data: [0; HASH_LEN] };

    pub fn from_arr(arr: &[u8; HASH_LEN]) -> Self {
        Hash { data: *arr }
    }

    /// Panics if `slice` is not exactly [`HASH_LEN`] bytes long.
    pub fn from_slice(slice: &[u8]) -> Self {
        let mut data = [0; HASH_LEN];
        data.copy_from_slice(slice);
        Hash { data }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.data)
    }

    pub fn from_hex(hex: &str) -> Result<Self, hex::FromHexError> {
        let mut data = [0; HASH_LEN];
        hex::decode_to_slice(hex, &mut data)?;
        Ok(Hash { data })
    }

    /// First 8 hex characters, for log lines.
    pub fn abbreviate(&self) -> String {
        hex::encode(&self.data[..4])
    }
}

pub fn hash_bytes(bytes: impl AsRef<[u8]>) -> Hash {
    Hash {
        data: *blake3::hash(bytes.as_ref()).as_bytes(),
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.abbreviate())
    }
}

/// Builds a digest out of several parts. Each part is length-prefixed, so
/// distinct part lists can never collide by concatenation.
pub struct IdHasher {
    inner: blake3::Hasher,
}

impl IdHasher {
    pub fn new() -> Self {
        IdHasher {
            inner: blake3::Hasher::new(),
        }
    }

    pub fn update(&mut self, part: &[u8]) -> &mut Self {
        self.inner.update(&(part.len() as u64).to_le_bytes());
        self.inner.update(part);
        self
    }

    pub fn finish(&self) -> Hash {
        Hash {
            data: *self.inner.finalize().as_bytes(),
        }
    }
}

impl Default for IdHasher {
    fn default() -> Self {
        Self::new()
    }
}
