//! Decoding of membership payloads and key hashing.
//!
//! Membership notifications carry a base64 payload that is optionally gzip or zlib compressed.
//! Depending on the update strategy, the decompressed bytes are either a bitmap indexed by key
//! hash ([`BitmapPayload`]) or a JSON document listing hashes of added and removed keys
//! ([`KeyListPayload`]).
use std::{collections::HashSet, io::Read};

use base64::Engine;
use serde::Deserialize;

use crate::{Error, Result};

/// Compression applied to a membership payload before base64 encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Compression {
    /// Payload is plain base64.
    #[default]
    None,
    /// Payload is gzip-compressed.
    Gzip,
    /// Payload is zlib-compressed.
    Zlib,
}

impl TryFrom<u8> for Compression {
    type Error = Error;

    fn try_from(code: u8) -> Result<Compression> {
        match code {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Gzip),
            2 => Ok(Compression::Zlib),
            _ => Err(Error::UnknownCode {
                kind: "compression",
                code: code.to_string(),
            }),
        }
    }
}

/// Hash algorithm used to compute the refetch delay of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HashAlgorithm {
    /// Not specified. Falls back to [`HashAlgorithm::Murmur3_32`].
    #[default]
    None,
    /// 32-bit murmur3.
    Murmur3_32,
    /// Lower 64 bits of 128-bit murmur3 (x64 variant).
    Murmur3_64,
}

impl TryFrom<u8> for HashAlgorithm {
    type Error = Error;

    fn try_from(code: u8) -> Result<HashAlgorithm> {
        match code {
            0 => Ok(HashAlgorithm::None),
            1 => Ok(HashAlgorithm::Murmur3_32),
            2 => Ok(HashAlgorithm::Murmur3_64),
            _ => Err(Error::UnknownCode {
                kind: "hash algorithm",
                code: code.to_string(),
            }),
        }
    }
}

/// 32-bit murmur3 of `input` with `seed`.
pub fn murmur3_32(input: &[u8], seed: u32) -> u32 {
    murmur3::murmur3_32(&mut std::io::Cursor::new(input), seed)
        .expect("reading from an in-memory buffer should not fail")
}

/// Lower 64 bits of the x64 128-bit murmur3 of `input` with `seed`.
pub fn murmur3_64(input: &[u8], seed: u32) -> u64 {
    let hash = murmur3::murmur3_x64_128(&mut std::io::Cursor::new(input), seed)
        .expect("reading from an in-memory buffer should not fail");
    hash as u64
}

/// Hash of a user key as used by bitmap and key-list payloads.
pub fn hash_key(key: &str) -> u64 {
    murmur3_64(key.as_bytes(), 0)
}

/// Identifier embedded in per-key membership channel names.
pub fn channel_key_hash(key: &str) -> String {
    let hash = murmur3_32(key.as_bytes(), 0);
    base64::engine::general_purpose::STANDARD.encode(hash.to_string())
}

/// Decode a base64 payload and decompress it.
pub fn decode_payload(data: &str, compression: Compression) -> Result<Vec<u8>> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(data.trim())?;

    let mut out = Vec::new();
    match compression {
        Compression::None => return Ok(bytes),
        Compression::Gzip => flate2::read::GzDecoder::new(bytes.as_slice()).read_to_end(&mut out),
        Compression::Zlib => flate2::read::ZlibDecoder::new(bytes.as_slice()).read_to_end(&mut out),
    }
    .map_err(|err| Error::Decompression(err.into()))?;

    Ok(out)
}

/// Bitmap where a key is a member if the bit at `hash(key) mod (len * 8)` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitmapPayload(Vec<u8>);

impl BitmapPayload {
    /// Decode bitmap from the notification payload.
    pub fn decode(data: &str, compression: Compression) -> Result<BitmapPayload> {
        decode_payload(data, compression).map(BitmapPayload)
    }

    /// Bitmap length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether bitmap has no bytes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Bit index for `hashed_key` in this bitmap.
    pub fn key_index(&self, hashed_key: u64) -> Result<u64> {
        let bits = (self.0.len() as u64) * 8;
        if bits == 0 {
            return Err(Error::BitmapIndexOutOfRange {
                index: hashed_key,
                len: 0,
            });
        }
        Ok(hashed_key % bits)
    }

    /// Test the bit at `index`.
    ///
    /// Returns an error if `index` does not fit the bitmap, so that callers can treat a truncated
    /// payload as a decoding failure instead of "not a member".
    pub fn is_set(&self, index: u64) -> Result<bool> {
        let byte = usize::try_from(index / 8)
            .ok()
            .and_then(|i| self.0.get(i))
            .ok_or(Error::BitmapIndexOutOfRange {
                index,
                len: self.0.len(),
            })?;
        Ok(byte & (1 << (index % 8)) != 0)
    }

    /// Membership test for a hashed key.
    pub fn contains(&self, hashed_key: u64) -> Result<bool> {
        self.is_set(self.key_index(hashed_key)?)
    }
}

impl From<Vec<u8>> for BitmapPayload {
    fn from(value: Vec<u8>) -> Self {
        BitmapPayload(value)
    }
}

/// What a key-list notification means for a specific key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyListAction {
    /// Key was added to the segments.
    Add,
    /// Key was removed from the segments.
    Remove,
    /// Key is not affected.
    None,
}

/// Hashes of keys added to and removed from the notified segments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct KeyListPayload {
    /// Added key hashes.
    #[serde(rename = "a", default)]
    pub added: HashSet<u64>,
    /// Removed key hashes.
    #[serde(rename = "r", default)]
    pub removed: HashSet<u64>,
}

impl KeyListPayload {
    /// Decode key list from the notification payload.
    pub fn decode(data: &str, compression: Compression) -> Result<KeyListPayload> {
        let bytes = decode_payload(data, compression)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Compute action for a hashed key. Presence in `added` wins over `removed`.
    pub fn action(&self, hashed_key: u64) -> KeyListAction {
        if self.added.contains(&hashed_key) {
            KeyListAction::Add
        } else if self.removed.contains(&hashed_key) {
            KeyListAction::Remove
        } else {
            KeyListAction::None
        }
    }
}
