//! At-rest obfuscation of the framework module.
//!
//! **This is not encryption.** The key is derived from a passphrase compiled
//! into every copy of the runtime, so anyone holding a binary can undo the
//! transform. It keeps the module from being trivially lifted or grepped out
//! of an install directory; it does not protect secrets, and callers must not
//! rely on it for confidentiality or integrity.
//!
//! Artifact layout: `MAGIC (8 bytes) ‖ transform(plaintext)`, so an artifact
//! is always exactly `MAGIC.len()` bytes longer than the module it wraps.

use crate::error::FormatError;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

pub const MAGIC: &[u8; 8] = b"LUMENX1\0";
const BUILTIN_PASSPHRASE: &[u8] = b"lumen-runtime/native-module-veil/v1";

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ObfuscationKey(Vec<u8>);

impl ObfuscationKey {
    /// The key every runtime build uses.
    pub fn builtin() -> Self {
        Self::from_passphrase(BUILTIN_PASSPHRASE)
    }

    pub fn from_passphrase(passphrase: &[u8]) -> Self {
        Self(Sha256::digest(passphrase).to_vec())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        if bytes.is_empty() {
            return Err(FormatError::EmptyKey);
        }
        Ok(Self(bytes.to_vec()))
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for ObfuscationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ObfuscationKey").field(&"..").finish()
    }
}

/// XOR `buf` in place with the repeating key stream, starting `offset`
/// bytes into the stream.
pub fn apply_keystream(buf: &mut [u8], key: &ObfuscationKey, offset: usize) {
    let k = key.as_bytes();
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= k[(offset + i) % k.len()];
    }
}

/// Symmetric and length-preserving; applying it twice is the identity.
pub fn transform(bytes: &[u8], key: &ObfuscationKey) -> Vec<u8> {
    let mut out = bytes.to_vec();
    apply_keystream(&mut out, key, 0);
    out
}

pub fn wrap(plain: &[u8], key: &ObfuscationKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(MAGIC.len() + plain.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(plain);
    apply_keystream(&mut out[MAGIC.len()..], key, 0);
    out
}

pub fn unwrap(framed: &[u8], key: &ObfuscationKey) -> Result<Zeroizing<Vec<u8>>, FormatError> {
    if framed.len() < MAGIC.len() {
        return Err(FormatError::Truncated {
            len: framed.len(),
            needed: MAGIC.len(),
        });
    }
    if !is_wrapped(framed) {
        return Err(FormatError::BadMagic);
    }
    let mut plain = Zeroizing::new(framed[MAGIC.len()..].to_vec());
    apply_keystream(&mut plain, key, 0);
    Ok(plain)
}

pub fn is_wrapped(bytes: &[u8]) -> bool {
    bytes.len() >= MAGIC.len() && &bytes[..MAGIC.len()] == MAGIC
}
