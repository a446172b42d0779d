//! Stream cipher primitives for the shadowsocks wire protocol.
//!
//! This module is the external collaborator the relay code calls through: it owns key
//! derivation and the per-direction encrypt/decrypt state, but knows nothing about SOCKS5,
//! addresses, or sessions. `CipherKind::None` is the identity transform, used for ACL-bypass
//! (where no cipher context exists at all) and for tests that want to inspect the exact bytes
//! that would otherwise be encrypted.

use std::fmt;
use std::io;
use std::str::FromStr;

mod aead;
mod kdf;

pub use self::aead::AeadCipher;

/// Supported encryption methods, named the way they appear in `ss://` URLs and config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherKind {
    /// No encryption at all. Only valid for direct/bypass sessions and tests.
    None,
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20IetfPoly1305,
}

impl CipherKind {
    pub fn category(self) -> CipherCategory {
        match self {
            CipherKind::None => CipherCategory::None,
            _ => CipherCategory::Aead,
        }
    }

    /// Length in bytes of the derived per-connection key.
    pub fn key_len(self) -> usize {
        match self {
            CipherKind::None => 0,
            CipherKind::Aes128Gcm => 16,
            CipherKind::Aes256Gcm => 32,
            CipherKind::ChaCha20IetfPoly1305 => 32,
        }
    }

    /// Length in bytes of the random salt prefixed to the AEAD session (also the key length).
    pub fn salt_len(self) -> usize {
        self.key_len()
    }

    pub fn tag_len(self) -> usize {
        match self.category() {
            CipherCategory::None => 0,
            CipherCategory::Aead => 16,
        }
    }
}

impl fmt::Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CipherKind::None => "none",
            CipherKind::Aes128Gcm => "aes-128-gcm",
            CipherKind::Aes256Gcm => "aes-256-gcm",
            CipherKind::ChaCha20IetfPoly1305 => "chacha20-ietf-poly1305",
        };
        f.write_str(s)
    }
}

impl FromStr for CipherKind {
    type Err = CipherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" | "plain" => Ok(CipherKind::None),
            "aes-128-gcm" => Ok(CipherKind::Aes128Gcm),
            "aes-256-gcm" => Ok(CipherKind::Aes256Gcm),
            "chacha20-ietf-poly1305" | "chacha20-poly1305" => Ok(CipherKind::ChaCha20IetfPoly1305),
            _ => Err(CipherError::UnknownMethod(s.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherCategory {
    None,
    Aead,
}

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("unsupported cipher method: {0}")]
    UnknownMethod(String),
    #[error("invalid password or cipher")]
    Decrypt,
}

/// Which direction a [`Cipher`] instance transforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoMode {
    Encrypt,
    Decrypt,
}

/// Owns the mutable state of one direction of one session's cipher.
///
/// `update` never reuses the caller's buffer pointer: it always returns a freshly owned
/// buffer that the caller adopts and the previous one is dropped. This mirrors the
/// out-of-scope C collaborator's `ss_encrypt`/`ss_decrypt`, which may reallocate for IV
/// prefixes or block padding.
pub enum Cipher {
    None,
    Aead(AeadCipher),
}

impl Cipher {
    pub fn new(kind: CipherKind, key: &[u8], mode: CryptoMode) -> Cipher {
        match kind.category() {
            CipherCategory::None => Cipher::None,
            CipherCategory::Aead => Cipher::Aead(AeadCipher::new(kind, key, mode)),
        }
    }

    /// Transforms one inbound chunk of plaintext (encrypt) or on-wire bytes (decrypt),
    /// appending any bytes that can already be produced to `out`. Some cipher chunk
    /// framings need more bytes than a single `update` call provides before they can
    /// produce output; callers should keep feeding bytes until the direction closes.
    pub fn update(&mut self, data: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
        match self {
            Cipher::None => {
                out.extend_from_slice(data);
                Ok(())
            }
            Cipher::Aead(c) => c.update(data, out),
        }
    }
}

/// Derive the password-based master key the way shadowsocks always has
/// (OpenSSL's `EVP_BytesToKey` with MD5, truncated/extended to `key_len`).
pub fn derive_master_key(password: &[u8], key_len: usize) -> Vec<u8> {
    kdf::bytes_to_key(password, key_len)
}

/// Derive the per-session subkey from the master key and a per-connection random salt,
/// via HKDF-SHA1 with the fixed shadowsocks info string, as every AEAD shadowsocks
/// implementation does.
pub fn derive_session_key(master_key: &[u8], salt: &[u8], key_len: usize) -> Vec<u8> {
    kdf::hkdf_sha1(master_key, salt, b"ss-subkey", key_len)
}
