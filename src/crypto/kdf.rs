//! Key derivation helpers shared by every cipher kind.

use hkdf::Hkdf;
use md5::{Digest, Md5};
use sha1::Sha1;

/// OpenSSL's `EVP_BytesToKey` with MD5 and no salt/IV, the scheme shadowsocks has always
/// used to turn a user password into a master key of the cipher's required length.
pub fn bytes_to_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len);
    let mut prev: Vec<u8> = Vec::new();

    while key.len() < key_len {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(password);
        let digest = hasher.finalize();
        key.extend_from_slice(&digest);
        prev = digest.to_vec();
    }

    key.truncate(key_len);
    key
}

/// HKDF-SHA1 expand-only, used to derive the per-connection AEAD subkey from the master
/// key and a random salt (RFC 5869, as specified by the shadowsocks AEAD construction).
pub fn hkdf_sha1(master_key: &[u8], salt: &[u8], info: &[u8], out_len: usize) -> Vec<u8> {
    let hk = Hkdf::<Sha1>::new(Some(salt), master_key);
    let mut out = vec![0u8; out_len];
    hk.expand(info, &mut out).expect("hkdf output length is always valid for sha1");
    out
}
