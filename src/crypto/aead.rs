//! AEAD cipher chunk framing: `[salt][len‖tag][payload‖tag][len‖tag][payload‖tag]...`
//!
//! The salt is only present once, at the start of the direction's byte stream. Every
//! chunk after that is a length field (max 0x3FFF bytes, AEAD-sealed on its own) followed
//! by the payload it describes (also AEAD-sealed). This is the framing every AEAD
//! shadowsocks implementation uses; like the rest of this module it is an external
//! collaborator to the relay, which only ever sees "feed bytes in, get bytes out".

use aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngCore;
use std::io;

use super::{derive_master_key, derive_session_key, CipherKind, CryptoMode};

const MAX_CHUNK_LEN: usize = 0x3FFF;
const NONCE_LEN: usize = 12;

enum Aad {
    Aes128Gcm(Aes128Gcm),
    Aes256Gcm(Aes256Gcm),
    ChaCha20Poly1305(ChaCha20Poly1305),
}

impl Aad {
    fn new(kind: CipherKind, key: &[u8]) -> Aad {
        match kind {
            CipherKind::Aes128Gcm => Aad::Aes128Gcm(Aes128Gcm::new_from_slice(key).expect("key length checked by CipherKind")),
            CipherKind::Aes256Gcm => Aad::Aes256Gcm(Aes256Gcm::new_from_slice(key).expect("key length checked by CipherKind")),
            CipherKind::ChaCha20IetfPoly1305 => {
                Aad::ChaCha20Poly1305(ChaCha20Poly1305::new_from_slice(key).expect("key length checked by CipherKind"))
            }
            CipherKind::None => unreachable!("None cipher never constructs an AeadCipher"),
        }
    }

    fn seal(&self, nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Vec<u8> {
        let payload = Payload { msg: plaintext, aad: &[] };
        match self {
            Aad::Aes128Gcm(c) => c.encrypt(nonce.into(), payload),
            Aad::Aes256Gcm(c) => c.encrypt(nonce.into(), payload),
            Aad::ChaCha20Poly1305(c) => c.encrypt(nonce.into(), payload),
        }
        .expect("sealing with a correctly sized key/nonce never fails")
    }

    fn open(&self, nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> io::Result<Vec<u8>> {
        let payload = Payload { msg: ciphertext, aad: &[] };
        let result = match self {
            Aad::Aes128Gcm(c) => c.decrypt(nonce.into(), payload),
            Aad::Aes256Gcm(c) => c.decrypt(nonce.into(), payload),
            Aad::ChaCha20Poly1305(c) => c.decrypt(nonce.into(), payload),
        };
        result.map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid password or cipher"))
    }
}

struct NonceCounter([u8; NONCE_LEN]);

impl NonceCounter {
    fn new() -> NonceCounter {
        NonceCounter([0u8; NONCE_LEN])
    }

    fn current(&self) -> [u8; NONCE_LEN] {
        self.0
    }

    fn increment(&mut self) {
        for byte in self.0.iter_mut() {
            let (next, overflow) = byte.overflowing_add(1);
            *byte = next;
            if !overflow {
                break;
            }
        }
    }
}

enum State {
    /// Direction hasn't produced/consumed its salt yet.
    AwaitingSalt,
    Streaming,
}

/// One direction of one session's AEAD cipher context. Owns its own nonce counter,
/// session key, and (for decryption) a reassembly buffer across `update` calls, since the
/// caller may hand us bytes in arbitrary fragments.
pub struct AeadCipher {
    kind: CipherKind,
    mode: CryptoMode,
    master_key: Vec<u8>,
    aead: Option<Aad>,
    nonce: NonceCounter,
    state: State,
    recv_buf: Vec<u8>,
}

impl AeadCipher {
    pub fn new(kind: CipherKind, password_derived_key: &[u8], mode: CryptoMode) -> AeadCipher {
        AeadCipher {
            kind,
            mode,
            master_key: password_derived_key.to_vec(),
            aead: None,
            nonce: NonceCounter::new(),
            state: State::AwaitingSalt,
            recv_buf: Vec::new(),
        }
    }

    pub fn update(&mut self, data: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
        match self.mode {
            CryptoMode::Encrypt => self.update_encrypt(data, out),
            CryptoMode::Decrypt => self.update_decrypt(data, out),
        }
    }

    fn update_encrypt(&mut self, data: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
        if let State::AwaitingSalt = self.state {
            let salt_len = self.kind.salt_len();
            let mut salt = vec![0u8; salt_len];
            rand::thread_rng().fill_bytes(&mut salt);
            let session_key = derive_session_key(&self.master_key, &salt, self.kind.key_len());
            self.aead = Some(Aad::new(self.kind, &session_key));
            out.extend_from_slice(&salt);
            self.state = State::Streaming;
        }

        let aead = self.aead.as_ref().expect("salt always produced before streaming");
        for chunk in data.chunks(MAX_CHUNK_LEN) {
            let len_field = (chunk.len() as u16).to_be_bytes();
            let sealed_len = aead.seal(&self.nonce.current(), &len_field);
            self.nonce.increment();
            out.extend_from_slice(&sealed_len);

            let sealed_payload = aead.seal(&self.nonce.current(), chunk);
            self.nonce.increment();
            out.extend_from_slice(&sealed_payload);
        }

        Ok(())
    }

    fn update_decrypt(&mut self, data: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
        self.recv_buf.extend_from_slice(data);

        if let State::AwaitingSalt = self.state {
            let salt_len = self.kind.salt_len();
            if self.recv_buf.len() < salt_len {
                return Ok(());
            }
            let salt = self.recv_buf[..salt_len].to_vec();
            self.recv_buf.drain(..salt_len);
            let session_key = derive_session_key(&self.master_key, &salt, self.kind.key_len());
            self.aead = Some(Aad::new(self.kind, &session_key));
            self.state = State::Streaming;
        }

        let tag_len = self.kind.tag_len();
        loop {
            let len_frame = 2 + tag_len;
            if self.recv_buf.len() < len_frame {
                break;
            }

            let aead = self.aead.as_ref().expect("salt already consumed");
            let len_bytes = aead.open(&self.nonce.current(), &self.recv_buf[..len_frame])?;
            let chunk_len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize & MAX_CHUNK_LEN;

            let payload_frame = chunk_len + tag_len;
            if self.recv_buf.len() < len_frame + payload_frame {
                // Wait for the rest of this chunk before consuming the length field's nonce.
                break;
            }

            self.nonce.increment();
            let payload_start = len_frame;
            let payload_end = payload_start + payload_frame;
            let plaintext = aead.open(&self.nonce.current(), &self.recv_buf[payload_start..payload_end])?;
            self.nonce.increment();

            out.extend_from_slice(&plaintext);
            self.recv_buf.drain(..payload_end);
        }

        Ok(())
    }
}

/// Convenience used by the key-derivation call sites in [`super::derive_master_key`].
pub fn master_key_for(kind: CipherKind, password: &[u8]) -> Vec<u8> {
    derive_master_key(password, kind.key_len())
}
