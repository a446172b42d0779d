//! Binds a `TcpStream` to its per-session cipher contexts. This is the "cipher binding"
//! component from the system overview: every byte sent upstream passes through
//! `encrypt`, every byte received from upstream passes through `decrypt`, and for a
//! direct/ACL-bypass Session both are simply absent.
//!
//! [`CryptoStream`] is used whole during the connect phase (the first encrypted segment,
//! and any leftover tail a partial Fast Open send didn't fit in the SYN). Once streaming
//! starts, [`CryptoStream::into_split`] hands back an independent read half and write
//! half so the two directions of a Session can be driven by two concurrently polled
//! futures instead of one alternating between them — see `local::session::stream_loop`.

use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::crypto::Cipher;

use super::BUFFER_SIZE;

/// One direction's raw socket plus its (optional) cipher context. A `CryptoHalf` never
/// assumes the buffer handed back by `Cipher::update` is the same allocation it was
/// given — the transformation always returns a freshly owned buffer (design notes,
/// "buffer ownership across cipher calls").
pub struct CryptoStream {
    stream: TcpStream,
    encrypt: Option<Cipher>,
    decrypt: Option<Cipher>,
}

impl CryptoStream {
    pub fn new(stream: TcpStream, encrypt: Option<Cipher>, decrypt: Option<Cipher>) -> CryptoStream {
        CryptoStream { stream, encrypt, decrypt }
    }

    /// Encrypts (if applicable) and fully writes `plaintext`. `write_all` is the async
    /// translation of the spec's explicit `(buf_idx, buf_len)` partial-send bookkeeping:
    /// it suspends the task until every byte is drained, which is the backpressure
    /// mechanism invariant #2 describes, without needing an explicit watcher flag.
    pub async fn send(&mut self, plaintext: &[u8]) -> io::Result<()> {
        match &mut self.encrypt {
            Some(cipher) => {
                let mut out = Vec::with_capacity(plaintext.len() + 32);
                cipher.update(plaintext, &mut out)?;
                self.stream.write_all(&out).await
            }
            None => self.stream.write_all(plaintext).await,
        }
    }

    /// Writes bytes that are already on the wire format for this direction (e.g. the
    /// leftover tail of a first segment Fast Open couldn't fit in the SYN), without
    /// passing them through `encrypt` a second time.
    pub async fn send_raw(&mut self, wire_bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(wire_bytes).await
    }

    /// Splits into an independent read half and write half so the client-bound and
    /// upstream-bound directions can be driven by two separately polled futures — the
    /// concurrency invariant #2 requires (each endpoint's two directions are armed and
    /// drained independently) and which a single alternating loop cannot provide, since
    /// `tokio::select!` only polls the arm it is currently suspended in.
    pub fn into_split(self) -> (CryptoReadHalf, CryptoWriteHalf) {
        let (read, write) = self.stream.into_split();
        (CryptoReadHalf { reader: read, decrypt: self.decrypt }, CryptoWriteHalf { writer: write, encrypt: self.encrypt })
    }
}

/// The read half of a split [`CryptoStream`]: the upstream-facing socket's read side plus
/// its (optional) decrypt context.
pub struct CryptoReadHalf {
    reader: OwnedReadHalf,
    decrypt: Option<Cipher>,
}

impl CryptoReadHalf {
    /// Reads one chunk of raw bytes and decrypts (if applicable) whatever complete
    /// plaintext that chunk yields. Returns `Ok(None)` on clean EOF. A `Some(vec)` with
    /// an empty `vec` is possible when a raw read only completed part of an AEAD chunk —
    /// the idle timer still resets on non-empty *raw* receive activity either way.
    pub async fn recv(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut raw = [0u8; BUFFER_SIZE];
        let n = self.reader.read(&mut raw).await?;
        if n == 0 {
            return Ok(None);
        }

        match &mut self.decrypt {
            Some(cipher) => {
                let mut out = Vec::with_capacity(n);
                cipher.update(&raw[..n], &mut out)?;
                Ok(Some(out))
            }
            None => Ok(Some(raw[..n].to_vec())),
        }
    }
}

/// The write half of a split [`CryptoStream`]: the upstream-facing socket's write side
/// plus its (optional) encrypt context.
pub struct CryptoWriteHalf {
    writer: OwnedWriteHalf,
    encrypt: Option<Cipher>,
}

impl CryptoWriteHalf {
    pub async fn send(&mut self, plaintext: &[u8]) -> io::Result<()> {
        match &mut self.encrypt {
            Some(cipher) => {
                let mut out = Vec::with_capacity(plaintext.len() + 32);
                cipher.update(plaintext, &mut out)?;
                self.writer.write_all(&out).await
            }
            None => self.writer.write_all(plaintext).await,
        }
    }
}
