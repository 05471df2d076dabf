//! Streaming body-hash accumulator: canonicalizer → length limiter → digest.
//!
//! The `l=` limit applies to canonicalized bytes, not input bytes, so the
//! limiter sits between the canonicalizer and the hash context.

use std::io::{self, Write};

use base64::Engine;
use ring::digest::{Context, SHA1_FOR_LEGACY_USE_ONLY, SHA256};

use crate::canonical::{BodyCanonicalizer, Canonicalization};
use crate::crypto::HashAlgorithm;

/// `Write` adapter over a ring digest context.
struct HashWriter {
    ctx: Context,
}

impl HashWriter {
    fn new(algo: HashAlgorithm) -> Self {
        let ctx = match algo {
            HashAlgorithm::Sha1 => Context::new(&SHA1_FOR_LEGACY_USE_ONLY),
            HashAlgorithm::Sha256 => Context::new(&SHA256),
        };
        Self { ctx }
    }

    fn finish(self) -> Vec<u8> {
        self.ctx.finish().as_ref().to_vec()
    }
}

impl Write for HashWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ctx.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Writer that forwards at most `limit` bytes and silently discards the
/// rest, always reporting full consumption so the stream never errors.
struct LimitWriter<W: Write> {
    w: W,
    remaining: u64,
}

impl<W: Write> LimitWriter<W> {
    fn new(w: W, limit: u64) -> Self {
        Self { w, remaining: limit }
    }

    fn into_inner(self) -> W {
        self.w
    }
}

impl<W: Write> Write for LimitWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(buf.len());
        }
        let take = (buf.len() as u64).min(self.remaining) as usize;
        self.w.write_all(&buf[..take])?;
        self.remaining -= take as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.w.flush()
    }
}

/// Computes the `bh=` value of a message body.
///
/// Feed body bytes through [`Write`], then call [`finish`](Self::finish)
/// exactly once to obtain the base64 digest. Writing is infallible.
pub struct BodyHasher {
    canon: BodyCanonicalizer<LimitWriter<HashWriter>>,
}

impl BodyHasher {
    /// `limit` is the `l=` tag: `None` hashes the whole canonical body,
    /// `Some(n)` hashes the first `n` canonicalized bytes (`Some(0)` hashes
    /// nothing).
    pub fn new(canon: Canonicalization, hash_algo: HashAlgorithm, limit: Option<u64>) -> Self {
        let limiter = LimitWriter::new(HashWriter::new(hash_algo), limit.unwrap_or(u64::MAX));
        Self {
            canon: BodyCanonicalizer::new(limiter, canon),
        }
    }

    /// Close the canonicalizer and return the base64-encoded digest.
    pub fn finish(self) -> String {
        // The sink is in-memory, so close cannot fail.
        let limiter = self.canon.close().expect("in-memory sink");
        let digest = limiter.into_inner().finish();
        base64::engine::general_purpose::STANDARD.encode(digest)
    }
}

impl Write for BodyHasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.canon.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
