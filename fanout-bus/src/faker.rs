//! Fake header rewrite for containers that are not streamable as produced.
//!
//! The muxer output starts with a length-prefixed box whose content is only
//! final once the whole box was written. The rewriter holds output back until
//! the declared box is complete, replaces it with a fixed `ftyp` box and then
//! proxies the rest of the stream untouched.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    engine::Chunk,
    error::{Result, TranscodeError},
};

pub const FAKE_HEADER_LEN: u32 = 32;

/// The substitute `ftyp` box: major brand `mp42`, minor version 0 and the
/// compatible brands `mp42 mp41 isom iso2`.
pub fn fake_header() -> Bytes {
    let mut buf = BytesMut::with_capacity(FAKE_HEADER_LEN as usize);
    buf.put_u32(FAKE_HEADER_LEN);
    buf.put_slice(b"ftyp");
    buf.put_slice(b"mp42");
    buf.put_u32(0);
    buf.put_slice(b"mp42mp41isomiso2");
    buf.freeze()
}

#[derive(Debug, Default)]
pub struct FakeHeaderRewriter {
    accumulated: BytesMut,
    declared_len: Option<u32>,
    passthrough: bool,
    limit: Option<usize>,
}

impl FakeHeaderRewriter {
    /// Rewriter with an unbounded accumulation buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewriter that fails once more than `limit` bytes are held back.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.passthrough
    }

    pub fn declared_len(&self) -> Option<u32> {
        self.declared_len
    }

    pub fn buffered(&self) -> usize {
        self.accumulated.len()
    }

    /// Feeds produced bytes through the rewriter.
    ///
    /// Returns nothing while the first box is incomplete, then the synthetic
    /// header (as a header chunk) followed by everything past the original
    /// box, and afterwards every input unchanged.
    pub fn push(&mut self, data: Bytes) -> Result<Vec<Chunk>> {
        if self.passthrough {
            return Ok(vec![Chunk::payload(data)]);
        }

        self.accumulated.extend_from_slice(&data);

        if self.declared_len.is_none() {
            if self.accumulated.len() < 8 {
                return self.hold();
            }
            let mut head = &self.accumulated[..8];
            let len = head.get_u32();
            log::debug!(
                "first box {:?} declares {} bytes",
                String::from_utf8_lossy(head),
                len
            );
            self.declared_len = Some(len);
        }

        let declared = self.declared_len.unwrap_or_default() as usize;
        if self.accumulated.len() < declared {
            return self.hold();
        }

        let rest = self.accumulated.split_off(declared).freeze();
        self.accumulated = BytesMut::new();
        self.passthrough = true;

        let mut out = vec![Chunk::header(fake_header())];
        if !rest.is_empty() {
            out.push(Chunk::payload(rest));
        }
        Ok(out)
    }

    fn hold(&self) -> Result<Vec<Chunk>> {
        match self.limit {
            Some(limit) if self.accumulated.len() > limit => {
                Err(TranscodeError::HeaderTooLarge { limit })
            }
            _ => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
#[path = "faker_test.rs"]
mod faker_test;
