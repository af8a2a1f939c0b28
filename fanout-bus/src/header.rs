use bytes::{Buf, Bytes, BytesMut};

use crate::engine::Chunk;

/// Give up looking for a container header after this many bytes.
pub const MAX_PROBE_BYTES: usize = 64 * 1024;

/// Header chunks that must prefix every client's byte stream.
///
/// The cache stays open while consecutive header chunks arrive and is sealed
/// by the first payload chunk. Once sealed it never changes until cleared on
/// teardown.
#[derive(Debug, Default)]
pub struct HeaderCache {
    chunks: Vec<Bytes>,
    sealed: bool,
}

impl HeaderCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a header chunk. Returns false if the cache is already sealed.
    pub fn push(&mut self, chunk: Bytes) -> bool {
        if self.sealed {
            return false;
        }
        self.chunks.push(chunk);
        true
    }

    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn is_set(&self) -> bool {
        !self.chunks.is_empty()
    }

    pub fn chunks(&self) -> &[Bytes] {
        &self.chunks
    }

    pub fn size(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.sealed = true;
    }
}

/// How to find the structural header in a raw container byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderProbe {
    /// The container has no header worth replaying.
    None,
    /// RIFF/WAVE: everything up to and including the `data` chunk header.
    Riff,
}

#[derive(Debug, PartialEq, Eq)]
enum ProbeResult {
    NeedMore,
    Found(usize),
    NotFound,
}

fn riff_header_len(buf: &[u8]) -> ProbeResult {
    if buf.len() < 12 {
        return if b"RIFF".starts_with(&buf[..buf.len().min(4)]) {
            ProbeResult::NeedMore
        } else {
            ProbeResult::NotFound
        };
    }
    if &buf[..4] != b"RIFF" || &buf[8..12] != b"WAVE" {
        return ProbeResult::NotFound;
    }

    let mut offset = 12;
    loop {
        if buf.len() < offset + 8 {
            return ProbeResult::NeedMore;
        }
        let mut head = &buf[offset..offset + 8];
        let mut id = [0u8; 4];
        head.copy_to_slice(&mut id);
        let size = head.get_u32_le() as usize;
        if &id == b"data" {
            return ProbeResult::Found(offset + 8);
        }
        // chunks are word aligned
        offset += 8 + size + (size & 1);
        if offset > MAX_PROBE_BYTES {
            return ProbeResult::NotFound;
        }
    }
}

/// Splits a raw output stream into header and payload chunks.
pub struct HeaderSplitter {
    probe: HeaderProbe,
    pending: BytesMut,
    done: bool,
}

impl HeaderSplitter {
    pub fn new(probe: HeaderProbe) -> Self {
        Self {
            probe,
            pending: BytesMut::new(),
            done: probe == HeaderProbe::None,
        }
    }

    pub fn push(&mut self, data: Bytes) -> Vec<Chunk> {
        if self.done {
            return vec![Chunk::payload(data)];
        }

        self.pending.extend_from_slice(&data);
        let result = match self.probe {
            HeaderProbe::None => ProbeResult::NotFound,
            HeaderProbe::Riff => riff_header_len(&self.pending),
        };

        match result {
            ProbeResult::NeedMore if self.pending.len() <= MAX_PROBE_BYTES => Vec::new(),
            ProbeResult::Found(len) => {
                self.done = true;
                let header = self.pending.split_to(len).freeze();
                let rest = self.pending.split().freeze();
                log::debug!("container header found: {} bytes", header.len());
                let mut out = vec![Chunk::header(header)];
                if !rest.is_empty() {
                    out.push(Chunk::payload(rest));
                }
                out
            }
            _ => {
                self.done = true;
                log::debug!("no container header, passing stream through");
                vec![Chunk::payload(self.pending.split().freeze())]
            }
        }
    }

    /// Releases whatever is still held back once the stream ends.
    pub fn finish(&mut self) -> Option<Chunk> {
        self.done = true;
        if self.pending.is_empty() {
            None
        } else {
            Some(Chunk::payload(self.pending.split().freeze()))
        }
    }
}

#[cfg(test)]
#[path = "header_test.rs"]
mod header_test;
