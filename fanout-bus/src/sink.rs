use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use tokio::{fs::File, io::AsyncWriteExt};

use crate::error::Result;

/// Broadcast flushes happen once more than this many bytes are pending.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 200_000;

enum SinkMode {
    File {
        path: PathBuf,
        file: Option<File>,
    },
    Broadcast {
        pending: BytesMut,
        threshold: usize,
    },
}

/// Terminal stage between the engine output and its consumers.
///
/// In file mode bytes go straight to the destination. In broadcast mode they
/// are coalesced and handed back to the caller as one flush whenever the
/// pending buffer grows past the threshold.
pub struct OutputSink {
    mode: SinkMode,
    segment_seen: bool,
    closed: bool,
    written: u64,
}

impl OutputSink {
    pub fn broadcast(threshold: usize) -> Self {
        Self {
            mode: SinkMode::Broadcast {
                pending: BytesMut::new(),
                threshold,
            },
            segment_seen: false,
            closed: false,
            written: 0,
        }
    }

    pub async fn file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).await?;
        log::info!("sink: writing to {}", path.display());
        Ok(Self {
            mode: SinkMode::File {
                path,
                file: Some(file),
            },
            segment_seen: false,
            closed: false,
            written: 0,
        })
    }

    pub fn is_file(&self) -> bool {
        matches!(self.mode, SinkMode::File { .. })
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn pending_len(&self) -> usize {
        match &self.mode {
            SinkMode::Broadcast { pending, .. } => pending.len(),
            SinkMode::File { .. } => 0,
        }
    }

    /// Total bytes accepted by the sink.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Accepts produced bytes. Returns a flush for the consumers when the
    /// broadcast buffer crossed its threshold. Writes after close are dropped.
    pub async fn write(&mut self, data: Bytes) -> Result<Option<Bytes>> {
        if self.closed {
            return Ok(None);
        }
        self.written += data.len() as u64;

        match &mut self.mode {
            SinkMode::File { file, .. } => {
                if let Some(file) = file.as_mut() {
                    file.write_all(&data).await?;
                }
                Ok(None)
            }
            SinkMode::Broadcast { pending, threshold } => {
                pending.extend_from_slice(&data);
                if pending.len() > *threshold {
                    Ok(Some(pending.split().freeze()))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Handles a segment marker. The first one is expected; a second one
    /// closes the sink. Returns true when this call closed it.
    pub fn on_segment_marker(&mut self) -> bool {
        if !self.segment_seen {
            self.segment_seen = true;
            return false;
        }
        if self.closed {
            return false;
        }
        self.closed = true;
        true
    }

    /// Flushes what is left and closes the sink. The returned bytes, if any,
    /// are the final broadcast flush.
    pub async fn finish(&mut self) -> Result<Option<Bytes>> {
        self.closed = true;
        match &mut self.mode {
            SinkMode::File { path, file } => {
                if let Some(mut file) = file.take() {
                    file.flush().await?;
                    log::info!("sink: closed {} ({} bytes)", path.display(), self.written);
                }
                Ok(None)
            }
            SinkMode::Broadcast { pending, .. } => {
                if pending.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(pending.split().freeze()))
                }
            }
        }
    }

    /// Closes without flushing, dropping anything still pending.
    pub fn abandon(&mut self) {
        self.closed = true;
        match &mut self.mode {
            SinkMode::File { path, file } => {
                if file.take().is_some() {
                    log::warn!("sink: abandoned {} after {} bytes", path.display(), self.written);
                }
            }
            SinkMode::Broadcast { pending, .. } => pending.clear(),
        }
    }
}

#[cfg(test)]
#[path = "sink_test.rs"]
mod sink_test;
