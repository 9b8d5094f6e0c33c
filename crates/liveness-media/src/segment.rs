use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

/// A byte range of the staging file, ready to upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxedSegment {
    pub bytes: Vec<u8>,
    /// Wall-clock time (epoch ms) at which this chunk started accumulating.
    pub start_ms: i64,
}

pub type OnMuxedSegment = Arc<dyn Fn(MuxedSegment) + Send + Sync>;

/// Follows a growing staging file through a second read handle and hands
/// out whatever has not been sent yet.
pub struct SegmentTracker {
    reader: File,
    offset: u64,
    first_chunk_min_bytes: u64,
    chunk_start_ms: i64,
    on_segment: OnMuxedSegment,
}

impl SegmentTracker {
    pub fn open(
        path: &Path,
        first_chunk_min_bytes: u64,
        chunk_start_ms: i64,
        on_segment: OnMuxedSegment,
    ) -> std::io::Result<Self> {
        Ok(Self {
            reader: File::open(path)?,
            offset: 0,
            first_chunk_min_bytes,
            chunk_start_ms,
            on_segment,
        })
    }

    /// Bytes handed out so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn set_chunk_start(&mut self, start_ms: i64) {
        self.chunk_start_ms = start_ms;
    }

    /// Emit the unsent tail of the file. Returns whether a segment was sent.
    ///
    /// Nothing is sent when there are no new bytes, or when this would be the
    /// first chunk and it is still smaller than the configured floor.
    pub fn notify_chunk(&mut self) -> bool {
        match self.read_unsent() {
            Ok(Some(bytes)) => {
                tracing::trace!(bytes = bytes.len(), offset = self.offset, "muxed segment ready");
                (self.on_segment)(MuxedSegment {
                    bytes,
                    start_ms: self.chunk_start_ms,
                });
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(error = %e, "unable to read muxed segment");
                false
            }
        }
    }

    fn read_unsent(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        let length = self.reader.metadata()?.len();
        let unsent = length.saturating_sub(self.offset);
        if unsent == 0 || (self.offset == 0 && unsent < self.first_chunk_min_bytes) {
            return Ok(None);
        }
        let mut bytes = vec![0u8; unsent as usize];
        self.reader.seek(SeekFrom::Start(self.offset))?;
        self.reader.read_exact(&mut bytes)?;
        self.offset += unsent;
        Ok(Some(bytes))
    }
}
