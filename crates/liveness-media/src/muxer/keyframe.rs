use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use liveness_core::Clock;

use super::{LivenessMuxer, MuxerConfig, MuxerError};
use crate::codec::{BufferInfo, VideoFormat};
use crate::container::{ContainerWriter, FragmentedWriter};
use crate::segment::{OnMuxedSegment, SegmentTracker};

/// Fragmented-container backend. Each keyframe closes the previous fragment,
/// which then becomes a segment.
pub struct KeyframeMuxer {
    first_chunk_min_bytes: u64,
    clock: Arc<dyn Clock>,
    writer: Option<Box<dyn ContainerWriter>>,
    tracker: Option<SegmentTracker>,
    output: Option<PathBuf>,
    first_keyframe_received: bool,
}

impl KeyframeMuxer {
    pub fn new(config: &MuxerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            first_chunk_min_bytes: config.keyframe_first_chunk_min_bytes,
            clock,
            writer: None,
            tracker: None,
            output: None,
            first_keyframe_received: false,
        }
    }
}

impl LivenessMuxer for KeyframeMuxer {
    fn start(
        &mut self,
        output: &Path,
        format: &VideoFormat,
        on_segment: OnMuxedSegment,
    ) -> Result<(), MuxerError> {
        let file = File::create(output)?;
        self.output = Some(output.to_path_buf());
        self.tracker = Some(SegmentTracker::open(
            output,
            self.first_chunk_min_bytes,
            self.clock.now_ms(),
            on_segment,
        )?);
        self.writer = Some(Box::new(FragmentedWriter::new(file, format)?));
        Ok(())
    }

    fn write(&mut self, data: &[u8], info: &BufferInfo) {
        let written = match self.writer.as_mut() {
            Some(writer) => writer.write_sample(data, info),
            None => Err(MuxerError::NotStarted),
        };
        if let Err(e) = written {
            tracing::error!(error = %e, "failed to write encoded sample to muxer; dropping frame");
        }

        // A lone keyframe is not streamable yet; the first one only arms
        // segmentation.
        if info.is_keyframe() {
            if !self.first_keyframe_received {
                self.first_keyframe_received = true;
            } else if let Some(tracker) = self.tracker.as_mut() {
                if tracker.notify_chunk() {
                    tracker.set_chunk_start(self.clock.now_ms());
                }
            }
        }
    }

    fn stop(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.finish() {
                tracing::debug!(error = %e, "muxer close failed");
            }
        }
        if let Some(mut tracker) = self.tracker.take() {
            tracker.notify_chunk();
        }
        if let Some(path) = self.output.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::debug!(error = %e, path = %path.display(), "failed to delete staging file");
            }
        }
    }
}
