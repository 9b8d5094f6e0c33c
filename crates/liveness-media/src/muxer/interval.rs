use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use liveness_core::Clock;

use super::{LivenessMuxer, MuxerConfig, MuxerError};
use crate::codec::{BufferInfo, VideoFormat};
use crate::container::{ClusterWriter, ContainerWriter};
use crate::segment::{OnMuxedSegment, SegmentTracker};

/// Streaming-container backend. Notifies opportunistically before each write
/// once the minimum chunk interval has passed, regardless of frame type.
pub struct IntervalMuxer {
    min_chunk_interval_ms: i64,
    first_chunk_min_bytes: u64,
    clock: Arc<dyn Clock>,
    writer: Option<Box<dyn ContainerWriter>>,
    tracker: Option<SegmentTracker>,
    output: Option<PathBuf>,
    /// Starts at zero so the first write is eligible to notify.
    last_notification_ms: i64,
}

impl IntervalMuxer {
    pub fn new(config: &MuxerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            min_chunk_interval_ms: config.min_chunk_interval_ms as i64,
            first_chunk_min_bytes: config.interval_first_chunk_min_bytes,
            clock,
            writer: None,
            tracker: None,
            output: None,
            last_notification_ms: 0,
        }
    }
}

impl LivenessMuxer for IntervalMuxer {
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
        self.writer = Some(Box::new(ClusterWriter::new(file, format)?));
        Ok(())
    }

    fn write(&mut self, data: &[u8], info: &BufferInfo) {
        let now = self.clock.now_ms();
        if now - self.last_notification_ms >= self.min_chunk_interval_ms {
            if let Some(tracker) = self.tracker.as_mut() {
                if tracker.notify_chunk() {
                    self.last_notification_ms = now;
                    tracker.set_chunk_start(now);
                }
            }
        }

        let written = match self.writer.as_mut() {
            Some(writer) => writer.write_sample(data, info),
            None => Err(MuxerError::NotStarted),
        };
        if let Err(e) = written {
            tracing::error!(error = %e, "failed to write encoded sample to muxer; dropping frame");
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

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::codec::VideoCodec;
    use liveness_core::ManualClock;

    #[test]
    fn test_first_chunk_waits_for_floor_then_interval_gates() {
        let clock = Arc::new(ManualClock::new(50_000));
        let mut muxer = IntervalMuxer::new(&MuxerConfig::default(), Arc::clone(&clock) as Arc<dyn Clock>);
        let path = staging_path("interval-floor");
        let (on_segment, sent) = collector();
        muxer.start(&path, &format(VideoCodec::Vp8), on_segment).unwrap();

        // Each 4 000-byte sample adds 4 020 bytes (plus 12 for a cluster).
        muxer.write(&[1u8; 4_000], &BufferInfo::keyframe(0));
        clock.advance(200);
        muxer.write(&[1u8; 4_000], &BufferInfo::delta(1));
        assert!(sent.lock().unwrap().is_empty());

        clock.advance(200);
        muxer.write(&[1u8; 4_000], &BufferInfo::delta(2));
        assert!(sent.lock().unwrap().is_empty());

        clock.advance(200);
        muxer.write(&[1u8; 4_000], &BufferInfo::delta(3));
        assert_eq!(sent.lock().unwrap().len(), 1);
        assert_eq!(sent.lock().unwrap()[0].start_ms, 50_000);

        // Within the minimum interval: no notification.
        clock.advance(50);
        muxer.write(&[1u8; 4_000], &BufferInfo::delta(4));
        assert_eq!(sent.lock().unwrap().len(), 1);

        clock.advance(50);
        muxer.write(&[1u8; 4_000], &BufferInfo::delta(5));
        assert_eq!(sent.lock().unwrap().len(), 2);
        assert_eq!(sent.lock().unwrap()[1].start_ms, 50_600);

        muxer.stop();
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        let total: usize = sent.iter().map(|s| s.bytes.len()).sum();
        assert_eq!(total, 18 + 12 + 6 * 4_020);
        assert!(!path.exists());
    }

    #[test]
    fn test_small_stream_never_reaches_first_chunk_floor() {
        let clock = Arc::new(ManualClock::new(10_000));
        let mut muxer = IntervalMuxer::new(&MuxerConfig::default(), Arc::clone(&clock) as Arc<dyn Clock>);
        let path = staging_path("interval-small");
        let (on_segment, sent) = collector();
        muxer.start(&path, &format(VideoCodec::Vp9), on_segment).unwrap();
        for i in 0..5 {
            clock.advance(150);
            muxer.write(&[2u8; 100], &BufferInfo::delta(i));
        }
        muxer.stop();
        assert!(sent.lock().unwrap().is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn test_stop_sends_tail_and_deletes_file_when_close_fails() {
        let clock = Arc::new(ManualClock::new(50_000));
        let mut muxer = IntervalMuxer::new(&MuxerConfig::default(), Arc::clone(&clock) as Arc<dyn Clock>);
        let path = staging_path("interval-close-fails");
        let (on_segment, sent) = collector();
        muxer.start(&path, &format(VideoCodec::Vp8), on_segment).unwrap();

        muxer.write(&[4u8; 4_000], &BufferInfo::keyframe(0));
        muxer.write(&[4u8; 4_000], &BufferInfo::delta(1));
        muxer.write(&[4u8; 4_000], &BufferInfo::delta(2));
        assert!(sent.lock().unwrap().is_empty());

        muxer.writer = Some(Box::new(FailingWriter));
        muxer.stop();

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].bytes.len(), 18 + 12 + 3 * 4_020);
        assert!(!path.exists());
    }
}
