//! Chunked muxers.
//!
//! A muxer writes encoded samples into a local staging file and streams the
//! file out as [`MuxedSegment`]s while it grows. Two backends exist, chosen
//! by codec: [`KeyframeMuxer`] cuts a segment at every keyframe after the
//! first, [`IntervalMuxer`] cuts one whenever a minimum interval has passed.
//!
//! [`MuxedSegment`]: crate::segment::MuxedSegment

mod interval;
mod keyframe;

use std::path::Path;
use std::sync::Arc;

use liveness_core::Clock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::{BufferInfo, MuxerBackend, VideoFormat};
use crate::segment::OnMuxedSegment;

pub use interval::IntervalMuxer;
pub use keyframe::KeyframeMuxer;

#[derive(Error, Debug)]
pub enum MuxerError {
    #[error("staging file I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("muxer not started")]
    NotStarted,
    #[error("empty sample buffer")]
    EmptySample,
    #[error("sample of {0} bytes does not fit in a record")]
    SampleTooLarge(usize),
}

/// Chunking thresholds. Empirically tuned; keep them configurable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxerConfig {
    /// Minimum time between two interval-backend notifications.
    pub min_chunk_interval_ms: u64,
    /// First-chunk floor for the interval backend.
    pub interval_first_chunk_min_bytes: u64,
    /// First-chunk floor for the keyframe backend.
    pub keyframe_first_chunk_min_bytes: u64,
}

impl Default for MuxerConfig {
    fn default() -> Self {
        Self {
            min_chunk_interval_ms: 100,
            interval_first_chunk_min_bytes: 10_000,
            keyframe_first_chunk_min_bytes: 100,
        }
    }
}

/// Contract shared by both backends. All calls come from one worker.
pub trait LivenessMuxer: Send {
    /// Open `output` for writing and begin a new stream.
    fn start(
        &mut self,
        output: &Path,
        format: &VideoFormat,
        on_segment: OnMuxedSegment,
    ) -> Result<(), MuxerError>;

    /// Append one encoded sample. Failures drop the sample and are logged.
    fn write(&mut self, data: &[u8], info: &BufferInfo);

    /// Flush, send the final partial chunk and delete the staging file.
    /// Best-effort; never fails.
    fn stop(&mut self);
}

/// Builds started muxers. Construction may fail and is retried by the caller.
pub trait MuxerFactory: Send + Sync {
    fn create(
        &self,
        output: &Path,
        format: &VideoFormat,
        on_segment: OnMuxedSegment,
    ) -> Result<Box<dyn LivenessMuxer>, MuxerError>;
}

/// Picks the backend for the negotiated codec.
pub struct DefaultMuxerFactory {
    config: MuxerConfig,
    clock: Arc<dyn Clock>,
}

impl DefaultMuxerFactory {
    pub fn new(config: MuxerConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }
}

impl MuxerFactory for DefaultMuxerFactory {
    fn create(
        &self,
        output: &Path,
        format: &VideoFormat,
        on_segment: OnMuxedSegment,
    ) -> Result<Box<dyn LivenessMuxer>, MuxerError> {
        let mut muxer: Box<dyn LivenessMuxer> = match format.codec.backend() {
            MuxerBackend::Keyframe => Box::new(KeyframeMuxer::new(&self.config, Arc::clone(&self.clock))),
            MuxerBackend::Interval => Box::new(IntervalMuxer::new(&self.config, Arc::clone(&self.clock))),
        };
        muxer.start(output, format, on_segment)?;
        tracing::debug!(codec = ?format.codec, path = %output.display(), "muxer started");
        Ok(muxer)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    use crate::codec::{BufferInfo, VideoCodec, VideoFormat};
    use crate::container::ContainerWriter;
    use crate::segment::{MuxedSegment, OnMuxedSegment};

    use super::MuxerError;

    pub fn format(codec: VideoCodec) -> VideoFormat {
        VideoFormat {
            codec,
            width: 480,
            height: 640,
            bitrate: 1_000_000,
            frame_rate: 24,
            keyframe_interval_s: 1,
        }
    }

    pub fn staging_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("liveness-media-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    /// Writer whose disk is always full.
    pub struct FailingWriter;

    fn disk_full() -> MuxerError {
        MuxerError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
    }

    impl ContainerWriter for FailingWriter {
        fn write_sample(&mut self, _data: &[u8], _info: &BufferInfo) -> Result<(), MuxerError> {
            Err(disk_full())
        }

        fn finish(&mut self) -> Result<(), MuxerError> {
            Err(disk_full())
        }
    }

    pub fn collector() -> (OnMuxedSegment, Arc<Mutex<Vec<MuxedSegment>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&sent);
        (Arc::new(move |s| sink.lock().unwrap().push(s)), sent)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::codec::VideoCodec;
    use liveness_core::ManualClock;

    #[test]
    fn test_factory_starts_backend_for_codec() {
        let factory = DefaultMuxerFactory::new(MuxerConfig::default(), Arc::new(ManualClock::new(0)));
        for (codec, name) in [(VideoCodec::H264, "factory-h264"), (VideoCodec::Vp8, "factory-vp8")] {
            let path = staging_path(name);
            let (on_segment, _) = collector();
            let mut muxer = factory.create(&path, &format(codec), on_segment).unwrap();
            assert!(path.exists());
            muxer.stop();
            assert!(!path.exists());
        }
    }

    #[test]
    fn test_factory_fails_for_missing_directory() {
        let factory = DefaultMuxerFactory::new(MuxerConfig::default(), Arc::new(ManualClock::new(0)));
        let path = staging_path("missing").join("nested").join("file");
        let (on_segment, _) = collector();
        let result = factory.create(&path, &format(VideoCodec::H264), on_segment);
        assert!(matches!(result, Err(MuxerError::Io(_))));
    }
}
