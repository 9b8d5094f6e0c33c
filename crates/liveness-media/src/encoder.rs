use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::codec::{EncodedFrame, VideoFormat};
use crate::muxer::{LivenessMuxer, MuxerError, MuxerFactory};
use crate::segment::{MuxedSegment, OnMuxedSegment};

/// Errors reported by the platform encoder.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Recoverable; the codec keeps running.
    #[error("transient codec error: {0}")]
    Transient(String),
    #[error("codec error: {0}")]
    Fatal(String),
}

impl CodecError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("failed to spawn encoder thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("encoder thread exited")]
    ChannelClosed,
}

/// Receives everything the encoder pipeline produces.
pub trait EncoderSink: Send + Sync {
    fn on_segment(&self, segment: MuxedSegment);

    /// Muxer construction kept failing. Reported once per pipeline.
    fn on_muxer_error(&self, _error: &MuxerError) {}

    /// The codec failed in a way it cannot recover from.
    fn on_encoder_error(&self, _error: &EncoderError) {}

    /// Ask the codec for a sync frame.
    fn request_keyframe(&self) {}
}

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub format: VideoFormat,
    pub staging_path: PathBuf,
    /// Failed muxer constructions tolerated before the fatal callback.
    pub max_muxer_attempts: u32,
}

enum EncoderRequest {
    Start,
    Frame(EncodedFrame),
    Stop { reply: oneshot::Sender<()> },
    Flush { reply: oneshot::Sender<()> },
    CodecError(CodecError),
    Destroy,
}

/// Clone-safe handle to the encoder thread.
///
/// Every method is non-blocking; requests are processed in order on the
/// worker.
#[derive(Clone)]
pub struct EncoderHandle {
    tx: mpsc::UnboundedSender<EncoderRequest>,
}

impl EncoderHandle {
    fn send(&self, request: EncoderRequest) -> Result<(), EncoderError> {
        self.tx.send(request).map_err(|_| EncoderError::ChannelClosed)
    }

    /// Begin muxing. Frames before this are discarded.
    pub fn start(&self) -> Result<(), EncoderError> {
        self.send(EncoderRequest::Start)
    }

    pub fn frame(&self, frame: EncodedFrame) -> Result<(), EncoderError> {
        self.send(EncoderRequest::Frame(frame))
    }

    /// Stop muxing. Resolves once the final segment has been emitted.
    pub async fn stop(&self) -> Result<(), EncoderError> {
        let (reply, done) = oneshot::channel();
        self.send(EncoderRequest::Stop { reply })?;
        done.await.map_err(|_| EncoderError::ChannelClosed)
    }

    /// Resolves once every request sent before it has been handled.
    pub async fn flush(&self) -> Result<(), EncoderError> {
        let (reply, done) = oneshot::channel();
        self.send(EncoderRequest::Flush { reply })?;
        done.await.map_err(|_| EncoderError::ChannelClosed)
    }

    pub fn on_codec_error(&self, error: CodecError) -> Result<(), EncoderError> {
        self.send(EncoderRequest::CodecError(error))
    }

    /// Stop the muxer and shut the worker down.
    pub fn destroy(&self) {
        if self.send(EncoderRequest::Destroy).is_err() {
            tracing::debug!("encoder already destroyed");
        }
    }
}

struct EncoderWorker {
    config: EncoderConfig,
    sink: Arc<dyn EncoderSink>,
    factory: Arc<dyn MuxerFactory>,
    on_segment: OnMuxedSegment,
    encoding: bool,
    muxer: Option<Box<dyn LivenessMuxer>>,
    failed_muxer_attempts: u32,
    muxer_error_reported: bool,
    frames_since_keyframe: u32,
}

impl EncoderWorker {
    fn handle_frame(&mut self, frame: EncodedFrame) {
        if !self.encoding {
            return;
        }
        if frame.info.is_keyframe() {
            if self.muxer.is_none() {
                self.create_muxer();
            }
            self.frames_since_keyframe = 0;
        } else {
            self.frames_since_keyframe += 1;
            if self.frames_since_keyframe >= self.config.format.frames_per_keyframe() {
                tracing::debug!(frames = self.frames_since_keyframe, "requesting keyframe");
                self.sink.request_keyframe();
                self.frames_since_keyframe = 0;
            }
        }
        if let Some(muxer) = self.muxer.as_mut() {
            muxer.write(&frame.data, &frame.info);
        }
    }

    /// A failed construction is retried at the next keyframe.
    fn create_muxer(&mut self) {
        let created = self.factory.create(
            &self.config.staging_path,
            &self.config.format,
            Arc::clone(&self.on_segment),
        );
        match created {
            Ok(muxer) => {
                if self.failed_muxer_attempts > 0 {
                    tracing::info!(failed = self.failed_muxer_attempts, "muxer created after retries");
                }
                self.failed_muxer_attempts = 0;
                self.muxer = Some(muxer);
            }
            Err(e) => {
                self.failed_muxer_attempts += 1;
                tracing::error!(
                    error = %e,
                    attempt = self.failed_muxer_attempts,
                    max = self.config.max_muxer_attempts,
                    "failed to create liveness muxer"
                );
                if self.failed_muxer_attempts >= self.config.max_muxer_attempts
                    && !self.muxer_error_reported
                {
                    self.muxer_error_reported = true;
                    self.sink.on_muxer_error(&e);
                }
            }
        }
    }

    fn stop_muxer(&mut self) {
        self.encoding = false;
        if let Some(mut muxer) = self.muxer.take() {
            muxer.stop();
        }
    }

    fn handle_codec_error(&self, error: CodecError) {
        if error.is_transient() {
            tracing::warn!(error = %error, "transient codec error ignored");
        } else {
            tracing::error!(error = %error, "fatal codec error");
            self.sink.on_encoder_error(&EncoderError::Codec(error));
        }
    }
}

/// Spawn the encoder pipeline on a dedicated OS thread.
///
/// Muxer file I/O happens only on that thread, so the frame-processing path
/// never blocks on it.
pub fn spawn_encoder(
    config: EncoderConfig,
    sink: Arc<dyn EncoderSink>,
    factory: Arc<dyn MuxerFactory>,
) -> Result<EncoderHandle, EncoderError> {
    let (tx, mut rx) = mpsc::unbounded_channel::<EncoderRequest>();

    let segment_sink = Arc::clone(&sink);
    let on_segment: OnMuxedSegment = Arc::new(move |segment| segment_sink.on_segment(segment));
    let mut worker = EncoderWorker {
        config,
        sink,
        factory,
        on_segment,
        encoding: false,
        muxer: None,
        failed_muxer_attempts: 0,
        muxer_error_reported: false,
        frames_since_keyframe: 0,
    };

    std::thread::Builder::new()
        .name("liveness-encoder".into())
        .spawn(move || {
            tracing::debug!(codec = ?worker.config.format.codec, "encoder thread started");
            while let Some(request) = rx.blocking_recv() {
                match request {
                    EncoderRequest::Start => {
                        if worker.encoding {
                            tracing::warn!("encoding already started");
                        } else {
                            worker.encoding = true;
                            worker.sink.request_keyframe();
                        }
                    }
                    EncoderRequest::Frame(frame) => worker.handle_frame(frame),
                    EncoderRequest::Stop { reply } => {
                        worker.stop_muxer();
                        let _ = reply.send(());
                    }
                    EncoderRequest::Flush { reply } => {
                        let _ = reply.send(());
                    }
                    EncoderRequest::CodecError(error) => worker.handle_codec_error(error),
                    EncoderRequest::Destroy => {
                        worker.stop_muxer();
                        break;
                    }
                }
            }
            tracing::debug!("encoder thread exiting");
        })
        .map_err(EncoderError::Spawn)?;

    Ok(EncoderHandle { tx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{BufferInfo, VideoCodec};
    use crate::muxer::test_support::{format, staging_path};
    use crate::muxer::{DefaultMuxerFactory, MuxerConfig};
    use liveness_core::ManualClock;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        segments: Mutex<Vec<MuxedSegment>>,
        muxer_errors: AtomicUsize,
        encoder_errors: AtomicUsize,
        keyframe_requests: AtomicUsize,
    }

    impl EncoderSink for RecordingSink {
        fn on_segment(&self, segment: MuxedSegment) {
            self.segments.lock().unwrap().push(segment);
        }

        fn on_muxer_error(&self, _error: &MuxerError) {
            self.muxer_errors.fetch_add(1, Ordering::SeqCst);
        }

        fn on_encoder_error(&self, _error: &EncoderError) {
            self.encoder_errors.fetch_add(1, Ordering::SeqCst);
        }

        fn request_keyframe(&self) {
            self.keyframe_requests.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Fails the first `failures` constructions, then delegates.
    struct FlakyFactory {
        failures: usize,
        calls: AtomicUsize,
        inner: DefaultMuxerFactory,
    }

    impl MuxerFactory for FlakyFactory {
        fn create(
            &self,
            output: &Path,
            format: &VideoFormat,
            on_segment: OnMuxedSegment,
        ) -> Result<Box<dyn LivenessMuxer>, MuxerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(MuxerError::Io(std::io::Error::other("synthetic failure")));
            }
            self.inner.create(output, format, on_segment)
        }
    }

    fn setup(name: &str, failures: usize) -> (EncoderHandle, Arc<RecordingSink>, Arc<FlakyFactory>) {
        let sink = Arc::new(RecordingSink::default());
        let factory = Arc::new(FlakyFactory {
            failures,
            calls: AtomicUsize::new(0),
            inner: DefaultMuxerFactory::new(MuxerConfig::default(), Arc::new(ManualClock::new(0))),
        });
        let config = EncoderConfig {
            format: format(VideoCodec::H264),
            staging_path: staging_path(name),
            max_muxer_attempts: 3,
        };
        let handle = spawn_encoder(
            config,
            Arc::clone(&sink) as Arc<dyn EncoderSink>,
            Arc::clone(&factory) as Arc<dyn MuxerFactory>,
        )
        .unwrap();
        (handle, sink, factory)
    }

    fn keyframe() -> EncodedFrame {
        EncodedFrame {
            data: vec![1; 128],
            info: BufferInfo::keyframe(0),
        }
    }

    fn delta() -> EncodedFrame {
        EncodedFrame {
            data: vec![2; 128],
            info: BufferInfo::delta(0),
        }
    }

    #[tokio::test]
    async fn test_frames_before_start_are_ignored() {
        let (handle, sink, factory) = setup("encoder-idle", 0);
        handle.frame(keyframe()).unwrap();
        handle.flush().await.unwrap();
        assert_eq!(factory.calls.load(Ordering::SeqCst), 0);
        handle.destroy();
        assert!(sink.segments.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_muxer_retry_reports_fatal_once() {
        let (handle, sink, factory) = setup("encoder-retry", 3);
        handle.start().unwrap();
        for _ in 0..3 {
            handle.frame(keyframe()).unwrap();
        }
        handle.flush().await.unwrap();
        assert_eq!(factory.calls.load(Ordering::SeqCst), 3);
        assert_eq!(sink.muxer_errors.load(Ordering::SeqCst), 1);

        // The fourth attempt succeeds and must not report again.
        handle.frame(keyframe()).unwrap();
        handle.frame(delta()).unwrap();
        handle.frame(keyframe()).unwrap();
        handle.flush().await.unwrap();
        assert_eq!(factory.calls.load(Ordering::SeqCst), 4);
        assert_eq!(sink.muxer_errors.load(Ordering::SeqCst), 1);

        handle.stop().await.unwrap();
        assert_eq!(sink.segments.lock().unwrap().len(), 2);
        handle.destroy();
    }

    #[tokio::test]
    async fn test_two_failures_do_not_report() {
        let (handle, sink, factory) = setup("encoder-two", 2);
        handle.start().unwrap();
        for _ in 0..3 {
            handle.frame(keyframe()).unwrap();
        }
        handle.stop().await.unwrap();
        assert_eq!(factory.calls.load(Ordering::SeqCst), 3);
        assert_eq!(sink.muxer_errors.load(Ordering::SeqCst), 0);
        handle.destroy();
    }

    #[tokio::test]
    async fn test_keyframe_requested_after_interval() {
        let (handle, sink, _factory) = setup("encoder-sync", 0);
        handle.start().unwrap();
        handle.frame(keyframe()).unwrap();
        for _ in 0..24 {
            handle.frame(delta()).unwrap();
        }
        handle.flush().await.unwrap();
        // One request on start, one after 24 delta frames.
        assert_eq!(sink.keyframe_requests.load(Ordering::SeqCst), 2);
        handle.destroy();
    }

    #[tokio::test]
    async fn test_codec_errors_split_transient_and_fatal() {
        let (handle, sink, _factory) = setup("encoder-codec", 0);
        handle
            .on_codec_error(CodecError::Transient("reclaimed".into()))
            .unwrap();
        handle.flush().await.unwrap();
        assert_eq!(sink.encoder_errors.load(Ordering::SeqCst), 0);
        handle.on_codec_error(CodecError::Fatal("hw reset".into())).unwrap();
        handle.flush().await.unwrap();
        assert_eq!(sink.encoder_errors.load(Ordering::SeqCst), 1);
        handle.destroy();
    }

    #[tokio::test]
    async fn test_requests_after_destroy_fail() {
        let (handle, _sink, _factory) = setup("encoder-destroy", 0);
        handle.destroy();
        // The worker drops the receiver once it exits.
        let mut closed = false;
        for _ in 0..100 {
            if handle.flush().await.is_err() {
                closed = true;
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(closed);
        handle.destroy();
    }
}
