//! Wires one liveness session together: the state machine, the freshness
//! player, the encoder pipeline and the transport.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use liveness_core::freshness::ColorDisplayed;
use liveness_core::geometry::{mirror_landmark, mirror_rect};
use liveness_core::{
    AttemptCounter, ChallengeResponseEvent, Clock, CloseCode, FaceLivenessError,
    FaceLivenessSession, FreshnessColorFrame, FreshnessPlayer, Landmark, LivenessCallbacks,
    LivenessState, LivenessTransport, RectF, Scheduler, VideoEvent,
};
use liveness_media::{
    spawn_encoder, EncodedFrame, EncoderConfig, EncoderError, EncoderHandle, EncoderSink,
    MuxedSegment, MuxerError, MuxerFactory, VideoCodec,
};

use crate::config::LivenessConfig;

/// One face reported by the detector for a frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectedFace {
    pub rect: RectF,
    pub left_eye: Landmark,
    pub right_eye: Landmark,
    pub mouth: Landmark,
}

/// Detector output plus the encoded sample for one camera frame.
#[derive(Debug, Clone, Default)]
pub struct FrameInput {
    pub face_count: usize,
    /// Geometry of the face, when exactly one was found.
    pub face: Option<DetectedFace>,
    pub sample: Option<EncodedFrame>,
}

/// External collaborators of a coordinator.
pub struct CoordinatorDeps {
    pub clock: Arc<dyn Clock>,
    pub scheduler: Arc<dyn Scheduler>,
    pub transport: Arc<dyn LivenessTransport>,
    pub muxer_factory: Arc<dyn MuxerFactory>,
    /// Shared across sessions so retries within the reset window are counted.
    pub attempts: Arc<AttemptCounter>,
}

/// State reachable from the engine and encoder callbacks.
struct Hooks {
    transport: Arc<dyn LivenessTransport>,
    state: OnceLock<LivenessState>,
    encoder: OnceLock<EncoderHandle>,
    failure: Mutex<Option<FaceLivenessError>>,
    keyframe_requests: AtomicUsize,
}

impl Hooks {
    fn session_error(&self, error: FaceLivenessError, stop_session: bool) {
        tracing::error!(error = %error, stop_session, "liveness session failed");
        if let Some(state) = self.state.get() {
            state.on_error(stop_session, Some(error.close_code()));
        }
        let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        if failure.is_none() {
            *failure = Some(error);
        }
    }
}

/// Callback bridge handed to the state machine and the encoder worker. Holds
/// the hooks weakly so neither keeps the session alive.
struct HookRef(Weak<Hooks>);

impl LivenessCallbacks for HookRef {
    fn on_capture_ready(&self) {
        let Some(hooks) = self.0.upgrade() else { return };
        if let Some(encoder) = hooks.encoder.get() {
            if let Err(e) = encoder.start() {
                hooks.session_error(FaceLivenessError::wrap(e), true);
            }
        }
    }

    fn on_face_distance_check_passed(&self) {
        tracing::debug!("face distance check passed");
    }

    fn on_session_error(&self, error: FaceLivenessError, stop_session: bool) {
        if let Some(hooks) = self.0.upgrade() {
            hooks.session_error(error, stop_session);
        }
    }

    fn on_final_events_sent(&self) {
        tracing::info!("final liveness events sent");
    }
}

impl EncoderSink for HookRef {
    fn on_segment(&self, segment: MuxedSegment) {
        let Some(hooks) = self.0.upgrade() else { return };
        tracing::debug!(bytes = segment.bytes.len(), start_ms = segment.start_ms, "uploading segment");
        hooks.transport.send_video_event(VideoEvent {
            bytes: segment.bytes,
            timestamp_ms: segment.start_ms,
        });
    }

    fn on_muxer_error(&self, error: &MuxerError) {
        if let Some(hooks) = self.0.upgrade() {
            hooks.session_error(
                FaceLivenessError::wrap(format!("failed to create video muxer: {error}")),
                true,
            );
        }
    }

    fn on_encoder_error(&self, error: &EncoderError) {
        if let Some(hooks) = self.0.upgrade() {
            hooks.session_error(FaceLivenessError::wrap(format!("video encoder failed: {error}")), true);
        }
    }

    fn request_keyframe(&self) {
        if let Some(hooks) = self.0.upgrade() {
            hooks.keyframe_requests.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Drives one liveness attempt from camera frames to uploaded events.
pub struct LivenessCoordinator {
    hooks: Arc<Hooks>,
    state: LivenessState,
    encoder: EncoderHandle,
    clock: Arc<dyn Clock>,
    target_width: u32,
    mirror: bool,
    attempt: u32,
    freshness: Mutex<Option<FreshnessPlayer>>,
    freshness_complete: Arc<AtomicBool>,
    disconnected: AtomicBool,
    destroyed: AtomicBool,
}

/// Fill a hook slot that must be written exactly once.
fn install_once<T>(slot: &OnceLock<T>, value: T, what: &str) {
    if slot.set(value).is_err() {
        tracing::error!(slot = what, "hook installed twice; keeping the first value");
        debug_assert!(false, "{what} hook installed twice");
    }
}

impl LivenessCoordinator {
    pub fn new(
        session_id: &str,
        codec: VideoCodec,
        config: &LivenessConfig,
        deps: CoordinatorDeps,
    ) -> Result<Self, EncoderError> {
        let attempt = deps.attempts.count_attempt();
        tracing::info!(session_id, attempt, codec = codec.mime_type(), "starting liveness session");

        let hooks = Arc::new(Hooks {
            transport: Arc::clone(&deps.transport),
            state: OnceLock::new(),
            encoder: OnceLock::new(),
            failure: Mutex::new(None),
            keyframe_requests: AtomicUsize::new(0),
        });

        let encoder = spawn_encoder(
            EncoderConfig {
                format: config.video_format(codec),
                staging_path: staging_path(config, session_id),
                max_muxer_attempts: config.max_muxer_attempts,
            },
            Arc::new(HookRef(Arc::downgrade(&hooks))),
            deps.muxer_factory,
        )?;
        install_once(&hooks.encoder, encoder.clone(), "encoder");

        let state = LivenessState::new(
            session_id,
            config.engine.clone(),
            Arc::clone(&deps.clock),
            deps.scheduler,
            Arc::new(HookRef(Arc::downgrade(&hooks))),
        );
        install_once(&hooks.state, state.clone(), "state");

        Ok(Self {
            hooks,
            state,
            encoder,
            clock: deps.clock,
            target_width: config.engine.target_width,
            mirror: false,
            attempt,
            freshness: Mutex::new(None),
            freshness_complete: Arc::new(AtomicBool::new(false)),
            disconnected: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Mirror detector coordinates horizontally, as for a front camera.
    pub fn with_mirroring(mut self, mirror: bool) -> Self {
        self.mirror = mirror;
        self
    }

    pub fn state(&self) -> &LivenessState {
        &self.state
    }

    /// Attempt number of this session within the reset window.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn keyframe_requests(&self) -> usize {
        self.hooks.keyframe_requests.load(Ordering::Relaxed)
    }

    /// Message of the first error that ended the session, if any.
    pub fn failure(&self) -> Option<String> {
        self.hooks
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(FaceLivenessError::message)
    }

    /// The service accepted the session and delivered its challenges.
    pub fn on_session_ready(&self, session: FaceLivenessSession) {
        self.state
            .on_liveness_session_ready(session, Arc::clone(&self.hooks.transport));
    }

    /// The service reported an error while the session was open.
    pub fn on_service_error(&self, error: FaceLivenessError) {
        let stop = matches!(error, FaceLivenessError::UnsupportedChallengeType);
        self.hooks.session_error(error, stop);
    }

    /// The service closed the connection after receiving the final events.
    pub fn on_service_disconnected(&self) {
        tracing::info!(session_id = %self.state.session_id(), "service disconnected");
        self.disconnected.store(true, Ordering::SeqCst);
    }

    pub fn cancel(&self) {
        self.hooks.session_error(FaceLivenessError::UserCancelled, true);
    }

    /// Process one camera frame. Returns the freshness colors to paint, if
    /// the color sequence is playing.
    pub async fn process_frame(&self, frame: FrameInput) -> Option<FreshnessColorFrame> {
        if let Some(sample) = frame.sample {
            if let Err(e) = self.encoder.frame(sample) {
                tracing::warn!(error = %e, "encoder unavailable; frame dropped");
            }
        }

        if self.state.on_frame_available() {
            self.state.on_frame_face_count_update(frame.face_count);
            if frame.face_count == 1 {
                if let Some(face) = frame.face {
                    let face = if self.mirror { self.mirrored(face) } else { face };
                    self.state
                        .on_frame_face_update(face.rect, face.left_eye, face.right_eye, face.mouth);
                }
            }
        }

        if self.state.check_state().is_terminal() {
            return None;
        }
        let colors = self.step_freshness();

        if self.freshness_complete.swap(false, Ordering::SeqCst) {
            self.state.on_liveness_challenge_complete();
            if let Err(e) = self.encoder.stop().await {
                tracing::warn!(error = %e, "encoder stop failed");
            }
            self.state.on_full_challenge_complete();
        }
        colors
    }

    /// Resolves once the encoder has handled every frame sent so far.
    pub async fn settle(&self) {
        if let Err(e) = self.encoder.flush().await {
            tracing::debug!(error = %e, "encoder gone");
        }
    }

    fn mirrored(&self, face: DetectedFace) -> DetectedFace {
        DetectedFace {
            rect: mirror_rect(&face.rect, self.target_width),
            left_eye: mirror_landmark(face.left_eye, self.target_width),
            right_eye: mirror_landmark(face.right_eye, self.target_width),
            mouth: mirror_landmark(face.mouth, self.target_width),
        }
    }

    fn step_freshness(&self) -> Option<FreshnessColorFrame> {
        let mut freshness = self.freshness.lock().unwrap_or_else(PoisonError::into_inner);
        if freshness.is_none() {
            if let Some(challenge) = self.state.start_freshness() {
                tracing::info!(
                    challenge_id = %challenge.challenge_id,
                    colors = challenge.colors.len(),
                    "starting color sequence"
                );
                let transport = Arc::clone(&self.hooks.transport);
                let challenge_id = challenge.challenge_id.clone();
                let complete = Arc::clone(&self.freshness_complete);
                *freshness = Some(FreshnessPlayer::new(
                    &challenge.colors,
                    Box::new(move |shown: ColorDisplayed| {
                        transport.send_challenge_response(ChallengeResponseEvent::ColorChallengeResponse {
                            challenge_id: challenge_id.clone(),
                            current_color: shown.current,
                            previous_color: shown.previous,
                            sequence_number: shown.sequence_number,
                            color_start_ms: shown.timestamp_ms,
                        });
                    }),
                    Box::new(move || complete.store(true, Ordering::SeqCst)),
                ));
            }
        }
        freshness
            .as_mut()
            .and_then(|player| player.next_frame(self.clock.now_ms()))
    }

    /// Release the encoder and close the session. Uses the disposed close
    /// code unless the service already disconnected. Idempotent.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.encoder.stop().await {
            tracing::debug!(error = %e, "encoder already stopped");
        }
        self.encoder.destroy();
        let close_code = if self.disconnected.load(Ordering::SeqCst) {
            None
        } else {
            Some(CloseCode::Disposed)
        };
        self.state.on_destroy(true, close_code);
    }
}

fn staging_path(config: &LivenessConfig, session_id: &str) -> PathBuf {
    config.staging_dir.join(format!("{session_id}.video"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RecordingTransport;
    use liveness_core::{
        ColorChallenge, ColorChallengeType, ColorSpec, FaceTargetChallenge,
        FaceTargetMatchingParameters, LivenessCheckState, ManualClock, ManualScheduler, RgbColor,
        SessionChallenge,
    };
    use liveness_media::{BufferInfo, DefaultMuxerFactory, MuxerConfig};
    use std::time::Duration;

    const MATCHED_FACE: RectF = RectF::new(145.0, 180.0, 335.0, 465.0);

    struct Fixture {
        coordinator: LivenessCoordinator,
        clock: Arc<ManualClock>,
        scheduler: Arc<ManualScheduler>,
        transport: Arc<RecordingTransport>,
        elapsed_ms: u64,
    }

    impl Fixture {
        fn new(name: &str) -> Self {
            let clock = Arc::new(ManualClock::new(1_000_000));
            let scheduler = Arc::new(ManualScheduler::new());
            let transport = Arc::new(RecordingTransport::new());
            let mut config = LivenessConfig::default();
            config.staging_dir = std::env::temp_dir().join(format!("liveness-cli-coord-{}", std::process::id()));
            std::fs::create_dir_all(&config.staging_dir).unwrap();
            config.engine.face_match_debounce_ms = 100;
            let deps = CoordinatorDeps {
                clock: Arc::clone(&clock) as Arc<dyn Clock>,
                scheduler: Arc::clone(&scheduler) as Arc<dyn Scheduler>,
                transport: Arc::clone(&transport) as Arc<dyn LivenessTransport>,
                muxer_factory: Arc::new(DefaultMuxerFactory::new(
                    MuxerConfig::default(),
                    Arc::clone(&clock) as Arc<dyn Clock>,
                )),
                attempts: Arc::new(AttemptCounter::new(
                    Duration::from_secs(300),
                    Arc::clone(&clock) as Arc<dyn Clock>,
                )),
            };
            let coordinator = LivenessCoordinator::new(name, VideoCodec::H264, &config, deps).unwrap();
            Self {
                coordinator,
                clock,
                scheduler,
                transport,
                elapsed_ms: 0,
            }
        }

        fn tick(&mut self, ms: u64) {
            self.elapsed_ms += ms;
            self.clock.advance(ms as i64);
            self.scheduler.advance_to(self.elapsed_ms);
        }

        async fn frame(&mut self, face: Option<RectF>, keyframe: bool) -> Option<FreshnessColorFrame> {
            self.tick(40);
            let pts = self.elapsed_ms as i64 * 1_000;
            let info = if keyframe { BufferInfo::keyframe(pts) } else { BufferInfo::delta(pts) };
            let input = FrameInput {
                face_count: usize::from(face.is_some()),
                face: face.map(|rect| DetectedFace {
                    rect,
                    left_eye: Landmark::new(25.0, 40.0),
                    right_eye: Landmark::new(75.0, 40.0),
                    mouth: Landmark::new(40.0, 80.0),
                }),
                sample: Some(EncodedFrame {
                    data: vec![9; 256],
                    info,
                }),
            };
            let colors = self.coordinator.process_frame(input).await;
            self.coordinator.settle().await;
            colors
        }
    }

    fn session() -> FaceLivenessSession {
        FaceLivenessSession {
            challenge_id: "challenge-1".into(),
            challenges: vec![
                SessionChallenge::FaceTarget(FaceTargetChallenge {
                    target_center_x: 240.0,
                    target_center_y: 320.0,
                    target_width: 200.0,
                    target_height: 300.0,
                    matching: FaceTargetMatchingParameters {
                        target_iou_threshold: 0.7,
                        target_iou_width_threshold: 0.25,
                        target_iou_height_threshold: 0.25,
                        face_iou_width_threshold: 0.15,
                        face_iou_height_threshold: 0.15,
                        face_distance_threshold_min: 0.32,
                        oval_fit_timeout_ms: 7_000,
                    },
                }),
                SessionChallenge::Color(ColorChallenge {
                    challenge_id: "color-1".into(),
                    challenge_type: ColorChallengeType::Sequential,
                    colors: vec![
                        ColorSpec {
                            color: RgbColor::new(255, 0, 0),
                            duration_ms: 80,
                            should_scroll: false,
                        },
                        ColorSpec {
                            color: RgbColor::new(0, 0, 255),
                            duration_ms: 80,
                            should_scroll: true,
                        },
                    ],
                }),
            ],
        }
    }

    #[tokio::test]
    async fn test_full_session_uploads_video_before_end_of_stream() {
        let mut f = Fixture::new("coord-full");
        assert_eq!(f.coordinator.attempt(), 1);
        f.coordinator.on_session_ready(session());

        // Match, hold past the debounce window, then play both colors.
        let mut painted = 0;
        for i in 0..20 {
            if f.frame(Some(MATCHED_FACE), i % 4 == 0).await.is_some() {
                painted += 1;
            }
            if f.coordinator.state().check_state().is_terminal() {
                break;
            }
        }
        assert!(painted > 0);
        assert!(matches!(f.coordinator.state().check_state(), LivenessCheckState::Success(_)));

        // The next frame flushes the final events.
        f.frame(Some(MATCHED_FACE), false).await;
        let stats = f.transport.stats();
        assert!(stats.end_of_stream_sent);
        assert!(stats.video_segments >= 1);
        assert_eq!(stats.color_responses, 2);
        // Initial face, two colors, face target response.
        assert_eq!(stats.challenge_responses, 4);

        f.coordinator.on_service_disconnected();
        f.coordinator.destroy().await;
        f.coordinator.destroy().await;
        assert_eq!(f.transport.stats().stops, vec![None]);
        assert!(f.coordinator.failure().is_none());
    }

    #[tokio::test]
    async fn test_destroy_without_disconnect_uses_disposed_code() {
        let f = Fixture::new("coord-dispose");
        f.coordinator.on_session_ready(session());
        f.coordinator.destroy().await;
        assert_eq!(f.transport.stats().stops, vec![Some(4008)]);
    }

    #[tokio::test]
    async fn test_cancel_stops_session_once_with_canceled_code() {
        let f = Fixture::new("coord-cancel");
        f.coordinator.on_session_ready(session());
        f.coordinator.cancel();
        assert_eq!(f.coordinator.state().check_state(), LivenessCheckState::Error);
        assert_eq!(
            f.coordinator.failure().as_deref(),
            Some("User cancelled the face liveness check.")
        );
        f.coordinator.destroy().await;
        assert_eq!(f.transport.stats().stops, vec![Some(4003)]);
    }

    #[tokio::test]
    async fn test_oval_timeout_fails_with_timeout_code() {
        let mut f = Fixture::new("coord-timeout");
        f.coordinator.on_session_ready(session());
        let small = RectF::new(220.0, 280.0, 260.0, 360.0);
        f.frame(Some(small), true).await;
        f.tick(7_000);
        assert_eq!(f.coordinator.state().check_state(), LivenessCheckState::Error);
        assert_eq!(f.transport.stats().stops, vec![Some(4001)]);
        assert_eq!(
            f.coordinator.failure().as_deref(),
            Some("Face did not match oval within time limit.")
        );
    }

    #[tokio::test]
    async fn test_service_errors_stop_only_for_unsupported_challenge() {
        let f = Fixture::new("coord-service");
        f.coordinator.on_service_error(FaceLivenessError::SessionTimedOut { source: None });
        assert!(f.transport.stats().stops.is_empty());

        let g = Fixture::new("coord-unsupported");
        g.coordinator.on_session_ready(session());
        g.coordinator.on_service_error(FaceLivenessError::UnsupportedChallengeType);
        assert_eq!(g.transport.stats().stops, vec![Some(4005)]);
    }

    #[test]
    fn test_install_once_fills_empty_slot() {
        let slot = OnceLock::new();
        install_once(&slot, 7u32, "value");
        assert_eq!(slot.get(), Some(&7));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "value hook installed twice")]
    fn test_install_once_rejects_second_value() {
        let slot = OnceLock::new();
        install_once(&slot, 7u32, "value");
        install_once(&slot, 8u32, "value");
    }
}
