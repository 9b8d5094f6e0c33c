//! Replays a recorded session script through a coordinator on a manual
//! clock, so runs are deterministic and finish instantly.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use liveness_core::{
    AttemptCounter, Clock, FaceLivenessError, FaceLivenessSession, Landmark, LivenessCheckState,
    LivenessTransport, ManualClock, ManualScheduler, RectF, Scheduler,
};
use liveness_media::{BufferInfo, DefaultMuxerFactory, EncodedFrame, VideoCodec};
use serde::{Deserialize, Serialize};

use crate::config::LivenessConfig;
use crate::coordinator::{CoordinatorDeps, DetectedFace, FrameInput, LivenessCoordinator};
use crate::transport::{RecordingTransport, UploadStats};

const DEFAULT_START_MS: i64 = 1_700_000_000_000;

fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_codec() -> VideoCodec {
    VideoCodec::H264
}

fn default_start_ms() -> i64 {
    DEFAULT_START_MS
}

/// A recorded session. Times are milliseconds relative to `start_ms`.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplayScript {
    #[serde(default = "new_session_id")]
    pub session_id: String,
    #[serde(default = "default_codec")]
    pub codec: VideoCodec,
    /// Epoch milliseconds the recording starts at.
    #[serde(default = "default_start_ms")]
    pub start_ms: i64,
    /// Detector coordinates come from a front camera and need mirroring.
    #[serde(default)]
    pub mirror: bool,
    pub session: FaceLivenessSession,
    #[serde(default)]
    pub session_ready_at_ms: u64,
    #[serde(default)]
    pub start_view_complete_at_ms: Option<u64>,
    #[serde(default)]
    pub cancel_at_ms: Option<u64>,
    #[serde(default)]
    pub disconnect_at_ms: Option<u64>,
    pub frames: Vec<ScriptFrame>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptFrame {
    pub at_ms: u64,
    /// Defaults to one when `face` is present, zero otherwise.
    #[serde(default)]
    pub faces: Option<usize>,
    #[serde(default)]
    pub face: Option<ScriptFace>,
    #[serde(default)]
    pub sample: Option<SampleSpec>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ScriptFace {
    pub rect: RectF,
    pub left_eye: Landmark,
    pub right_eye: Landmark,
    pub mouth: Landmark,
}

/// Size and type of the encoded sample produced for a frame.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SampleSpec {
    pub size: usize,
    #[serde(default)]
    pub keyframe: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplaySummary {
    pub session_id: String,
    pub attempt: u32,
    pub final_state: LivenessCheckState,
    pub failure: Option<String>,
    pub frames: usize,
    pub painted_color_frames: usize,
    pub keyframe_requests: usize,
    #[serde(flatten)]
    pub upload: UploadStats,
    pub stream_sha256: String,
}

pub fn load_script(path: &Path) -> Result<ReplayScript> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read script {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid script {}", path.display()))
}

/// Deterministic payload for a sample; only the size matters downstream.
fn sample_bytes(index: usize, size: usize) -> Vec<u8> {
    (0..size).map(|i| ((index + i) % 251) as u8).collect()
}

fn to_input(index: usize, frame: &ScriptFrame) -> FrameInput {
    let sample = frame.sample.filter(|s| s.size > 0).map(|s| {
        let pts = frame.at_ms as i64 * 1_000;
        EncodedFrame {
            data: sample_bytes(index, s.size),
            info: if s.keyframe {
                BufferInfo::keyframe(pts)
            } else {
                BufferInfo::delta(pts)
            },
        }
    });
    FrameInput {
        face_count: frame.faces.unwrap_or(usize::from(frame.face.is_some())),
        face: frame.face.map(|f| DetectedFace {
            rect: f.rect,
            left_eye: f.left_eye,
            right_eye: f.right_eye,
            mouth: f.mouth,
        }),
        sample,
    }
}

/// Fires each one-shot script event once its time has come.
struct Pending(Option<u64>);

impl Pending {
    fn due(&mut self, now: u64) -> bool {
        match self.0 {
            Some(at) if at <= now => {
                self.0 = None;
                true
            }
            _ => false,
        }
    }
}

pub async fn run(
    script: ReplayScript,
    config: &LivenessConfig,
    transport: Arc<RecordingTransport>,
) -> Result<ReplaySummary> {
    std::fs::create_dir_all(&config.staging_dir).with_context(|| {
        format!("failed to create staging dir {}", config.staging_dir.display())
    })?;

    let clock = Arc::new(ManualClock::new(script.start_ms));
    let scheduler = Arc::new(ManualScheduler::new());
    let deps = CoordinatorDeps {
        clock: Arc::clone(&clock) as Arc<dyn Clock>,
        scheduler: Arc::clone(&scheduler) as Arc<dyn Scheduler>,
        transport: Arc::clone(&transport) as Arc<dyn LivenessTransport>,
        muxer_factory: Arc::new(DefaultMuxerFactory::new(
            config.muxer.clone(),
            Arc::clone(&clock) as Arc<dyn Clock>,
        )),
        attempts: Arc::new(AttemptCounter::new(
            Duration::from_millis(config.engine.attempt_reset_interval_ms),
            Arc::clone(&clock) as Arc<dyn Clock>,
        )),
    };
    let coordinator = LivenessCoordinator::new(&script.session_id, script.codec, config, deps)
        .context("failed to start encoder")?
        .with_mirroring(script.mirror);

    let mut ready = Pending(Some(script.session_ready_at_ms));
    let mut start_view = Pending(script.start_view_complete_at_ms);
    let mut cancel = Pending(script.cancel_at_ms);
    let mut disconnect = Pending(script.disconnect_at_ms);
    let mut session = Some(script.session);
    let mut painted = 0;
    let mut keyframe_requests_seen = 0;

    let mut frames: Vec<&ScriptFrame> = script.frames.iter().collect();
    frames.sort_by_key(|f| f.at_ms);

    for (index, frame) in frames.iter().enumerate() {
        let now = frame.at_ms;
        clock.set(script.start_ms + now as i64);
        scheduler.advance_to(now);

        if ready.due(now) {
            if let Some(session) = session.take() {
                coordinator.on_session_ready(session);
            }
        }
        if start_view.due(now) {
            coordinator.state().on_start_view_complete();
        }
        if cancel.due(now) {
            coordinator.cancel();
        }
        if disconnect.due(now) {
            coordinator.on_service_disconnected();
        }

        // The simulated codec honours sync-frame requests on its next sample.
        let mut input = to_input(index, frame);
        if let Some(sample) = input.sample.as_mut() {
            let requests = coordinator.keyframe_requests();
            if requests > keyframe_requests_seen {
                keyframe_requests_seen = requests;
                sample.info = BufferInfo::keyframe(sample.info.presentation_time_us);
            }
        }

        if coordinator.process_frame(input).await.is_some() {
            painted += 1;
        }
        coordinator.settle().await;
    }

    if session.is_some() {
        tracing::warn!("script ended before the session became ready");
        coordinator.on_service_error(FaceLivenessError::SessionTimedOut { source: None });
    }
    // Events scheduled past the last frame still happen, in script order.
    if cancel.0.is_some() {
        coordinator.cancel();
    }
    if disconnect.0.is_some() {
        coordinator.on_service_disconnected();
    }
    coordinator.destroy().await;
    transport.flush()?;

    let summary = ReplaySummary {
        session_id: script.session_id,
        attempt: coordinator.attempt(),
        final_state: coordinator.state().check_state(),
        failure: coordinator.failure(),
        frames: frames.len(),
        painted_color_frames: painted,
        keyframe_requests: coordinator.keyframe_requests(),
        upload: transport.stats(),
        stream_sha256: transport.stream_digest(),
    };
    tracing::info!(
        session_id = %summary.session_id,
        state = ?summary.final_state,
        segments = summary.upload.video_segments,
        bytes = summary.upload.uploaded_bytes,
        "replay finished"
    );
    Ok(summary)
}
