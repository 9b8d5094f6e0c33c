//! Liveness session state machine.
//!
//! [`LivenessState`] is fed by the frame-processing stream (face counts, face
//! geometry, frame availability) and by the session transport (challenge
//! payload). It owns the check state shown to the user and decides when to
//! send challenge-response and video events.
//!
//! Mutations happen under a single lock. Anything that calls out of the state
//! machine (transport sends, user callbacks) is collected as an [`Effect`] and
//! run after the lock is released, so a callback may call straight back into
//! the state machine.

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{CloseCode, FaceLivenessError};
use crate::geometry::{self, FaceOvalPosition};
use crate::model::{
    ChallengeResponseEvent, ColorChallenge, ColorChallengeType, FaceLivenessSession,
    FaceTargetChallenge, InstructionPrompt, Landmark, LivenessCheckState, RectF, VideoEvent,
};
use crate::timer::{Scheduler, TimerHandle};
use crate::transport::LivenessTransport;

/// Match percentage shown before any oval progress is measured.
const INITIAL_MATCH_PERCENTAGE: f32 = 0.25;

/// Side effects requested by the state machine.
///
/// Every method has a no-op default; implement only what you observe.
pub trait LivenessCallbacks: Send + Sync {
    /// The first qualifying face was seen; video capture may begin.
    fn on_capture_ready(&self) {}

    fn on_face_distance_check_passed(&self) {}

    /// A session-level failure. `stop_session` says whether the transport
    /// session should be torn down as a result.
    fn on_session_error(&self, _error: FaceLivenessError, _stop_session: bool) {}

    fn on_final_events_sent(&self) {}
}

/// Callbacks that ignore everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallbacks;

impl LivenessCallbacks for NoopCallbacks {}

/// Read-only view of the state the UI renders.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LivenessSnapshot {
    pub check_state: LivenessCheckState,
    pub face_guide_rect: Option<RectF>,
    pub face_match_percentage: f32,
    pub face_matched: bool,
    pub running_freshness: bool,
}

impl Default for LivenessSnapshot {
    fn default() -> Self {
        Self {
            check_state: LivenessCheckState::default(),
            face_guide_rect: None,
            face_match_percentage: INITIAL_MATCH_PERCENTAGE,
            face_matched: false,
            running_freshness: false,
        }
    }
}

enum Effect {
    CaptureReady,
    DistanceCheckPassed,
    SessionError(FaceLivenessError, bool),
    FinalEventsSent,
    ChallengeResponse(Arc<dyn LivenessTransport>, ChallengeResponseEvent),
    Video(Arc<dyn LivenessTransport>, VideoEvent),
    StopSession(Arc<dyn LivenessTransport>, Option<CloseCode>),
}

struct Inner {
    check_state: LivenessCheckState,
    show_start_view: bool,

    session: Option<FaceLivenessSession>,
    transport: Option<Arc<dyn LivenessTransport>>,
    face_target_challenge: Option<FaceTargetChallenge>,
    color_challenge: Option<ColorChallenge>,

    initial_local_face_found: bool,
    initial_distance_check_passed: bool,
    initial_face_sent: bool,
    ready_for_oval: bool,
    ready_to_send_final_events: bool,

    face_guide_rect: Option<RectF>,
    face_match_percentage: f32,
    initial_face_oval_iou: Option<f32>,
    detected_face_matched_oval: bool,
    face_match_oval_start: Option<i64>,
    face_match_oval_end: Option<i64>,
    face_matched: bool,
    oval_timer: Option<TimerHandle>,
    oval_timer_armed: bool,

    running_freshness: bool,
    freshness_handed_out: bool,
    session_stopped: bool,
}

impl Inner {
    fn new(show_start_view: bool) -> Self {
        Self {
            check_state: LivenessCheckState::default(),
            show_start_view,
            session: None,
            transport: None,
            face_target_challenge: None,
            color_challenge: None,
            initial_local_face_found: false,
            initial_distance_check_passed: false,
            initial_face_sent: false,
            ready_for_oval: false,
            ready_to_send_final_events: false,
            face_guide_rect: None,
            face_match_percentage: INITIAL_MATCH_PERCENTAGE,
            initial_face_oval_iou: None,
            detected_face_matched_oval: false,
            face_match_oval_start: None,
            face_match_oval_end: None,
            face_matched: false,
            oval_timer: None,
            oval_timer_armed: false,
            running_freshness: false,
            freshness_handed_out: false,
            session_stopped: false,
        }
    }

    fn snapshot(&self) -> LivenessSnapshot {
        LivenessSnapshot {
            check_state: self.check_state.clone(),
            face_guide_rect: self.face_guide_rect,
            face_match_percentage: self.face_match_percentage,
            face_matched: self.face_matched,
            running_freshness: self.running_freshness,
        }
    }

    fn cancel_oval_timer(&mut self) {
        if let Some(timer) = self.oval_timer.take() {
            timer.cancel();
        }
    }

    fn clear_oval_tracking(&mut self) {
        self.cancel_oval_timer();
        self.ready_for_oval = false;
        self.face_guide_rect = None;
        self.running_freshness = false;
    }

    fn challenge_id(&self) -> String {
        self.session
            .as_ref()
            .map(|s| s.challenge_id.clone())
            .unwrap_or_default()
    }

    fn push_response(&self, effects: &mut Vec<Effect>, event: ChallengeResponseEvent) {
        match &self.transport {
            Some(transport) => effects.push(Effect::ChallengeResponse(Arc::clone(transport), event)),
            None => tracing::warn!(?event, "no session transport; dropping challenge response"),
        }
    }

    fn push_stop(&mut self, effects: &mut Vec<Effect>, close_code: Option<CloseCode>) {
        if self.session_stopped {
            return;
        }
        self.session_stopped = true;
        match &self.transport {
            Some(transport) => effects.push(Effect::StopSession(Arc::clone(transport), close_code)),
            None => tracing::debug!("stop requested before the session was ready"),
        }
    }

    fn freshness_enabled(&self) -> bool {
        self.color_challenge
            .as_ref()
            .is_some_and(|c| c.challenge_type == ColorChallengeType::Sequential)
    }
}

struct Shared {
    session_id: String,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
    callbacks: Arc<dyn LivenessCallbacks>,
    inner: Mutex<Inner>,
    snapshot: watch::Sender<LivenessSnapshot>,
}

impl Shared {
    /// Run `f` under the lock, publish the snapshot, then run the effects.
    fn mutate<R>(
        self: &Arc<Self>,
        f: impl FnOnce(&Arc<Self>, &mut Inner, &mut Vec<Effect>) -> R,
    ) -> R {
        let mut effects = Vec::new();
        let result = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let result = f(self, &mut *inner, &mut effects);
            let snapshot = inner.snapshot();
            self.snapshot.send_if_modified(|current| {
                if *current == snapshot {
                    false
                } else {
                    *current = snapshot;
                    true
                }
            });
            result
        };
        for effect in effects {
            self.run(effect);
        }
        result
    }

    fn run(&self, effect: Effect) {
        match effect {
            Effect::CaptureReady => self.callbacks.on_capture_ready(),
            Effect::DistanceCheckPassed => self.callbacks.on_face_distance_check_passed(),
            Effect::SessionError(error, stop) => {
                tracing::warn!(session_id = %self.session_id, error = %error, stop, "liveness session error");
                self.callbacks.on_session_error(error, stop);
            }
            Effect::FinalEventsSent => self.callbacks.on_final_events_sent(),
            Effect::ChallengeResponse(transport, event) => transport.send_challenge_response(event),
            Effect::Video(transport, event) => transport.send_video_event(event),
            Effect::StopSession(transport, code) => {
                tracing::info!(session_id = %self.session_id, code = ?code.map(|c| c.code()), "stopping liveness session");
                transport.stop_session(code);
            }
        }
    }

    fn arm_oval_timer(self: &Arc<Self>, inner: &mut Inner, timeout_ms: u64) {
        inner.oval_timer_armed = true;
        let weak: Weak<Shared> = Arc::downgrade(self);
        let handle = self.scheduler.schedule(
            Duration::from_millis(timeout_ms),
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.on_oval_timeout();
                }
            }),
        );
        inner.oval_timer = Some(handle);
        tracing::debug!(session_id = %self.session_id, timeout_ms, "oval match timer armed");
    }

    fn on_oval_timeout(self: &Arc<Self>) {
        self.mutate(|_, inner, effects| {
            inner.oval_timer = None;
            if inner.detected_face_matched_oval || inner.face_guide_rect.is_none() {
                return;
            }
            inner.clear_oval_tracking();
            inner.check_state = LivenessCheckState::Error;
            effects.push(Effect::SessionError(
                FaceLivenessError::FaceInOvalMatchExceededTimeLimit,
                true,
            ));
        });
    }
}

/// State machine for one liveness session. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct LivenessState {
    shared: Arc<Shared>,
}

impl LivenessState {
    pub fn new(
        session_id: impl Into<String>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        scheduler: Arc<dyn Scheduler>,
        callbacks: Arc<dyn LivenessCallbacks>,
    ) -> Self {
        let inner = Inner::new(config.start_view_enabled);
        let (snapshot, _) = watch::channel(inner.snapshot());
        Self {
            shared: Arc::new(Shared {
                session_id: session_id.into(),
                config,
                clock,
                scheduler,
                callbacks,
                inner: Mutex::new(inner),
                snapshot,
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    fn with_inner<R>(&self, f: impl FnOnce(&Inner) -> R) -> R {
        let inner = self.shared.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&*inner)
    }

    pub fn snapshot(&self) -> LivenessSnapshot {
        self.with_inner(Inner::snapshot)
    }

    /// Receiver that observes every snapshot change.
    pub fn subscribe(&self) -> watch::Receiver<LivenessSnapshot> {
        self.shared.snapshot.subscribe()
    }

    pub fn check_state(&self) -> LivenessCheckState {
        self.with_inner(|i| i.check_state.clone())
    }

    pub fn face_guide_rect(&self) -> Option<RectF> {
        self.with_inner(|i| i.face_guide_rect)
    }

    pub fn face_matched(&self) -> bool {
        self.with_inner(|i| i.face_matched)
    }

    pub fn is_ready_for_oval(&self) -> bool {
        self.with_inner(|i| i.ready_for_oval)
    }

    pub fn is_showing_start_view(&self) -> bool {
        self.with_inner(|i| i.show_start_view)
    }

    pub fn color_challenge(&self) -> Option<ColorChallenge> {
        self.with_inner(|i| i.color_challenge.clone())
    }

    /// Start and end of the oval match window, in epoch milliseconds.
    pub fn match_window(&self) -> (Option<i64>, Option<i64>) {
        self.with_inner(|i| (i.face_match_oval_start, i.face_match_oval_end))
    }

    /// Accept the challenge payload and the transport that delivered it.
    pub fn on_liveness_session_ready(
        &self,
        session: FaceLivenessSession,
        transport: Arc<dyn LivenessTransport>,
    ) {
        self.shared.mutate(|shared, inner, _| {
            if inner.check_state.is_terminal() {
                tracing::warn!(session_id = %shared.session_id, "session ready after terminal state; ignoring");
                return;
            }
            inner.face_target_challenge = session.face_target_challenge().copied();
            inner.color_challenge = session.color_challenge().cloned();
            if inner.face_target_challenge.is_none() {
                tracing::warn!(session_id = %shared.session_id, "session has no face-target challenge");
            }
            tracing::info!(
                session_id = %shared.session_id,
                challenge_id = %session.challenge_id,
                challenges = session.challenges.len(),
                "liveness session ready"
            );
            inner.session = Some(session);
            inner.transport = Some(transport);
            inner.check_state = LivenessCheckState::Running(None);
            inner.ready_for_oval = true;
        });
    }

    pub fn on_start_view_complete(&self) {
        self.shared.mutate(|_, inner, _| inner.show_start_view = false);
    }

    pub fn on_frame_face_count_update(&self, face_count: usize) {
        self.shared.mutate(|_, inner, _| {
            if inner.detected_face_matched_oval || inner.check_state.is_terminal() {
                return;
            }
            let prompt = match face_count {
                0 => InstructionPrompt::MoveFace,
                1 => {
                    inner.initial_local_face_found = true;
                    return;
                }
                _ => InstructionPrompt::MultipleFaces,
            };
            if !inner.initial_local_face_found || inner.check_state.is_initial() {
                inner.check_state = LivenessCheckState::Initial(Some(prompt));
            } else if inner.check_state.is_running() {
                inner.check_state = LivenessCheckState::Running(Some(prompt));
            }
        });
    }

    /// Feed the geometry of the single detected face.
    ///
    /// Returns `false` when the frame was ignored (start view showing or the
    /// session already finished).
    pub fn on_frame_face_update(
        &self,
        face_rect: RectF,
        left_eye: Landmark,
        right_eye: Landmark,
        mouth: Landmark,
    ) -> bool {
        self.shared.mutate(|shared, inner, effects| {
            if inner.show_start_view || inner.check_state.is_terminal() {
                return false;
            }
            let now = shared.clock.now_ms();

            if !inner.initial_distance_check_passed {
                let threshold = inner
                    .face_target_challenge
                    .map(|c| c.matching.face_distance_threshold_min)
                    .unwrap_or(shared.config.initial_face_distance_threshold);
                let distance = geometry::face_distance(
                    left_eye,
                    right_eye,
                    mouth,
                    shared.config.target_width,
                    shared.config.target_height,
                );
                if distance >= threshold {
                    inner.check_state =
                        LivenessCheckState::Initial(Some(InstructionPrompt::MoveFaceFurtherAway));
                    return true;
                }
                tracing::debug!(distance, threshold, "initial face distance check passed");
                inner.initial_distance_check_passed = true;
                effects.push(Effect::DistanceCheckPassed);
            }

            if inner.ready_for_oval {
                if !inner.initial_face_sent {
                    inner.initial_face_sent = true;
                    effects.push(Effect::CaptureReady);
                    let event = ChallengeResponseEvent::InitialFaceDetected {
                        challenge_id: inner.challenge_id(),
                        face_rect,
                        timestamp_ms: now,
                    };
                    inner.push_response(effects, event);
                }
                if inner.face_guide_rect.is_none() {
                    inner.face_guide_rect = inner.face_target_challenge.as_ref().map(geometry::face_guide_rect);
                }
            }

            let (Some(oval), Some(target)) = (inner.face_guide_rect, inner.face_target_challenge) else {
                return true;
            };
            let matching = target.matching;

            let position = geometry::oval_position(&face_rect, &oval, &matching);
            if inner.initial_face_oval_iou.is_none() {
                inner.initial_face_oval_iou = Some(geometry::intersection_over_union(&face_rect, &oval));
            }
            inner.face_match_percentage =
                geometry::oval_fit_percentage(&face_rect, &oval, &matching, inner.initial_face_oval_iou);

            let matched_now = position == FaceOvalPosition::Matched;
            if matched_now && !inner.detected_face_matched_oval {
                tracing::info!(session_id = %shared.session_id, "face matched oval");
                inner.detected_face_matched_oval = true;
                inner.cancel_oval_timer();
            }
            let shown = if inner.detected_face_matched_oval {
                FaceOvalPosition::Matched
            } else {
                position
            };
            inner.check_state = LivenessCheckState::Running(Some(shown.prompt()));

            if matched_now {
                let restart = inner.face_match_oval_end.is_some() && !inner.face_matched;
                if inner.face_match_oval_start.is_none() || restart {
                    inner.face_match_oval_start = Some(now);
                    inner.face_match_oval_end = None;
                }
            } else if inner.face_match_oval_start.is_some()
                && inner.face_match_oval_end.is_none()
                && !inner.face_matched
            {
                inner.face_match_oval_end = Some(now);
            }

            if !inner.detected_face_matched_oval && !inner.oval_timer_armed {
                shared.arm_oval_timer(inner, matching.oval_fit_timeout_ms);
            }
            true
        })
    }

    /// Called once per camera frame. Returns whether the frame should be
    /// forwarded downstream.
    pub fn on_frame_available(&self) -> bool {
        self.shared.mutate(|shared, inner, effects| {
            if inner.show_start_view {
                return false;
            }
            match inner.check_state.clone() {
                LivenessCheckState::Error => false,
                LivenessCheckState::Initial(_) | LivenessCheckState::Running(_) => {
                    if let (false, Some(start), None) =
                        (inner.face_matched, inner.face_match_oval_start, inner.face_match_oval_end)
                    {
                        let held = shared.clock.now_ms() - start;
                        if held >= shared.config.face_match_debounce_ms as i64 {
                            tracing::debug!(held_ms = held, "oval match held; face matched");
                            inner.face_matched = true;
                            if inner.freshness_enabled() {
                                inner.running_freshness = true;
                            }
                        }
                    }
                    true
                }
                LivenessCheckState::Success(guide_rect) => {
                    if inner.ready_to_send_final_events {
                        inner.ready_to_send_final_events = false;
                        let now = shared.clock.now_ms();
                        let event = ChallengeResponseEvent::FaceTargetChallengeResponse {
                            challenge_id: inner.challenge_id(),
                            target_rect: guide_rect,
                            start_timestamp_ms: inner.face_match_oval_start.unwrap_or(now),
                            end_timestamp_ms: inner.face_match_oval_end.unwrap_or(now),
                        };
                        inner.push_response(effects, event);
                        match &inner.transport {
                            Some(transport) => effects.push(Effect::Video(
                                Arc::clone(transport),
                                VideoEvent::end_of_stream(now),
                            )),
                            None => tracing::warn!("no session transport; end of stream not sent"),
                        }
                        effects.push(Effect::FinalEventsSent);
                    }
                    false
                }
            }
        })
    }

    /// Hand out the color challenge the first time freshness should start.
    pub fn start_freshness(&self) -> Option<ColorChallenge> {
        self.shared.mutate(|_, inner, _| {
            if !inner.running_freshness || inner.freshness_handed_out {
                return None;
            }
            inner.freshness_handed_out = true;
            inner.color_challenge.clone()
        })
    }

    /// Arm the final-events flush. Called when the color sequence finishes.
    pub fn on_full_challenge_complete(&self) {
        self.shared.mutate(|_, inner, _| inner.ready_to_send_final_events = true);
    }

    pub fn on_liveness_challenge_complete(&self) {
        self.shared.mutate(|shared, inner, _| {
            if inner.check_state.is_terminal() {
                return;
            }
            let guide_rect = inner.face_guide_rect;
            inner.clear_oval_tracking();
            inner.face_matched = false;
            if inner.face_match_oval_end.is_none() {
                inner.face_match_oval_end = Some(shared.clock.now_ms());
            }
            inner.check_state = match guide_rect {
                Some(rect) => LivenessCheckState::Success(rect),
                None => LivenessCheckState::Error,
            };
            tracing::info!(session_id = %shared.session_id, state = ?inner.check_state, "liveness challenge complete");
        });
    }

    /// Force the terminal error state. Only tears the transport session down
    /// when `stop_session` is set.
    pub fn on_error(&self, stop_session: bool, close_code: Option<CloseCode>) {
        self.shared.mutate(|_, inner, effects| {
            inner.check_state = LivenessCheckState::Error;
            inner.clear_oval_tracking();
            if stop_session {
                inner.push_stop(effects, close_code);
            }
        });
    }

    /// Release timers and, if asked, stop the transport session. Idempotent.
    pub fn on_destroy(&self, stop_session: bool, close_code: Option<CloseCode>) {
        self.shared.mutate(|_, inner, effects| {
            inner.clear_oval_tracking();
            if stop_session {
                inner.push_stop(effects, close_code);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{ColorSpec, FaceTargetMatchingParameters, RgbColor, SessionChallenge};
    use crate::timer::ManualScheduler;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingTransport {
        responses: Mutex<Vec<ChallengeResponseEvent>>,
        videos: Mutex<Vec<VideoEvent>>,
        stops: Mutex<Vec<Option<CloseCode>>>,
    }

    impl LivenessTransport for RecordingTransport {
        fn send_challenge_response(&self, event: ChallengeResponseEvent) {
            self.responses.lock().unwrap().push(event);
        }

        fn send_video_event(&self, event: VideoEvent) {
            self.videos.lock().unwrap().push(event);
        }

        fn stop_session(&self, close_code: Option<CloseCode>) {
            self.stops.lock().unwrap().push(close_code);
        }
    }

    #[derive(Default)]
    struct RecordingCallbacks {
        capture_ready: AtomicUsize,
        distance_passed: AtomicUsize,
        final_events: AtomicUsize,
        errors: Mutex<Vec<(String, bool)>>,
    }

    impl LivenessCallbacks for RecordingCallbacks {
        fn on_capture_ready(&self) {
            self.capture_ready.fetch_add(1, Ordering::SeqCst);
        }

        fn on_face_distance_check_passed(&self) {
            self.distance_passed.fetch_add(1, Ordering::SeqCst);
        }

        fn on_session_error(&self, error: FaceLivenessError, stop_session: bool) {
            self.errors.lock().unwrap().push((error.message(), stop_session));
        }

        fn on_final_events_sent(&self) {
            self.final_events.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        state: LivenessState,
        clock: Arc<ManualClock>,
        scheduler: Arc<ManualScheduler>,
        transport: Arc<RecordingTransport>,
        callbacks: Arc<RecordingCallbacks>,
    }

    impl Harness {
        fn new(config: EngineConfig) -> Self {
            let clock = Arc::new(ManualClock::new(10_000));
            let scheduler = Arc::new(ManualScheduler::new());
            let callbacks = Arc::new(RecordingCallbacks::default());
            let state = LivenessState::new(
                "session-1",
                config,
                Arc::clone(&clock) as Arc<dyn Clock>,
                Arc::clone(&scheduler) as Arc<dyn Scheduler>,
                Arc::clone(&callbacks) as Arc<dyn LivenessCallbacks>,
            );
            Self {
                state,
                clock,
                scheduler,
                transport: Arc::new(RecordingTransport::default()),
                callbacks,
            }
        }

        fn ready(&self) {
            self.state.on_liveness_session_ready(
                session(),
                Arc::clone(&self.transport) as Arc<dyn LivenessTransport>,
            );
        }

        fn tick(&self, ms: i64) {
            self.clock.advance(ms);
            self.scheduler.advance(Duration::from_millis(ms as u64));
        }

        fn face(&self, rect: RectF) -> bool {
            let (l, r, m) = near_landmarks();
            self.state.on_frame_face_update(rect, l, r, m)
        }

        fn responses(&self) -> Vec<ChallengeResponseEvent> {
            self.transport.responses.lock().unwrap().clone()
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
                    colors: vec![ColorSpec {
                        color: RgbColor::new(255, 0, 0),
                        duration_ms: 100,
                        should_scroll: false,
                    }],
                }),
            ],
        }
    }

    fn near_landmarks() -> (Landmark, Landmark, Landmark) {
        (
            Landmark::new(25.0, 40.0),
            Landmark::new(75.0, 40.0),
            Landmark::new(40.0, 80.0),
        )
    }

    fn close_landmarks() -> (Landmark, Landmark, Landmark) {
        (
            Landmark::new(0.0, 0.0),
            Landmark::new(200.0, 0.0),
            Landmark::new(100.0, 160.0),
        )
    }

    const MATCHED_FACE: RectF = RectF::new(145.0, 180.0, 335.0, 465.0);
    const SMALL_FACE: RectF = RectF::new(220.0, 280.0, 260.0, 360.0);

    #[test]
    fn test_starts_initial_without_prompt() {
        let h = Harness::new(EngineConfig::default());
        assert_eq!(h.state.check_state(), LivenessCheckState::Initial(None));
        assert_eq!(h.state.snapshot(), LivenessSnapshot::default());
    }

    #[test]
    fn test_no_face_never_enters_running() {
        let h = Harness::new(EngineConfig::default());
        for _ in 0..3 {
            h.state.on_frame_face_count_update(0);
        }
        assert_eq!(
            h.state.check_state(),
            LivenessCheckState::Initial(Some(InstructionPrompt::MoveFace))
        );
        h.state.on_frame_face_count_update(2);
        assert_eq!(
            h.state.check_state(),
            LivenessCheckState::Initial(Some(InstructionPrompt::MultipleFaces))
        );
    }

    #[test]
    fn test_face_count_prompts_use_running_once_face_found() {
        let h = Harness::new(EngineConfig::default());
        h.ready();
        h.state.on_frame_face_count_update(1);
        h.state.on_frame_face_count_update(2);
        assert_eq!(
            h.state.check_state(),
            LivenessCheckState::Running(Some(InstructionPrompt::MultipleFaces))
        );
    }

    #[test]
    fn test_distance_gate_then_initial_face_detected_once() {
        let h = Harness::new(EngineConfig::default());
        h.ready();
        let (l, r, m) = close_landmarks();
        for _ in 0..3 {
            assert!(h.state.on_frame_face_update(SMALL_FACE, l, r, m));
            assert_eq!(
                h.state.check_state(),
                LivenessCheckState::Initial(Some(InstructionPrompt::MoveFaceFurtherAway))
            );
        }
        assert!(h.responses().is_empty());
        assert!(h.state.face_guide_rect().is_none());

        h.face(SMALL_FACE);
        h.face(SMALL_FACE);
        let responses = h.responses();
        assert_eq!(responses.len(), 1);
        assert!(matches!(
            &responses[0],
            ChallengeResponseEvent::InitialFaceDetected { challenge_id, face_rect, timestamp_ms: 10_000 }
                if challenge_id == "challenge-1" && *face_rect == SMALL_FACE
        ));
        assert_eq!(
            h.state.face_guide_rect(),
            Some(RectF::new(140.0, 170.0, 340.0, 470.0))
        );
        assert_eq!(h.callbacks.capture_ready.load(Ordering::SeqCst), 1);
        assert_eq!(h.callbacks.distance_passed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_face_update_before_session_ready_only_checks_distance() {
        let h = Harness::new(EngineConfig::default());
        assert!(h.face(MATCHED_FACE));
        assert!(h.responses().is_empty());
        assert!(h.state.face_guide_rect().is_none());
        assert_eq!(h.callbacks.distance_passed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_matched_latch_ignores_face_count_flicker() {
        let h = Harness::new(EngineConfig::default());
        h.ready();
        h.face(MATCHED_FACE);
        let matched = h.state.check_state();
        assert_eq!(
            matched,
            LivenessCheckState::Running(Some(InstructionPrompt::HoldFaceDuringFreshness))
        );
        h.state.on_frame_face_count_update(0);
        h.state.on_frame_face_count_update(3);
        assert_eq!(h.state.check_state(), matched);
        h.face(SMALL_FACE);
        assert_eq!(h.state.check_state(), matched);
    }

    #[test]
    fn test_face_matched_after_debounce() {
        let h = Harness::new(EngineConfig::default());
        h.ready();
        h.face(MATCHED_FACE);
        assert!(h.state.on_frame_available());
        assert!(!h.state.face_matched());
        assert!(h.state.start_freshness().is_none());

        h.tick(999);
        h.state.on_frame_available();
        assert!(!h.state.face_matched());

        h.tick(1);
        h.state.on_frame_available();
        assert!(h.state.face_matched());
        let colors = h.state.start_freshness().expect("freshness starts");
        assert_eq!(colors.challenge_id, "color-1");
        assert!(h.state.start_freshness().is_none());
        assert!(h.state.snapshot().running_freshness);
    }

    #[test]
    fn test_lost_match_closes_window_and_blocks_debounce() {
        let h = Harness::new(EngineConfig::default());
        h.ready();
        h.face(MATCHED_FACE);
        h.tick(400);
        h.face(SMALL_FACE);
        assert_eq!(h.state.match_window(), (Some(10_000), Some(10_400)));

        h.tick(2_000);
        h.state.on_frame_available();
        assert!(!h.state.face_matched());

        h.face(MATCHED_FACE);
        assert_eq!(h.state.match_window(), (Some(12_400), None));
        h.tick(1_000);
        h.state.on_frame_available();
        assert!(h.state.face_matched());
    }

    #[test]
    fn test_oval_timeout_fires_when_never_matched() {
        let h = Harness::new(EngineConfig::default());
        h.ready();
        h.face(SMALL_FACE);
        assert_eq!(h.scheduler.pending(), 1);

        h.tick(6_999);
        assert!(h.callbacks.errors.lock().unwrap().is_empty());
        h.tick(1);
        assert_eq!(h.state.check_state(), LivenessCheckState::Error);
        assert!(!h.state.is_ready_for_oval());
        assert_eq!(
            h.callbacks.errors.lock().unwrap().as_slice(),
            &[("Face did not match oval within time limit.".to_string(), true)]
        );
        assert!(!h.state.on_frame_available());
    }

    #[test]
    fn test_oval_timer_cancelled_by_match() {
        let h = Harness::new(EngineConfig::default());
        h.ready();
        h.face(SMALL_FACE);
        h.tick(3_000);
        h.face(MATCHED_FACE);
        assert_eq!(h.scheduler.pending(), 0);
        h.tick(10_000);
        assert!(h.callbacks.errors.lock().unwrap().is_empty());
        assert!(h.state.check_state().is_running());
    }

    #[test]
    fn test_full_flow_sends_final_events_once() {
        let h = Harness::new(EngineConfig::default());
        h.ready();
        h.face(MATCHED_FACE);
        h.tick(1_000);
        h.state.on_frame_available();

        h.state.on_full_challenge_complete();
        h.tick(500);
        h.state.on_liveness_challenge_complete();
        let guide = RectF::new(140.0, 170.0, 340.0, 470.0);
        assert_eq!(h.state.check_state(), LivenessCheckState::Success(guide));
        assert!(h.state.face_guide_rect().is_none());

        assert!(!h.state.on_frame_available());
        assert!(!h.state.on_frame_available());

        let responses = h.responses();
        assert_eq!(responses.len(), 2);
        assert_eq!(
            responses[1],
            ChallengeResponseEvent::FaceTargetChallengeResponse {
                challenge_id: "challenge-1".into(),
                target_rect: guide,
                start_timestamp_ms: 10_000,
                end_timestamp_ms: 11_500,
            }
        );
        let videos = h.transport.videos.lock().unwrap();
        assert_eq!(videos.len(), 1);
        assert!(videos[0].is_end_of_stream());
        assert_eq!(h.callbacks.final_events.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_complete_without_guide_rect_is_error() {
        let h = Harness::new(EngineConfig::default());
        h.ready();
        h.state.on_liveness_challenge_complete();
        assert_eq!(h.state.check_state(), LivenessCheckState::Error);
    }

    #[test]
    fn test_error_without_stop_keeps_transport_open() {
        let h = Harness::new(EngineConfig::default());
        h.ready();
        h.face(SMALL_FACE);
        h.state.on_error(false, None);
        assert_eq!(h.state.check_state(), LivenessCheckState::Error);
        assert!(h.transport.stops.lock().unwrap().is_empty());
        assert_eq!(h.scheduler.pending(), 0);
    }

    #[test]
    fn test_stop_session_called_at_most_once() {
        let h = Harness::new(EngineConfig::default());
        h.ready();
        h.face(SMALL_FACE);
        h.state.on_error(true, Some(CloseCode::RuntimeError));
        h.state.on_destroy(true, Some(CloseCode::Disposed));
        h.state.on_destroy(true, Some(CloseCode::Disposed));
        assert_eq!(
            h.transport.stops.lock().unwrap().as_slice(),
            &[Some(CloseCode::RuntimeError)]
        );
        h.tick(10_000);
        assert!(h.callbacks.errors.lock().unwrap().is_empty());
    }

    #[test]
    fn test_start_view_gates_frames() {
        let config = EngineConfig {
            start_view_enabled: true,
            ..EngineConfig::default()
        };
        let h = Harness::new(config);
        h.ready();
        assert!(h.state.is_showing_start_view());
        assert!(!h.state.on_frame_available());
        assert!(!h.face(MATCHED_FACE));
        assert!(h.responses().is_empty());

        h.state.on_start_view_complete();
        assert!(h.state.on_frame_available());
        assert!(h.face(MATCHED_FACE));
        assert_eq!(h.responses().len(), 1);
    }

    #[test]
    fn test_callback_may_reenter_state() {
        struct StopOnError(Mutex<Option<LivenessState>>);
        impl LivenessCallbacks for StopOnError {
            fn on_session_error(&self, error: FaceLivenessError, stop_session: bool) {
                if let Some(state) = self.0.lock().unwrap().as_ref() {
                    state.on_error(stop_session, Some(error.close_code()));
                }
            }
        }

        let clock = Arc::new(ManualClock::new(0));
        let scheduler = Arc::new(ManualScheduler::new());
        let callbacks = Arc::new(StopOnError(Mutex::new(None)));
        let state = LivenessState::new(
            "s",
            EngineConfig::default(),
            clock as Arc<dyn Clock>,
            Arc::clone(&scheduler) as Arc<dyn Scheduler>,
            Arc::clone(&callbacks) as Arc<dyn LivenessCallbacks>,
        );
        *callbacks.0.lock().unwrap() = Some(state.clone());
        let transport = Arc::new(RecordingTransport::default());
        state.on_liveness_session_ready(session(), Arc::clone(&transport) as Arc<dyn LivenessTransport>);
        let (l, r, m) = near_landmarks();
        state.on_frame_face_update(SMALL_FACE, l, r, m);
        scheduler.advance(Duration::from_millis(7_000));

        assert_eq!(
            transport.stops.lock().unwrap().as_slice(),
            &[Some(CloseCode::Timeout)]
        );
        *callbacks.0.lock().unwrap() = None;
    }

    #[tokio::test]
    async fn test_snapshot_subscribers_see_changes() {
        let h = Harness::new(EngineConfig::default());
        let mut rx = h.state.subscribe();
        h.ready();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().check_state, LivenessCheckState::Running(None));

        h.face(MATCHED_FACE);
        rx.changed().await.unwrap();
        let snapshot = rx.borrow().clone();
        assert!(snapshot.face_guide_rect.is_some());
        assert_eq!(
            snapshot.check_state,
            LivenessCheckState::Running(Some(InstructionPrompt::HoldFaceDuringFreshness))
        );
    }
}
