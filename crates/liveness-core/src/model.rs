//! Challenge payloads, outgoing events and the user-visible check state.

use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RectF {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl RectF {
    pub const fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    pub fn center_x(&self) -> f32 {
        (self.left + self.right) / 2.0
    }

    pub fn center_y(&self) -> f32 {
        (self.top + self.bottom) / 2.0
    }
}

/// A single facial landmark point.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
}

impl Landmark {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RgbColor {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl RgbColor {
    pub const fn new(red: u8, green: u8, blue: u8) -> Self {
        Self { red, green, blue }
    }
}

/// One entry of a color challenge: what to show and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColorSpec {
    pub color: RgbColor,
    pub duration_ms: u64,
    #[serde(default)]
    pub should_scroll: bool,
}

/// Thresholds the service uses to decide that a face "fits" the oval.
///
/// Width/height thresholds are fractions of the oval's width/height.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceTargetMatchingParameters {
    pub target_iou_threshold: f32,
    pub target_iou_width_threshold: f32,
    pub target_iou_height_threshold: f32,
    pub face_iou_width_threshold: f32,
    pub face_iou_height_threshold: f32,
    /// Faces at or above this distance value are considered too close.
    pub face_distance_threshold_min: f32,
    pub oval_fit_timeout_ms: u64,
}

/// The oval target the user's face must be brought into.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceTargetChallenge {
    pub target_center_x: f32,
    pub target_center_y: f32,
    pub target_width: f32,
    pub target_height: f32,
    pub matching: FaceTargetMatchingParameters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorChallengeType {
    Sequential,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorChallenge {
    pub challenge_id: String,
    pub challenge_type: ColorChallengeType,
    pub colors: Vec<ColorSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionChallenge {
    FaceTarget(FaceTargetChallenge),
    Color(ColorChallenge),
}

/// Challenge payload delivered once per session by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceLivenessSession {
    pub challenge_id: String,
    #[serde(default)]
    pub challenges: Vec<SessionChallenge>,
}

impl FaceLivenessSession {
    /// First face-target challenge in the payload, if any.
    pub fn face_target_challenge(&self) -> Option<&FaceTargetChallenge> {
        self.challenges.iter().find_map(|c| match c {
            SessionChallenge::FaceTarget(t) => Some(t),
            SessionChallenge::Color(_) => None,
        })
    }

    /// First color challenge in the payload, if any.
    pub fn color_challenge(&self) -> Option<&ColorChallenge> {
        self.challenges.iter().find_map(|c| match c {
            SessionChallenge::Color(c) => Some(c),
            SessionChallenge::FaceTarget(_) => None,
        })
    }
}

/// Events the engine sends back to the verification service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChallengeResponseEvent {
    InitialFaceDetected {
        challenge_id: String,
        face_rect: RectF,
        timestamp_ms: i64,
    },
    FaceTargetChallengeResponse {
        challenge_id: String,
        target_rect: RectF,
        start_timestamp_ms: i64,
        end_timestamp_ms: i64,
    },
    ColorChallengeResponse {
        challenge_id: String,
        current_color: RgbColor,
        previous_color: RgbColor,
        sequence_number: usize,
        color_start_ms: i64,
    },
}

/// A chunk of muxed video. An empty payload marks the end of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoEvent {
    pub bytes: Vec<u8>,
    pub timestamp_ms: i64,
}

impl VideoEvent {
    pub fn end_of_stream(timestamp_ms: i64) -> Self {
        Self {
            bytes: Vec::new(),
            timestamp_ms,
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// UI guidance attached to a check state. Carries no transition logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstructionPrompt {
    Connecting,
    MoveFace,
    MultipleFaces,
    MoveFaceFurtherAway,
    MoveFaceCloser,
    MoveFaceLeft,
    MoveFaceRight,
    MoveFaceUp,
    MoveFaceDown,
    HoldFaceDuringFreshness,
    Verifying,
}

impl InstructionPrompt {
    pub fn message(&self) -> &'static str {
        match self {
            Self::Connecting => "Connecting...",
            Self::MoveFace => "Move face to fit in oval",
            Self::MultipleFaces => "Only one face per check",
            Self::MoveFaceFurtherAway => "Move face further away",
            Self::MoveFaceCloser => "Move closer",
            Self::MoveFaceLeft => "Move face left",
            Self::MoveFaceRight => "Move face right",
            Self::MoveFaceUp => "Move face up",
            Self::MoveFaceDown => "Move face down",
            Self::HoldFaceDuringFreshness => "Hold face position during colored lights",
            Self::Verifying => "Verifying...",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum LivenessCheckState {
    Initial(Option<InstructionPrompt>),
    Running(Option<InstructionPrompt>),
    Success(RectF),
    Error,
}

impl LivenessCheckState {
    pub fn is_initial(&self) -> bool {
        matches!(self, Self::Initial(_))
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running(_))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success(_) | Self::Error)
    }

    pub fn prompt(&self) -> Option<InstructionPrompt> {
        match self {
            Self::Initial(p) | Self::Running(p) => *p,
            Self::Success(_) => Some(InstructionPrompt::Verifying),
            Self::Error => None,
        }
    }
}

impl Default for LivenessCheckState {
    fn default() -> Self {
        Self::Initial(None)
    }
}
