//! Face geometry: distance estimation, overlap and oval-fit classification.
//!
//! Every function here is pure and total. Degenerate inputs (zero-sized
//! frames, zero-area rectangles, an unseeded initial IoU) produce a defined
//! value instead of a panic so the per-frame path never has to handle errors.

use crate::model::{FaceTargetChallenge, FaceTargetMatchingParameters, InstructionPrompt, Landmark, RectF};

/// Weight of the pupil distance in the calibrated face size.
const ALPHA: f32 = 2.0;
/// Weight of the eye-to-mouth distance in the calibrated face size.
const GAMMA: f32 = 1.8;
/// Fraction of the frame width covered by the static reference oval.
const STATIC_OVAL_RATIO: f32 = 0.8;
/// Progress value reported before the face has moved toward the oval.
const BASELINE_MATCH_PERCENTAGE: f32 = 0.25;

/// Where a detected face sits relative to the target oval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaceOvalPosition {
    Matched,
    TooClose,
    TooFar,
    TooFarLeft,
    TooFarRight,
    TooFarUp,
    TooFarDown,
}

impl FaceOvalPosition {
    /// Instruction that moves the user toward a match.
    pub fn prompt(&self) -> InstructionPrompt {
        match self {
            Self::Matched => InstructionPrompt::HoldFaceDuringFreshness,
            Self::TooClose => InstructionPrompt::MoveFaceFurtherAway,
            Self::TooFar => InstructionPrompt::MoveFaceCloser,
            Self::TooFarLeft => InstructionPrompt::MoveFaceRight,
            Self::TooFarRight => InstructionPrompt::MoveFaceLeft,
            Self::TooFarUp => InstructionPrompt::MoveFaceDown,
            Self::TooFarDown => InstructionPrompt::MoveFaceUp,
        }
    }
}

/// Estimate how close the face is to the camera.
///
/// The pupil distance and the eye-centre-to-mouth distance are blended into a
/// calibrated face size, then normalised by the width of a static reference
/// oval for a `width` x `height` frame. Larger values mean a closer face.
///
/// Returns `f32::INFINITY` for a zero-sized frame so a distance gate built on
/// this value stays closed.
pub fn face_distance(
    left_eye: Landmark,
    right_eye: Landmark,
    mouth: Landmark,
    width: u32,
    height: u32,
) -> f32 {
    let pupil_distance = distance(left_eye, right_eye);
    let eye_center = Landmark::new((left_eye.x + right_eye.x) / 2.0, (left_eye.y + right_eye.y) / 2.0);
    let face_height = distance(eye_center, mouth);

    let calibrated = (ALPHA * pupil_distance + GAMMA * face_height) / 2.0 / ALPHA;
    let oval_width = static_oval_width(width as f32, height as f32);
    if oval_width <= 0.0 {
        return f32::INFINITY;
    }
    calibrated / oval_width
}

fn distance(a: Landmark, b: Landmark) -> f32 {
    let dx = a.x - b.x;
    let dy = a.y - b.y;
    (dx * dx + dy * dy).sqrt()
}

fn static_oval_width(width: f32, height: f32) -> f32 {
    let base = if width > height { 0.75 * height } else { width };
    STATIC_OVAL_RATIO * base
}

/// Standard intersection-over-union. `0.0` when disjoint, `1.0` when identical.
pub fn intersection_over_union(a: &RectF, b: &RectF) -> f32 {
    let x_a = a.left.max(b.left);
    let y_a = a.top.max(b.top);
    let x_b = a.right.min(b.right);
    let y_b = a.bottom.min(b.bottom);

    let intersection = (x_b - x_a).max(0.0) * (y_b - y_a).max(0.0);
    if intersection == 0.0 {
        return 0.0;
    }

    let area_a = (a.height() * a.width()).abs();
    let area_b = (b.height() * b.width()).abs();
    let union = area_a + area_b - intersection;
    if union <= 0.0 {
        return 0.0;
    }
    (intersection / union).clamp(0.0, 1.0)
}

/// Relative progress of the face toward the oval, in `[0, 1]`.
///
/// Progress is measured from the IoU seen when the oval first appeared
/// (`initial_iou`) to the target IoU threshold, mapped onto `[0.25, 1.0]`.
/// When `initial_iou` is `None` the current frame seeds it, which yields the
/// baseline value.
pub fn oval_fit_percentage(
    face: &RectF,
    oval: &RectF,
    matching: &FaceTargetMatchingParameters,
    initial_iou: Option<f32>,
) -> f32 {
    let current_iou = intersection_over_union(face, oval);
    let initial_iou = initial_iou.unwrap_or(current_iou);
    let span = matching.target_iou_threshold - initial_iou;

    if span.abs() <= f32::EPSILON {
        return if current_iou >= matching.target_iou_threshold {
            1.0
        } else {
            BASELINE_MATCH_PERCENTAGE
        };
    }

    let progress = 0.75 * (current_iou - initial_iou) / span + BASELINE_MATCH_PERCENTAGE;
    if progress.is_nan() {
        return BASELINE_MATCH_PERCENTAGE;
    }
    progress.clamp(0.0, 1.0)
}

/// Classify the face against the oval.
///
/// A match needs the IoU above the target threshold and the left, right and
/// bottom edges each within their tolerance of the oval. Otherwise size is
/// checked before position: a face overflowing both sides horizontally, or
/// taller than the oval and overflowing either its top or bottom, is
/// `TooClose`. Then the horizontal centre offset, then the vertical one;
/// anything left is a face too small to fill the oval.
pub fn oval_position(
    face: &RectF,
    oval: &RectF,
    matching: &FaceTargetMatchingParameters,
) -> FaceOvalPosition {
    let iou = intersection_over_union(face, oval);
    let match_width = oval.width() * matching.target_iou_width_threshold;
    let match_height = oval.height() * matching.target_iou_height_threshold;
    let face_width = oval.width() * matching.face_iou_width_threshold;
    let face_height = oval.height() * matching.face_iou_height_threshold;

    if iou > matching.target_iou_threshold
        && (oval.left - face.left).abs() < match_width
        && (oval.right - face.right).abs() < match_width
        && (oval.bottom - face.bottom).abs() < match_height
    {
        return FaceOvalPosition::Matched;
    }

    let overflows_horizontally =
        oval.left - face.left > face_width && face.right - oval.right > face_width;
    let overflows_vertically = face.height() > oval.height()
        && (oval.top - face.top > face_height || face.bottom - oval.bottom > face_height);
    if overflows_horizontally || overflows_vertically {
        return FaceOvalPosition::TooClose;
    }

    let dx = face.center_x() - oval.center_x();
    let dy = face.center_y() - oval.center_y();
    if dx.abs() > match_width {
        return if dx < 0.0 {
            FaceOvalPosition::TooFarLeft
        } else {
            FaceOvalPosition::TooFarRight
        };
    }
    if dy.abs() > match_height {
        return if dy < 0.0 {
            FaceOvalPosition::TooFarUp
        } else {
            FaceOvalPosition::TooFarDown
        };
    }

    if face.width() > oval.width() {
        FaceOvalPosition::TooClose
    } else {
        FaceOvalPosition::TooFar
    }
}

/// Guide rectangle described by a face-target challenge.
pub fn face_guide_rect(challenge: &FaceTargetChallenge) -> RectF {
    let left = challenge.target_center_x - challenge.target_width / 2.0;
    let top = challenge.target_center_y - challenge.target_height / 2.0;
    RectF::new(left, top, left + challenge.target_width, top + challenge.target_height)
}

/// Mirror a rectangle horizontally within a view `view_width` pixels wide.
pub fn mirror_rect(rect: &RectF, view_width: u32) -> RectF {
    let edge = view_width as f32 - 1.0;
    RectF::new((edge - rect.right).max(0.0), rect.top, edge - rect.left, rect.bottom)
}

/// Mirror a landmark horizontally within a view `view_width` pixels wide.
pub fn mirror_landmark(point: Landmark, view_width: u32) -> Landmark {
    Landmark::new((view_width as f32 - 1.0 - point.x).max(0.0), point.y)
}
