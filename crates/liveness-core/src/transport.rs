use crate::error::CloseCode;
use crate::model::{ChallengeResponseEvent, VideoEvent};

/// Outgoing side of the session connection to the verification service.
///
/// Sends are fire-and-forget: implementations must not block the caller,
/// which is the frame-processing stream.
pub trait LivenessTransport: Send + Sync {
    fn send_challenge_response(&self, event: ChallengeResponseEvent);

    fn send_video_event(&self, event: VideoEvent);

    /// Close the session. `None` lets the transport pick its default code.
    fn stop_session(&self, close_code: Option<CloseCode>);
}
