//! Real-time face liveness challenge engine.
//!
//! The engine consumes per-frame face geometry from an external detector and
//! drives a three-stage challenge: an initial distance check, an oval-fit
//! check against a server supplied target, and a color "freshness" sequence.
//! Everything here is free of camera, UI and network code; those collaborators
//! plug in through [`transport::LivenessTransport`], [`clock::Clock`] and
//! [`timer::Scheduler`].

pub mod attempt;
pub mod clock;
pub mod config;
pub mod error;
pub mod freshness;
pub mod geometry;
pub mod model;
pub mod state;
pub mod timer;
pub mod transport;

pub use attempt::AttemptCounter;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use error::{CloseCode, FaceLivenessError};
pub use freshness::{FreshnessColorFrame, FreshnessPlayer, SceneType};
pub use geometry::FaceOvalPosition;
pub use model::{
    ChallengeResponseEvent, ColorChallenge, ColorChallengeType, ColorSpec, FaceLivenessSession,
    FaceTargetChallenge, FaceTargetMatchingParameters, InstructionPrompt, Landmark,
    LivenessCheckState, RectF, RgbColor, SessionChallenge, VideoEvent,
};
pub use state::{LivenessCallbacks, LivenessSnapshot, LivenessState, NoopCallbacks};
pub use timer::{ManualScheduler, Scheduler, TimerHandle, TokioScheduler};
pub use transport::LivenessTransport;
