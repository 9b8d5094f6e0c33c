use std::path::{Path, PathBuf};
use std::str::FromStr;

use liveness_core::EngineConfig;
use liveness_media::{MuxerConfig, VideoCodec, VideoFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Encoder output settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub frame_rate: u32,
    pub bitrate: u32,
    /// Seconds between requested keyframes.
    pub keyframe_interval_s: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            frame_rate: 24,
            bitrate: (1024.0 * 1024.0 * 0.6) as u32,
            keyframe_interval_s: 1,
        }
    }
}

/// Everything tunable about a liveness run.
///
/// Loaded from an optional TOML file, then overridden by `LIVENESS_*`
/// environment variables. Missing keys keep their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    pub engine: EngineConfig,
    pub muxer: MuxerConfig,
    pub video: VideoConfig,
    /// Failed muxer constructions tolerated before the session fails.
    pub max_muxer_attempts: u32,
    /// Directory for the encoder's staging files.
    pub staging_dir: PathBuf,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            muxer: MuxerConfig::default(),
            video: VideoConfig::default(),
            max_muxer_attempts: 3,
            staging_dir: std::env::temp_dir().join("liveness"),
        }
    }
}

impl LivenessConfig {
    /// Load `path` (if given) and apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        Ok(config.with_env_overrides(|key| std::env::var(key).ok()))
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Apply `LIVENESS_*` overrides read through `lookup`. Unparseable values
    /// are ignored.
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let env = Env(&lookup);
        let engine = &mut self.engine;
        engine.initial_face_distance_threshold = env.parse(
            "LIVENESS_FACE_DISTANCE_THRESHOLD",
            engine.initial_face_distance_threshold,
        );
        engine.face_match_debounce_ms =
            env.parse("LIVENESS_MATCH_DEBOUNCE_MS", engine.face_match_debounce_ms);
        engine.attempt_reset_interval_ms =
            env.parse("LIVENESS_ATTEMPT_RESET_MS", engine.attempt_reset_interval_ms);
        engine.start_view_enabled = env.flag("LIVENESS_START_VIEW", engine.start_view_enabled);

        self.muxer.min_chunk_interval_ms =
            env.parse("LIVENESS_CHUNK_INTERVAL_MS", self.muxer.min_chunk_interval_ms);
        self.video.frame_rate = env.parse("LIVENESS_FRAME_RATE", self.video.frame_rate);
        self.video.bitrate = env.parse("LIVENESS_BITRATE", self.video.bitrate);
        self.video.keyframe_interval_s =
            env.parse("LIVENESS_KEYFRAME_INTERVAL_S", self.video.keyframe_interval_s);
        self.max_muxer_attempts = env.parse("LIVENESS_MAX_MUXER_ATTEMPTS", self.max_muxer_attempts);
        if let Some(dir) = env.get("LIVENESS_STAGING_DIR") {
            self.staging_dir = PathBuf::from(dir);
        }
        self
    }

    /// Encoder format for `codec` at the configured target size.
    pub fn video_format(&self, codec: VideoCodec) -> VideoFormat {
        VideoFormat {
            codec,
            width: self.engine.target_width,
            height: self.engine.target_height,
            bitrate: self.video.bitrate,
            frame_rate: self.video.frame_rate,
            keyframe_interval_s: self.video.keyframe_interval_s,
        }
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        self.get(key).map(|v| v != "0").unwrap_or(default)
    }
}
