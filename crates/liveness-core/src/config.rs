use serde::{Deserialize, Serialize};

/// Tuning knobs for the challenge engine.
///
/// The defaults are the values the service was calibrated against. The match
/// debounce and the distance threshold are empirical; keep them configurable
/// rather than hard-coded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Width of the analysed/encoded frame in pixels.
    pub target_width: u32,
    /// Height of the analysed/encoded frame in pixels.
    pub target_height: u32,
    /// Distance gate used until a face-target challenge supplies its own.
    pub initial_face_distance_threshold: f32,
    /// How long the oval match must hold before `face_matched` latches.
    pub face_match_debounce_ms: u64,
    /// Attempts older than this no longer count toward the attempt streak.
    pub attempt_reset_interval_ms: u64,
    /// Whether a pre-challenge start view gates frame processing.
    pub start_view_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            target_width: 480,
            target_height: 640,
            initial_face_distance_threshold: 0.32,
            face_match_debounce_ms: 1_000,
            attempt_reset_interval_ms: 300_000,
            start_view_enabled: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_style_json_keeps_defaults() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{ "face_match_debounce_ms": 250 }"#).unwrap();
        assert_eq!(cfg.face_match_debounce_ms, 250);
        assert_eq!(cfg.target_width, 480);
        assert_eq!(cfg.attempt_reset_interval_ms, 300_000);
    }
}
