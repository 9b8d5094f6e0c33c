//! Color "freshness" challenge playback.
//!
//! A [`FreshnessPlayer`] turns the color list of a [`ColorChallenge`] into a
//! contiguous schedule of scenes and, given the current time, tells the UI
//! which colors to paint. Playback is driven entirely by the caller's clock.
//!
//! [`ColorChallenge`]: crate::model::ColorChallenge

use serde::Serialize;

use crate::model::{ColorSpec, RgbColor};

/// Alpha for the first scene of the sequence.
pub const FIRST_SCENE_ALPHA: u8 = (255.0 * 0.90) as u8;
/// Alpha for every later scene.
pub const REMAINING_SCENE_ALPHA: u8 = (255.0 * 0.75) as u8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneType {
    /// The new color scrolls down over the previous one.
    DownScroll,
    Flat,
}

/// One scheduled scene, in milliseconds relative to playback start.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FreshnessColorScene {
    pub start_ms: u64,
    pub end_ms: u64,
    pub current: ColorSpec,
    pub previous: Option<ColorSpec>,
    pub scene_type: SceneType,
}

impl FreshnessColorScene {
    pub fn duration_ms(&self) -> u64 {
        self.end_ms - self.start_ms
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RgbaColor {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    pub alpha: u8,
}

impl RgbaColor {
    pub fn from_rgb(color: RgbColor, alpha: u8) -> Self {
        Self {
            red: color.red,
            green: color.green,
            blue: color.blue,
            alpha,
        }
    }
}

/// What the UI should paint right now.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FreshnessColorFrame {
    pub scene_type: SceneType,
    pub current_color: RgbaColor,
    pub previous_color: Option<RgbaColor>,
    /// 0-100 for scrolling scenes, always 100 for flat ones.
    pub scene_completion_percentage: f32,
}

/// Emitted once per scene, the first time it becomes current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorDisplayed {
    pub current: RgbColor,
    /// Previous scene's color, or the current one for the first scene.
    pub previous: RgbColor,
    pub sequence_number: usize,
    pub timestamp_ms: i64,
}

pub type OnColorDisplayed = Box<dyn FnMut(ColorDisplayed) + Send>;
pub type OnPlaybackComplete = Box<dyn FnOnce() + Send>;

/// Build the prefix-sum schedule for a color list.
pub fn build_schedule(colors: &[ColorSpec]) -> Vec<FreshnessColorScene> {
    let mut start_ms = 0u64;
    colors
        .iter()
        .enumerate()
        .map(|(index, color)| {
            let end_ms = start_ms + color.duration_ms;
            let scene = FreshnessColorScene {
                start_ms,
                end_ms,
                current: *color,
                previous: index.checked_sub(1).map(|i| colors[i]),
                scene_type: if color.should_scroll {
                    SceneType::DownScroll
                } else {
                    SceneType::Flat
                },
            };
            start_ms = end_ms;
            scene
        })
        .collect()
}

pub struct FreshnessPlayer {
    scenes: Vec<FreshnessColorScene>,
    playback_start_ms: Option<i64>,
    current_index: usize,
    last_displayed: Option<usize>,
    finished: bool,
    on_color_displayed: OnColorDisplayed,
    on_complete: Option<OnPlaybackComplete>,
}

impl FreshnessPlayer {
    pub fn new(
        colors: &[ColorSpec],
        on_color_displayed: OnColorDisplayed,
        on_complete: OnPlaybackComplete,
    ) -> Self {
        Self {
            scenes: build_schedule(colors),
            playback_start_ms: None,
            current_index: 0,
            last_displayed: None,
            finished: false,
            on_color_displayed,
            on_complete: Some(on_complete),
        }
    }

    pub fn scenes(&self) -> &[FreshnessColorScene] {
        &self.scenes
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Frame to display at `now_ms`, or `None` once playback has ended.
    ///
    /// The first call latches the playback start. Expired scenes are skipped
    /// even if several elapsed between calls.
    pub fn next_frame(&mut self, now_ms: i64) -> Option<FreshnessColorFrame> {
        if self.finished {
            return None;
        }
        let start = *self.playback_start_ms.get_or_insert(now_ms);
        let playback_ms = now_ms.saturating_sub(start).max(0) as u64;

        while self
            .scenes
            .get(self.current_index)
            .map_or(true, |scene| playback_ms > scene.end_ms)
        {
            if self.current_index >= self.scenes.len() {
                self.finish();
                return None;
            }
            self.current_index += 1;
        }

        let index = self.current_index;
        let scene = &self.scenes[index];
        let current = scene.current.color;
        let previous = scene.previous.map(|p| p.color);

        if self.last_displayed != Some(index) {
            self.last_displayed = Some(index);
            (self.on_color_displayed)(ColorDisplayed {
                current,
                previous: previous.unwrap_or(current),
                sequence_number: index,
                timestamp_ms: now_ms,
            });
        }

        let scene_completion_percentage = match scene.scene_type {
            SceneType::DownScroll if scene.duration_ms() > 0 => {
                let elapsed = playback_ms.saturating_sub(scene.start_ms);
                (elapsed as f32 / scene.duration_ms() as f32 * 100.0).min(100.0)
            }
            _ => 100.0,
        };

        Some(FreshnessColorFrame {
            scene_type: scene.scene_type,
            current_color: RgbaColor::from_rgb(current, alpha_for(index == 0)),
            previous_color: previous.map(|p| RgbaColor::from_rgb(p, alpha_for(index == 1))),
            scene_completion_percentage,
        })
    }

    fn finish(&mut self) {
        self.finished = true;
        if let Some(on_complete) = self.on_complete.take() {
            tracing::debug!(scenes = self.scenes.len(), "freshness playback complete");
            on_complete();
        }
    }
}

fn alpha_for(first_scene: bool) -> u8 {
    if first_scene {
        FIRST_SCENE_ALPHA
    } else {
        REMAINING_SCENE_ALPHA
    }
}
