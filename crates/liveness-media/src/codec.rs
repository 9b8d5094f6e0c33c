use serde::{Deserialize, Serialize};

/// Video codecs the verification service accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    Vp8,
    Vp9,
}

/// Which muxer backend handles a codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxerBackend {
    /// Fragmented container, one segment per keyframe.
    Keyframe,
    /// Streaming cluster container, segments on a minimum time interval.
    Interval,
}

impl VideoCodec {
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::H264 => "video/avc",
            Self::Vp8 => "video/x-vnd.on2.vp8",
            Self::Vp9 => "video/x-vnd.on2.vp9",
        }
    }

    pub fn backend(&self) -> MuxerBackend {
        match self {
            Self::H264 => MuxerBackend::Keyframe,
            Self::Vp8 | Self::Vp9 => MuxerBackend::Interval,
        }
    }

    pub(crate) fn tag(&self) -> u8 {
        match self {
            Self::H264 => 1,
            Self::Vp8 => 2,
            Self::Vp9 => 3,
        }
    }
}

impl std::str::FromStr for VideoCodec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "h264" | "avc" | "video/avc" => Ok(Self::H264),
            "vp8" | "video/x-vnd.on2.vp8" => Ok(Self::Vp8),
            "vp9" | "video/x-vnd.on2.vp9" => Ok(Self::Vp9),
            other => Err(format!("unsupported video codec: {other}")),
        }
    }
}

/// Negotiated output format of the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoFormat {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub bitrate: u32,
    pub frame_rate: u32,
    /// Seconds between keyframes.
    pub keyframe_interval_s: u32,
}

impl VideoFormat {
    /// Frames that may pass before a keyframe must be requested.
    pub fn frames_per_keyframe(&self) -> u32 {
        self.frame_rate.saturating_mul(self.keyframe_interval_s).max(1)
    }
}

pub const BUFFER_FLAG_KEY_FRAME: u32 = 0x1;
pub const BUFFER_FLAG_END_OF_STREAM: u32 = 0x4;

/// Metadata delivered with every encoded buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BufferInfo {
    pub presentation_time_us: i64,
    pub flags: u32,
}

impl BufferInfo {
    pub fn keyframe(presentation_time_us: i64) -> Self {
        Self {
            presentation_time_us,
            flags: BUFFER_FLAG_KEY_FRAME,
        }
    }

    pub fn delta(presentation_time_us: i64) -> Self {
        Self {
            presentation_time_us,
            flags: 0,
        }
    }

    pub fn is_keyframe(&self) -> bool {
        self.flags & BUFFER_FLAG_KEY_FRAME != 0
    }
}

/// One encoded buffer on its way to the muxer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub data: Vec<u8>,
    pub info: BufferInfo,
}
