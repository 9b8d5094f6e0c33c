//! Built-in container writers.
//!
//! Both writers append to a staging file and never seek backwards, so a
//! second read handle can stream the file while it grows. Multi-byte fields
//! are little-endian.
//!
//! ```text
//! header   := magic[4] version:u8 codec:u8 width:u32 height:u32 frame_rate:u32
//! fragment := "frag" sequence:u32 count:u32 sample*count
//! cluster  := "clst" timecode_us:i64
//! block    := "blck" sample
//! sample   := pts_us:i64 flags:u32 len:u32 data[len]
//! ```

use std::fs::File;
use std::io::Write;

use crate::codec::{BufferInfo, VideoFormat};
use crate::muxer::MuxerError;

pub const FRAGMENTED_MAGIC: &[u8; 4] = b"LVFM";
pub const CLUSTER_MAGIC: &[u8; 4] = b"LVCL";
const VERSION: u8 = 1;

/// Sink for encoded samples in some container layout.
pub trait ContainerWriter: Send {
    fn write_sample(&mut self, data: &[u8], info: &BufferInfo) -> Result<(), MuxerError>;

    /// Flush anything buffered. The writer is unusable afterwards.
    fn finish(&mut self) -> Result<(), MuxerError>;
}

fn header(magic: &[u8; 4], format: &VideoFormat) -> Vec<u8> {
    let mut out = Vec::with_capacity(18);
    out.extend_from_slice(magic);
    out.push(VERSION);
    out.push(format.codec.tag());
    out.extend_from_slice(&format.width.to_le_bytes());
    out.extend_from_slice(&format.height.to_le_bytes());
    out.extend_from_slice(&format.frame_rate.to_le_bytes());
    out
}

fn encode_sample(out: &mut Vec<u8>, data: &[u8], info: &BufferInfo) -> Result<(), MuxerError> {
    let len = u32::try_from(data.len()).map_err(|_| MuxerError::SampleTooLarge(data.len()))?;
    out.extend_from_slice(&info.presentation_time_us.to_le_bytes());
    out.extend_from_slice(&info.flags.to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(data);
    Ok(())
}

fn check_sample(data: &[u8]) -> Result<(), MuxerError> {
    if data.is_empty() {
        return Err(MuxerError::EmptySample);
    }
    Ok(())
}

/// Fragmented layout: samples are held back and written as one fragment
/// when the next keyframe arrives, so every fragment starts on a keyframe.
pub struct FragmentedWriter {
    file: Option<File>,
    pending: Vec<u8>,
    pending_samples: u32,
    sequence: u32,
}

impl FragmentedWriter {
    pub fn new(mut file: File, format: &VideoFormat) -> Result<Self, MuxerError> {
        file.write_all(&header(FRAGMENTED_MAGIC, format))?;
        file.flush()?;
        Ok(Self {
            file: Some(file),
            pending: Vec::new(),
            pending_samples: 0,
            sequence: 0,
        })
    }

    fn flush_fragment(&mut self) -> Result<(), MuxerError> {
        if self.pending_samples == 0 {
            return Ok(());
        }
        let file = self.file.as_mut().ok_or(MuxerError::NotStarted)?;
        let mut fragment = Vec::with_capacity(12 + self.pending.len());
        fragment.extend_from_slice(b"frag");
        fragment.extend_from_slice(&self.sequence.to_le_bytes());
        fragment.extend_from_slice(&self.pending_samples.to_le_bytes());
        fragment.append(&mut self.pending);
        file.write_all(&fragment)?;
        file.flush()?;
        tracing::trace!(sequence = self.sequence, samples = self.pending_samples, "fragment written");
        self.sequence += 1;
        self.pending_samples = 0;
        Ok(())
    }
}

impl ContainerWriter for FragmentedWriter {
    fn write_sample(&mut self, data: &[u8], info: &BufferInfo) -> Result<(), MuxerError> {
        check_sample(data)?;
        if self.file.is_none() {
            return Err(MuxerError::NotStarted);
        }
        if info.is_keyframe() {
            self.flush_fragment()?;
        }
        encode_sample(&mut self.pending, data, info)?;
        self.pending_samples += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), MuxerError> {
        let result = self.flush_fragment();
        self.file = None;
        result
    }
}

/// Streaming layout: every sample is written immediately; a keyframe opens a
/// new cluster.
pub struct ClusterWriter {
    file: Option<File>,
}

impl ClusterWriter {
    pub fn new(mut file: File, format: &VideoFormat) -> Result<Self, MuxerError> {
        file.write_all(&header(CLUSTER_MAGIC, format))?;
        file.flush()?;
        Ok(Self { file: Some(file) })
    }
}

impl ContainerWriter for ClusterWriter {
    fn write_sample(&mut self, data: &[u8], info: &BufferInfo) -> Result<(), MuxerError> {
        check_sample(data)?;
        let file = self.file.as_mut().ok_or(MuxerError::NotStarted)?;
        let mut record = Vec::with_capacity(32 + data.len());
        if info.is_keyframe() {
            record.extend_from_slice(b"clst");
            record.extend_from_slice(&info.presentation_time_us.to_le_bytes());
        }
        record.extend_from_slice(b"blck");
        encode_sample(&mut record, data, info)?;
        file.write_all(&record)?;
        file.flush()?;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), MuxerError> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        Ok(())
    }
}
