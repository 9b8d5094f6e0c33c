//! Video side of a liveness session: codec negotiation, chunked muxing into a
//! staging file, and the encoder worker that feeds the muxer.

pub mod codec;
pub mod container;
pub mod encoder;
pub mod muxer;
pub mod segment;

pub use codec::{BufferInfo, EncodedFrame, MuxerBackend, VideoCodec, VideoFormat};
pub use encoder::{spawn_encoder, CodecError, EncoderConfig, EncoderError, EncoderHandle, EncoderSink};
pub use muxer::{DefaultMuxerFactory, LivenessMuxer, MuxerConfig, MuxerError, MuxerFactory};
pub use segment::{MuxedSegment, OnMuxedSegment};
