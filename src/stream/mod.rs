//! Upstream SSE to OpenAI transcoding pipeline.
//!
//! Bytes flow through [`framer::LineStream`] into lines, each line is
//! decoded by [`decoder::decode_line`], and [`transcoder::drive`] feeds the
//! resulting events into a [`transcoder::Transcoder`] bound to either a
//! live SSE sink or a buffering sink.

pub mod decoder;
pub mod framer;
pub mod sse;
pub mod transcoder;

pub use decoder::UpstreamEvent;
pub use framer::{LineFramer, LineStream};
pub use transcoder::{
    drive, BufferedSink, LiveSink, OutputSink, ResponseMeta, Termination, Transcoder,
    TranscoderState,
};
