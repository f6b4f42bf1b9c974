use std::time::Duration;

use thiserror::Error;

use crate::trace::TraceError;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("step failed: {0}")]
    Step(String),
    #[error("step timed out after {0:?}")]
    Timeout(Duration),
    #[error("remote step failed: {0}")]
    Remote(TraceError),
    #[error("unknown pipeline instance: {0}")]
    UnknownInstance(String),
    #[error("immutable field already set: {0}")]
    ImmutableField(&'static str),
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Stable kind tag carried on trace errors, preserved across the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Step(_) => "StepError",
            PipelineError::Timeout(_) => "TimeoutError",
            PipelineError::Remote(_) => "RemoteError",
            PipelineError::UnknownInstance(_) => "UnknownInstanceError",
            PipelineError::ImmutableField(_) => "ImmutableFieldError",
            PipelineError::Wire(_) => "WireError",
            PipelineError::Io(_) => "IoError",
            PipelineError::Encode(_) => "EncodeError",
            PipelineError::Config(_) => "ConfigError",
        }
    }
}

// WireError stays a detailed, specific error type for remote framing.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("failed to read frame: {0}")]
    Read(std::io::Error),
    #[error("failed to write frame: {0}")]
    Write(std::io::Error),
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("invalid frame header of {0} bytes")]
    InvalidHeader(usize),
    #[error("frame of {0} bytes exceeds limit of {1}")]
    Oversized(usize, usize),
    #[error("failed to decode message: {0}")]
    Decode(#[from] serde_json::Error),
}
