use std::backtrace::Backtrace;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PipelineError;

/// Controls how much context is captured into a [`TraceError`].
///
/// Frame and thread capture are on by default; the environment snapshot is
/// opt-in because it can leak host details into transported errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureOptions {
    pub frames: bool,
    pub thread: bool,
    pub environment: bool,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            frames: true,
            thread: true,
            environment: false,
        }
    }
}

/// Structured, transportable error value recorded on step traces and
/// package error lists. Round-trips across the remote-step wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceError {
    pub id: String,
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub frames: Vec<String>,
    #[serde(default)]
    pub thread: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl TraceError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: format!("E-{}", Uuid::new_v4()),
            kind: kind.into(),
            message: message.into(),
            frames: Vec::new(),
            thread: None,
            context: None,
            environment: BTreeMap::new(),
        }
    }

    /// Captures a [`PipelineError`] into a transportable value.
    ///
    /// Remote errors are passed through untouched so the peer's frames
    /// survive the hop; everything else is stamped with local context
    /// according to `options`.
    pub fn capture(err: &PipelineError, options: &CaptureOptions) -> Self {
        if let PipelineError::Remote(remote) = err {
            return remote.clone();
        }

        let mut error = TraceError::new(err.kind(), err.to_string());
        if options.frames {
            error.frames = format_frames(&Backtrace::force_capture());
        }
        if options.thread {
            error.thread = std::thread::current().name().map(str::to_owned);
        }
        if options.environment {
            error.environment = std::env::vars().collect();
        }
        error
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl fmt::Display for TraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

fn format_frames(backtrace: &Backtrace) -> Vec<String> {
    backtrace
        .to_string()
        .lines()
        .map(|line| line.trim().to_owned())
        .filter(|line| !line.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_records_kind_and_message() {
        let err = PipelineError::Step("validation failed: key missing".to_string());
        let captured = TraceError::capture(&err, &CaptureOptions::default());
        assert_eq!(captured.kind, "StepError");
        assert!(captured.message.contains("key missing"));
        assert!(!captured.frames.is_empty());
    }

    #[test]
    fn test_capture_passes_remote_error_through() {
        let mut remote = TraceError::new("ValueError", "peer exploded");
        remote.frames = vec!["peer.rs:42".to_string()];
        let err = PipelineError::Remote(remote.clone());
        let captured = TraceError::capture(&err, &CaptureOptions::default());
        assert_eq!(captured, remote);
    }

    #[test]
    fn test_environment_capture_is_opt_in() {
        let err = PipelineError::Step("boom".to_string());
        let captured = TraceError::capture(&err, &CaptureOptions::default());
        assert!(captured.environment.is_empty());

        let options = CaptureOptions {
            environment: true,
            ..CaptureOptions::default()
        };
        std::env::set_var("FLOWLINE_TEST_MARKER", "1");
        let captured = TraceError::capture(&err, &options);
        assert!(captured.environment.contains_key("FLOWLINE_TEST_MARKER"));
    }

    #[test]
    fn test_serde_round_trip() {
        let error = TraceError::new("TimeoutError", "step timed out after 100ms")
            .with_context("M-execution-abc");
        let encoded = serde_json::to_string(&error).unwrap();
        let decoded: TraceError = serde_json::from_str(&encoded).unwrap();
        assert_eq!(error, decoded);
    }
}
