use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::trace::{Package, StepTrace, TraceError};

/// Encodes the opaque payload blob carried inside wire packages. Both
/// endpoints must agree on the codec.
pub trait PayloadCodec<T>: Send + Sync {
    fn encode(&self, data: &T) -> Result<Vec<u8>, PipelineError>;
    fn decode(&self, bytes: &[u8]) -> Result<T, PipelineError>;
}

/// Canonical language-neutral default codec.
pub struct JsonCodec;

impl<T: Serialize + DeserializeOwned> PayloadCodec<T> for JsonCodec {
    fn encode(&self, data: &T) -> Result<Vec<u8>, PipelineError> {
        Ok(serde_json::to_vec(data)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, PipelineError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// One remote-step invocation: the full package plus the caller's step
/// trace node, so the peer can graft its work under it.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunRequest {
    pub package: Package<Vec<u8>>,
    pub parent_step: Option<StepTrace>,
}

impl RunRequest {
    pub fn to_bytes(&self) -> Result<Vec<u8>, PipelineError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PipelineError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// The peer's answer: the updated package, plus the error when the hosted
/// step failed.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunResponse {
    pub package: Package<Vec<u8>>,
    pub error: Option<TraceError>,
}

impl RunResponse {
    pub fn to_bytes(&self) -> Result<Vec<u8>, PipelineError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PipelineError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
