//! Example payload and steps used by the demo binary and the tests.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::step::ExecutionStep;
use crate::trace::StepTrace;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    pub condition: bool,
    pub status: String,
}

impl Record {
    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }
}

/// Rejects records without a key.
pub struct ValidateRecord;

#[async_trait]
impl ExecutionStep<Record> for ValidateRecord {
    async fn execute(
        &self,
        data: &mut Record,
        trace: &mut StepTrace,
    ) -> Result<(), PipelineError> {
        if data.key.is_empty() {
            return Err(PipelineError::Step(
                "validation failed: key missing".to_string(),
            ));
        }
        trace.message = "validation succeeded".to_string();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ValidateRecord"
    }
}

/// Uppercases the key in place.
pub struct UppercaseKey;

#[async_trait]
impl ExecutionStep<Record> for UppercaseKey {
    async fn execute(
        &self,
        data: &mut Record,
        trace: &mut StepTrace,
    ) -> Result<(), PipelineError> {
        if data.key.is_empty() {
            trace.success = false;
            trace.message = "transformation failed: key missing".to_string();
            return Ok(());
        }
        data.key = data.key.to_uppercase();
        trace.message = "transformation succeeded".to_string();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "UppercaseKey"
    }
}

/// Uppercases the key after a random delay, for exercising the schedulers
/// with out-of-order completions.
pub struct JitteredUppercase {
    min_ms: u64,
    max_ms: u64,
}

impl JitteredUppercase {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }
}

#[async_trait]
impl ExecutionStep<Record> for JitteredUppercase {
    async fn execute(
        &self,
        data: &mut Record,
        trace: &mut StepTrace,
    ) -> Result<(), PipelineError> {
        let delay = rand::rng().random_range(self.min_ms..=self.max_ms);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        data.key = data.key.to_uppercase();
        trace.message = format!("transformed after {}ms", delay);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "JitteredUppercase"
    }
}

/// Stamps the record status; used as condition-step branches.
pub struct MarkStatus {
    status: &'static str,
}

impl MarkStatus {
    pub fn success() -> Self {
        Self { status: "success" }
    }

    pub fn failure() -> Self {
        Self { status: "failure" }
    }
}

#[async_trait]
impl ExecutionStep<Record> for MarkStatus {
    async fn execute(
        &self,
        data: &mut Record,
        trace: &mut StepTrace,
    ) -> Result<(), PipelineError> {
        data.status = self.status.to_string();
        trace.message = format!("status set to {}", self.status);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "MarkStatus"
    }
}
