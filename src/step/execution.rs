use async_trait::async_trait;

use crate::error::PipelineError;
use crate::trace::StepTrace;

/// User-supplied body of a leaf step.
///
/// Implementations read and write the payload and may set `success` and
/// `message` on their trace. A failure is reported either by returning
/// `Err` or by leaving `trace.success == false`; the surrounding run
/// machinery records it on the package both ways.
#[async_trait]
pub trait ExecutionStep<T>: Send + Sync {
    async fn execute(&self, data: &mut T, trace: &mut StepTrace) -> Result<(), PipelineError>;

    /// Display name, used for logging and metrics labels.
    fn name(&self) -> &'static str;
}
