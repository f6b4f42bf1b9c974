pub mod execution;
pub mod remote;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::metrics::EngineContext;
use crate::remote::{JsonCodec, PayloadCodec};
use crate::trace::{Package, StepTrace, TraceError, TracePath};

pub use execution::ExecutionStep;
pub use remote::RemoteStep;

/// Per-step knobs. A zero timeout means the body is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOptions {
    pub use_mutex: bool,
    pub timeout: Duration,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            use_mutex: true,
            timeout: Duration::ZERO,
        }
    }
}

/// Tagged step body. Composite variants own their children.
pub enum StepKind<T> {
    Execution(Box<dyn ExecutionStep<T>>),
    Condition {
        condition: Box<dyn Fn(&Package<T>) -> bool + Send + Sync>,
        on_true: Box<Step<T>>,
        on_false: Box<Step<T>>,
    },
    Combination(Vec<Step<T>>),
    Remote(RemoteStep<T>),
}

/// Unit of work sharing the uniform run contract: trace bookkeeping,
/// optional mutual exclusion, timeout enforcement, error capture, and
/// metrics emission all live here, independent of the variant.
pub struct Step<T> {
    id: String,
    name: String,
    options: StepOptions,
    kind: StepKind<T>,
    mutex: Mutex<()>,
}

fn step_id(kind: &str) -> String {
    format!("M-{}-{}", kind, Uuid::new_v4())
}

impl<T: Send + 'static> Step<T> {
    pub fn execution(step: impl ExecutionStep<T> + 'static) -> Self {
        let id = step_id("execution");
        let name = step.name().to_string();
        Self {
            id,
            name,
            options: StepOptions::default(),
            kind: StepKind::Execution(Box::new(step)),
            mutex: Mutex::new(()),
        }
    }

    pub fn condition(
        condition: impl Fn(&Package<T>) -> bool + Send + Sync + 'static,
        on_true: Step<T>,
        on_false: Step<T>,
    ) -> Self {
        let id = step_id("condition");
        Self {
            name: id.clone(),
            id,
            options: StepOptions::default(),
            kind: StepKind::Condition {
                condition: Box::new(condition),
                on_true: Box::new(on_true),
                on_false: Box::new(on_false),
            },
            mutex: Mutex::new(()),
        }
    }

    pub fn combination(children: Vec<Step<T>>) -> Self {
        let id = step_id("combination");
        Self {
            name: id.clone(),
            id,
            options: StepOptions::default(),
            kind: StepKind::Combination(children),
            mutex: Mutex::new(()),
        }
    }

    pub fn remote(host: impl Into<String>, port: u16) -> Self
    where
        T: Serialize + DeserializeOwned,
    {
        Self::remote_with_codec(host, port, Arc::new(JsonCodec))
    }

    pub fn remote_with_codec(
        host: impl Into<String>,
        port: u16,
        codec: Arc<dyn PayloadCodec<T>>,
    ) -> Self {
        let id = step_id("remote");
        Self {
            name: id.clone(),
            id,
            options: StepOptions::default(),
            kind: StepKind::Remote(RemoteStep::new(host.into(), port, codec)),
            mutex: Mutex::new(()),
        }
    }

    pub fn with_options(mut self, options: StepOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs this step against the container addressed by `path`: appends a
    /// fresh trace node, executes the body under the configured mutex and
    /// timeout, records any failure on both the trace and the package, and
    /// finalizes timing before handing control back to the parent.
    pub(crate) fn run<'a>(
        &'a self,
        pkg: &'a mut Package<T>,
        path: TracePath,
        ctx: &'a EngineContext,
    ) -> BoxFuture<'a, ()> {
        async move {
            let container = pkg.container_mut(&path);
            container.push(StepTrace::new(self.id.clone()));
            let idx = container.len() - 1;
            {
                let trace = &mut container[idx];
                trace.running = true;
                trace.start_time = Some(Utc::now());
            }
            ctx.metrics.step_started(&self.name);

            let mut waiting = Duration::ZERO;
            let _guard = if self.options.use_mutex {
                ctx.metrics.wait_started(&self.name);
                let wait_clock = Instant::now();
                let guard = self.mutex.lock().await;
                waiting = wait_clock.elapsed();
                ctx.metrics.wait_finished(&self.name);
                Some(guard)
            } else {
                None
            };

            let processing_clock = Instant::now();
            let body = AssertUnwindSafe(self.dispatch(&mut *pkg, &path, idx, ctx)).catch_unwind();
            let outcome = if self.options.timeout.is_zero() {
                body.await
            } else {
                match tokio::time::timeout(self.options.timeout, body).await {
                    Ok(outcome) => outcome,
                    // The body future is dropped here, so it can never touch
                    // the trace or payload again.
                    Err(_) => Ok(Err(PipelineError::Timeout(self.options.timeout))),
                }
            };
            let result = match outcome {
                Ok(result) => result,
                Err(panic) => Err(PipelineError::Step(panic_message(panic))),
            };
            let processing = processing_clock.elapsed();

            match result {
                Ok(()) => {
                    let (_, trace) = pkg.data_and_trace(&path, idx);
                    if !trace.success {
                        // User-flagged failure without an error value.
                        let message = if trace.message.is_empty() {
                            "step reported failure".to_string()
                        } else {
                            trace.message.clone()
                        };
                        let error =
                            TraceError::new("StepError", message).with_context(self.id.clone());
                        trace.error = Some(error.clone());
                        pkg.record_error(error);
                    } else if !pkg.success {
                        // A child failed beneath this composite.
                        let (_, trace) = pkg.data_and_trace(&path, idx);
                        trace.success = false;
                    }
                }
                Err(err) => {
                    debug!("Step '{}' failed: {}", self.name, err);
                    let error =
                        TraceError::capture(&err, &ctx.capture).with_context(self.id.clone());
                    {
                        let (_, trace) = pkg.data_and_trace(&path, idx);
                        trace.success = false;
                        trace.error = Some(error.clone());
                        if trace.message.is_empty() {
                            trace.message = err.to_string();
                        }
                    }
                    pkg.record_error(error);
                }
            }

            let errored = {
                let (_, trace) = pkg.data_and_trace(&path, idx);
                trace.running = false;
                trace.end_time = Some(Utc::now());
                trace.waiting_time = waiting;
                trace.processing_time = processing;
                trace.total_time = waiting + processing;
                !trace.success
            };

            ctx.metrics.record_waiting(&self.name, waiting);
            ctx.metrics.record_processing(&self.name, processing, errored);
            ctx.metrics.record_total(&self.name, waiting + processing, errored);
            ctx.metrics.step_finished(&self.name);
        }
        .boxed()
    }

    async fn dispatch(
        &self,
        pkg: &mut Package<T>,
        path: &TracePath,
        idx: usize,
        ctx: &EngineContext,
    ) -> Result<(), PipelineError> {
        match &self.kind {
            StepKind::Execution(step) => {
                let (data, trace) = pkg.data_and_trace(path, idx);
                step.execute(data, trace).await
            }
            StepKind::Condition {
                condition,
                on_true,
                on_false,
            } => {
                let branch = if condition(&*pkg) { on_true } else { on_false };
                branch.run(pkg, path.child(idx), ctx).await;
                Ok(())
            }
            StepKind::Combination(children) => {
                for child in children {
                    child.run(&mut *pkg, path.child(idx), ctx).await;
                    if !pkg.success {
                        break;
                    }
                }
                Ok(())
            }
            StepKind::Remote(remote) => remote.call(pkg, path, idx, ctx).await,
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "step panicked".to_string()
    }
}
