pub mod config;
pub mod controller;
pub mod demo;
pub mod error;
pub mod metrics;
pub mod phase;
pub mod pipeline;
pub mod remote;
pub mod step;
pub mod trace;

pub use controller::{ControllerMode, Delivery, PipelineController};
pub use error::{PipelineError, WireError};
pub use metrics::{EngineContext, MetricsSink, NullSink, StatsCollector, StepStats};
pub use phase::PipelinePhase;
pub use pipeline::{Callback, Pipeline};
pub use remote::{JsonCodec, PayloadCodec, StepServer};
pub use step::{ExecutionStep, Step, StepKind, StepOptions};
pub use trace::{
    CaptureOptions, ControllerTrace, Immutable, Package, PhaseTrace, StepTrace, TraceError,
};
