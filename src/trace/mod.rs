pub mod error;
pub mod package;

pub use error::{CaptureOptions, TraceError};
pub use package::{ControllerTrace, Immutable, Package, PhaseTrace, StepTrace};

pub(crate) use package::TracePath;
