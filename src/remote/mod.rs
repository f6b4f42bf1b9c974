pub(crate) mod framing;
pub mod server;
pub mod wire;

pub use server::StepServer;
pub use wire::{JsonCodec, PayloadCodec, RunRequest, RunResponse};
