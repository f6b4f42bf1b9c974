use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::debug;

use crate::error::PipelineError;
use crate::metrics::EngineContext;
use crate::remote::framing::{write_frame, FrameReader};
use crate::remote::wire::{RunRequest, RunResponse};
use crate::remote::PayloadCodec;
use crate::trace::{Package, TracePath};

/// Leaf step whose body runs on a peer behind the remote-step contract.
///
/// One connect/request/response exchange per invocation; the peer's trace
/// additions are merged back by id on success, and a peer-side error is
/// re-raised locally with the remote frames preserved.
pub struct RemoteStep<T> {
    host: String,
    port: u16,
    codec: Arc<dyn PayloadCodec<T>>,
}

impl<T> RemoteStep<T> {
    pub(crate) fn new(host: String, port: u16, codec: Arc<dyn PayloadCodec<T>>) -> Self {
        Self { host, port, codec }
    }

    pub(crate) async fn call(
        &self,
        pkg: &mut Package<T>,
        path: &TracePath,
        idx: usize,
        _ctx: &EngineContext,
    ) -> Result<(), PipelineError> {
        // Our own trace node is already in the tree, so the peer can graft
        // its work under it by id.
        let parent_step = pkg.container(path)[idx].clone();
        let request = RunRequest {
            package: pkg.to_wire(self.codec.as_ref())?,
            parent_step: Some(parent_step),
        };

        debug!("Calling remote step at {}:{}", self.host, self.port);
        let mut stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        write_frame(&mut stream, &request.to_bytes()?).await?;

        let mut reader = FrameReader::new(stream);
        let body = reader.read_frame().await?;
        let response = RunResponse::from_bytes(&body)?;

        if let Some(remote_error) = response.error {
            return Err(PipelineError::Remote(remote_error));
        }
        pkg.merge_wire(response.package, self.codec.as_ref())?;
        Ok(())
    }
}
