use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::controller::ControllerMode;
use crate::error::{PipelineError, WireError};
use crate::metrics::EngineContext;
use crate::remote::framing::{write_frame, FrameReader};
use crate::remote::wire::{PayloadCodec, RunRequest, RunResponse};
use crate::step::Step;
use crate::trace::{ControllerTrace, Package, PhaseTrace, TracePath};

/// Hosts exactly one step behind the remote-step contract: every request
/// is decoded, dispatched through the step's normal run path, and answered
/// with the updated package.
pub struct StepServer<T> {
    listener: TcpListener,
    shared: Arc<ServerShared<T>>,
}

struct ServerShared<T> {
    step: Step<T>,
    codec: Arc<dyn PayloadCodec<T>>,
    ctx: EngineContext,
}

impl<T: Send + Sync + 'static> StepServer<T> {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        step: Step<T>,
        codec: Arc<dyn PayloadCodec<T>>,
    ) -> Result<Self, PipelineError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            shared: Arc::new(ServerShared {
                step,
                codec,
                ctx: EngineContext::default(),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, PipelineError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn serve(self) -> Result<(), PipelineError> {
        info!(
            "Hosting step '{}' on {}",
            self.shared.step.name(),
            self.listener.local_addr()?
        );
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    continue;
                }
            };
            debug!("New peer connected: {}", peer);
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(shared, stream).await {
                    error!("Error handling peer {}: {}", peer, e);
                }
            });
        }
    }
}

async fn handle_connection<T: Send + Sync + 'static>(
    shared: Arc<ServerShared<T>>,
    stream: TcpStream,
) -> Result<(), PipelineError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);
    loop {
        let body = match reader.read_frame().await {
            Ok(body) => body,
            Err(WireError::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let request = RunRequest::from_bytes(&body)?;
        let response = shared.handle(request).await?;
        write_frame(&mut write_half, &response.to_bytes()?).await?;
    }
}

impl<T: Send + Sync + 'static> ServerShared<T> {
    async fn handle(&self, request: RunRequest) -> Result<RunResponse, PipelineError> {
        let mut pkg = Package::from_wire(request.package, self.codec.as_ref())?;
        debug!("Dispatching package {} through hosted step", pkg.id());

        // The caller's own trace node is already in the tree; run the hosted
        // step under it so the merge back home lands in the right place.
        let container = request
            .parent_step
            .as_ref()
            .and_then(|parent| pkg.find_step_container(&parent.id))
            .unwrap_or_else(|| standalone_container(&mut pkg));
        self.step.run(&mut pkg, container, &self.ctx).await;

        let error = if pkg.success {
            None
        } else {
            pkg.errors.last().cloned()
        };
        Ok(RunResponse {
            package: pkg.to_wire(self.codec.as_ref())?,
            error,
        })
    }
}

/// Callers that send no parent still get their traces recorded, under a
/// synthetic controller appended to the package.
fn standalone_container<T>(pkg: &mut Package<T>) -> TracePath {
    let mut controller = ControllerTrace::new(
        format!("C-{}", Uuid::new_v4()),
        ControllerMode::NoOrder,
        0,
        0,
    );
    controller.phases.push(PhaseTrace::new(format!("P-{}", Uuid::new_v4())));
    pkg.controllers.push(controller);
    TracePath::new(pkg.controllers.len() - 1, 0)
}
