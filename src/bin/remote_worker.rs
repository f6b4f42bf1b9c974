//! Standalone peer hosting one step behind the remote-step contract.

use std::sync::Arc;
use std::time::Duration;

use flowline::config::Settings;
use flowline::demo::UppercaseKey;
use flowline::{JsonCodec, PipelineError, Step, StepOptions, StepServer};
use tracing::Level;

fn init_logging() {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();
}

#[tokio::main]
async fn main() -> Result<(), PipelineError> {
    init_logging();
    let settings = Settings::new().map_err(|e| PipelineError::Config(e.to_string()))?;

    let step = Step::execution(UppercaseKey).with_options(StepOptions {
        use_mutex: false,
        timeout: Duration::from_secs(4),
    });
    let server = StepServer::bind(
        (settings.remote.host.as_str(), settings.remote.port),
        step,
        Arc::new(JsonCodec),
    )
    .await?;
    server.serve().await
}
