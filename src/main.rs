use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flowline::config::Settings;
use flowline::demo::{JitteredUppercase, MarkStatus, Record, ValidateRecord};
use flowline::{
    ControllerMode, Package, Pipeline, PipelineController, PipelineError, PipelinePhase,
    StatsCollector, Step, StepOptions,
};
use tracing::{info, Level};

fn init_logging() {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();
}

#[tokio::main]
async fn main() -> Result<(), PipelineError> {
    init_logging();
    let settings = Settings::new().map_err(|e| PipelineError::Config(e.to_string()))?;

    let metrics = Arc::new(StatsCollector::new());

    let mut transform_steps = vec![Step::execution(JitteredUppercase::new(100, 600))
        .with_options(StepOptions {
            use_mutex: false,
            timeout: Duration::from_secs(40),
        })];
    if settings.remote.enabled {
        transform_steps.push(Step::remote(
            settings.remote.host.clone(),
            settings.remote.port,
        ));
    }
    let transform = Step::combination(transform_steps).with_options(StepOptions {
        use_mutex: false,
        timeout: Duration::ZERO,
    });

    let pipeline = Pipeline::new(
        "demo",
        vec![
            PipelineController::new(
                "validate",
                ControllerMode::OrderBySequence,
                settings.demo.max_workers,
                vec![PipelinePhase::named(
                    "validation",
                    vec![Step::execution(ValidateRecord)],
                )],
            ),
            PipelineController::new(
                "branch",
                ControllerMode::NotParallel,
                settings.demo.max_workers,
                vec![PipelinePhase::named(
                    "branching",
                    vec![Step::condition(
                        |pkg: &Package<Record>| pkg.data.condition,
                        Step::execution(MarkStatus::success()),
                        Step::execution(MarkStatus::failure()),
                    )],
                )],
            ),
            PipelineController::new(
                "transform",
                ControllerMode::OrderBySequence,
                settings.demo.max_workers,
                vec![PipelinePhase::named("transformation", vec![transform])],
            ),
        ],
    )
    .with_metrics(Arc::clone(&metrics) as _);

    let instance = pipeline.register_instance();
    let settled = Arc::new(AtomicUsize::new(0));

    for i in 0..settings.demo.submissions {
        let mut record = Record::with_key(format!("value{}", i));
        record.condition = i % 2 == 0;

        let on_success = {
            let settled = Arc::clone(&settled);
            move |pkg: Package<Record>| {
                info!("OK: {:?}", pkg.data);
                settled.fetch_add(1, Ordering::SeqCst);
            }
        };
        let on_exit = {
            let settled = Arc::clone(&settled);
            move |pkg: Package<Record>| {
                info!("EXIT: {}", last_reached_id(&pkg));
                settled.fetch_add(1, Ordering::SeqCst);
            }
        };
        let on_error = {
            let settled = Arc::clone(&settled);
            move |pkg: Package<Record>| {
                let message = pkg
                    .errors
                    .first()
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                info!("ERROR: {}", message);
                settled.fetch_add(1, Ordering::SeqCst);
            }
        };
        pipeline.execute(record, &instance, on_success, on_exit, on_error);
    }

    while settled.load(Ordering::SeqCst) < settings.demo.submissions {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    pipeline.unregister_instance(&instance)?;

    for (step, stats) in metrics.snapshot() {
        info!(
            "step {}: {} runs, avg total {}us, max total {}us",
            step, stats.finished, stats.avg_total_us as u64, stats.max_total_us
        );
    }
    info!("All submissions settled");
    Ok(())
}

/// Deepest trace id reached, reported on the exit path.
fn last_reached_id(pkg: &Package<Record>) -> String {
    let Some(controller) = pkg.controllers.last() else {
        return pkg.id().to_string();
    };
    let Some(phase) = controller.phases.last() else {
        return controller.id.clone();
    };
    let mut step = match phase.steps.last() {
        Some(step) => step,
        None => return phase.id.clone(),
    };
    while let Some(child) = step.children.last() {
        step = child;
    }
    step.id.clone()
}
