use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::FutureExt;
use indexmap::IndexSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::controller::{Delivery, DeliveryFn, PipelineController};
use crate::error::PipelineError;
use crate::metrics::{EngineContext, MetricsSink};
use crate::trace::{CaptureOptions, Package, TraceError};

/// Completion callback; exactly one of the three fires per submission.
pub type Callback<T> = Arc<dyn Fn(Package<T>) + Send + Sync>;

/// Fixed, ordered list of controllers plus the instance registry.
///
/// A submission is wrapped into a package and driven through the
/// controllers in order; callbacks fire from controller worker tasks.
pub struct Pipeline<T> {
    id: String,
    name: String,
    controllers: Arc<Vec<Arc<PipelineController<T>>>>,
    instances: Mutex<IndexSet<String>>,
    ctx: Arc<EngineContext>,
}

impl<T: Clone + Send + 'static> Pipeline<T> {
    pub fn new(name: impl Into<String>, controllers: Vec<PipelineController<T>>) -> Self {
        Self {
            id: format!("PL-{}", Uuid::new_v4()),
            name: name.into(),
            controllers: Arc::new(controllers.into_iter().map(Arc::new).collect()),
            instances: Mutex::new(IndexSet::new()),
            ctx: Arc::new(EngineContext::default()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        let capture = self.ctx.capture;
        self.ctx = Arc::new(EngineContext { metrics, capture });
        self
    }

    pub fn with_capture_options(mut self, capture: CaptureOptions) -> Self {
        let metrics = Arc::clone(&self.ctx.metrics);
        self.ctx = Arc::new(EngineContext { metrics, capture });
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creates a new instance with fresh sequence counters per controller.
    pub fn register_instance(&self) -> String {
        let instance_id = format!("PI-{}", Uuid::new_v4());
        self.instances.lock().unwrap().insert(instance_id.clone());
        for controller in self.controllers.iter() {
            controller.register_instance(&instance_id);
        }
        info!("Registered instance {} on pipeline '{}'", instance_id, self.name);
        instance_id
    }

    /// Drops the instance. Packages still running complete normally but
    /// are delivered through the exit callback.
    pub fn unregister_instance(&self, instance_id: &str) -> Result<(), PipelineError> {
        let removed = self.instances.lock().unwrap().shift_remove(instance_id);
        if !removed {
            return Err(PipelineError::UnknownInstance(instance_id.to_string()));
        }
        for controller in self.controllers.iter() {
            controller.close_instance(instance_id);
        }
        info!("Unregistered instance {} from pipeline '{}'", instance_id, self.name);
        Ok(())
    }

    /// Submits a payload against a registered instance and returns a
    /// snapshot of the freshly created package; processing continues in
    /// the background and exactly one callback fires when it settles.
    ///
    /// Must be called from within a tokio runtime.
    pub fn execute(
        &self,
        data: T,
        instance_id: &str,
        on_success: impl Fn(Package<T>) + Send + Sync + 'static,
        on_exit: impl Fn(Package<T>) + Send + Sync + 'static,
        on_error: impl Fn(Package<T>) + Send + Sync + 'static,
    ) -> Package<T> {
        let on_success: Callback<T> = Arc::new(on_success);
        let on_exit: Callback<T> = Arc::new(on_exit);
        let on_error: Callback<T> = Arc::new(on_error);

        let mut pkg = Package::new(self.id.clone(), instance_id, data);
        pkg.running = true;
        pkg.start_time = Some(Utc::now());

        if !self.instances.lock().unwrap().contains(instance_id) {
            warn!(
                "Submission against unknown instance {} on pipeline '{}'",
                instance_id, self.name
            );
            pkg.record_error(TraceError::new(
                "UnknownInstanceError",
                format!("unknown pipeline instance: {}", instance_id),
            ));
            finalize_package(&mut pkg);
            on_error(pkg.clone());
            return pkg;
        }

        if self.controllers.is_empty() {
            finalize_package(&mut pkg);
            on_success(pkg.clone());
            return pkg;
        }

        let snapshot = pkg.clone();
        let controllers = Arc::clone(&self.controllers);
        let ctx = Arc::clone(&self.ctx);
        let instance_id = instance_id.to_string();
        debug!("Submitting package {} on instance {}", pkg.id(), instance_id);

        let exit_now = Arc::clone(&on_exit);
        let deliver = route_delivery(
            Arc::clone(&controllers),
            0,
            instance_id.clone(),
            ctx.clone(),
            on_success,
            on_exit,
            on_error,
        );
        // Sequence assignment happens here, in submission order; only the
        // execution is handed off.
        match Arc::clone(&controllers[0]).prepare(pkg, &instance_id, ctx) {
            Ok(prepared) => {
                tokio::spawn(async move { prepared.launch(deliver).await });
            }
            Err(mut pkg) => {
                finalize_package(&mut pkg);
                exit_now(pkg);
            }
        }
        snapshot
    }
}

/// Continuation for the delivery of controller `index`: forwards a
/// successful package to the next controller or fires the matching user
/// callback, exactly once per submission.
fn route_delivery<T: Clone + Send + 'static>(
    controllers: Arc<Vec<Arc<PipelineController<T>>>>,
    index: usize,
    instance_id: String,
    ctx: Arc<EngineContext>,
    on_success: Callback<T>,
    on_exit: Callback<T>,
    on_error: Callback<T>,
) -> DeliveryFn<T> {
    Box::new(move |delivery| {
        async move {
            match delivery {
                Delivery::Completed(pkg) if pkg.success => {
                    let next = index + 1;
                    if next < controllers.len() {
                        let deliver = route_delivery(
                            Arc::clone(&controllers),
                            next,
                            instance_id.clone(),
                            Arc::clone(&ctx),
                            on_success,
                            on_exit,
                            on_error,
                        );
                        let controller = Arc::clone(&controllers[next]);
                        controller.submit(pkg, &instance_id, ctx, deliver).await;
                    } else {
                        let mut pkg = pkg;
                        finalize_package(&mut pkg);
                        debug!("Package {} completed successfully", pkg.id());
                        on_success(pkg);
                    }
                }
                Delivery::Completed(mut pkg) => {
                    finalize_package(&mut pkg);
                    debug!("Package {} failed, skipping remaining controllers", pkg.id());
                    on_error(pkg);
                }
                Delivery::Dropped(mut pkg) => {
                    finalize_package(&mut pkg);
                    debug!("Package {} dropped", pkg.id());
                    on_exit(pkg);
                }
            }
        }
        .boxed()
    })
}

fn finalize_package<T>(pkg: &mut Package<T>) {
    pkg.running = false;
    pkg.end_time = Some(Utc::now());
    pkg.total_time = pkg.total_waiting_time + pkg.total_processing_time;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerMode;
    use crate::demo::{JitteredUppercase, MarkStatus, Record, UppercaseKey, ValidateRecord};
    use crate::phase::PipelinePhase;
    use crate::step::{Step, StepOptions};
    use std::time::Duration;
    use tokio::sync::mpsc;

    enum Outcome {
        Success(Package<Record>),
        Exit(Package<Record>),
        Error(Package<Record>),
    }

    fn callbacks(
        tx: mpsc::UnboundedSender<Outcome>,
    ) -> (
        impl Fn(Package<Record>) + Send + Sync + 'static,
        impl Fn(Package<Record>) + Send + Sync + 'static,
        impl Fn(Package<Record>) + Send + Sync + 'static,
    ) {
        let success_tx = tx.clone();
        let exit_tx = tx.clone();
        let error_tx = tx;
        (
            move |pkg| {
                let _ = success_tx.send(Outcome::Success(pkg));
            },
            move |pkg| {
                let _ = exit_tx.send(Outcome::Exit(pkg));
            },
            move |pkg| {
                let _ = error_tx.send(Outcome::Error(pkg));
            },
        )
    }

    async fn next_outcome(rx: &mut mpsc::UnboundedReceiver<Outcome>) -> Outcome {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("callback timed out")
            .expect("callback channel closed")
    }

    fn linear_pipeline() -> Pipeline<Record> {
        Pipeline::new(
            "linear",
            vec![
                PipelineController::new(
                    "validate",
                    ControllerMode::NotParallel,
                    2,
                    vec![PipelinePhase::new(vec![Step::execution(ValidateRecord)])],
                ),
                PipelineController::new(
                    "transform",
                    ControllerMode::NotParallel,
                    2,
                    vec![PipelinePhase::new(vec![Step::execution(UppercaseKey)])],
                ),
            ],
        )
    }

    fn step_traces(pkg: &Package<Record>) -> Vec<&crate::trace::StepTrace> {
        pkg.controllers
            .iter()
            .flat_map(|c| c.phases.iter())
            .flat_map(|p| p.steps.iter())
            .collect()
    }

    #[tokio::test]
    async fn test_linear_happy_path() {
        let pipeline = linear_pipeline();
        let instance = pipeline.register_instance();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (on_success, on_exit, on_error) = callbacks(tx);

        let submitted =
            pipeline.execute(Record::with_key("abc"), &instance, on_success, on_exit, on_error);
        assert!(submitted.running);

        match next_outcome(&mut rx).await {
            Outcome::Success(pkg) => {
                assert_eq!(pkg.data.key, "ABC");
                assert!(pkg.success);
                assert!(!pkg.running);
                assert!(pkg.errors.is_empty());
                let traces = step_traces(&pkg);
                assert_eq!(traces.len(), 2);
                assert!(traces.iter().all(|t| t.success));
                assert_eq!(
                    pkg.total_time,
                    pkg.total_waiting_time + pkg.total_processing_time
                );
            }
            _ => panic!("expected success"),
        }
    }

    #[tokio::test]
    async fn test_validation_failure_skips_later_controllers() {
        let pipeline = linear_pipeline();
        let instance = pipeline.register_instance();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (on_success, on_exit, on_error) = callbacks(tx);

        pipeline.execute(Record::with_key(""), &instance, on_success, on_exit, on_error);

        match next_outcome(&mut rx).await {
            Outcome::Error(pkg) => {
                assert!(!pkg.success);
                assert!(pkg.errors[0].message.contains("key missing"));
                let traces = step_traces(&pkg);
                assert_eq!(traces.len(), 1);
                assert!(!traces[0].success);
                // The second controller never ran.
                assert_eq!(pkg.controllers.len(), 1);
                assert_eq!(pkg.data.key, "");
            }
            _ => panic!("expected error"),
        }
    }

    #[tokio::test]
    async fn test_ordered_delivery_under_random_sleeps() {
        let pipeline = Pipeline::new(
            "ordered",
            vec![PipelineController::new(
                "transform",
                ControllerMode::OrderBySequence,
                4,
                vec![PipelinePhase::new(vec![Step::execution(
                    JitteredUppercase::new(5, 60),
                )
                .with_options(StepOptions {
                    use_mutex: false,
                    timeout: Duration::ZERO,
                })])],
            )],
        );
        let instance = pipeline.register_instance();
        let (tx, mut rx) = mpsc::unbounded_channel();

        for i in 0..10 {
            let (on_success, on_exit, on_error) = callbacks(tx.clone());
            pipeline.execute(
                Record::with_key(format!("v{}", i)),
                &instance,
                on_success,
                on_exit,
                on_error,
            );
        }

        for i in 0..10 {
            match next_outcome(&mut rx).await {
                Outcome::Success(pkg) => {
                    assert_eq!(pkg.data.key, format!("V{}", i));
                    assert_eq!(pkg.controllers[0].sequence_number, i);
                }
                _ => panic!("expected success"),
            }
        }
    }

    #[tokio::test]
    async fn test_first_wins_accounts_for_every_submission() {
        let pipeline = Pipeline::new(
            "racer",
            vec![PipelineController::new(
                "race",
                ControllerMode::FirstWins,
                4,
                vec![PipelinePhase::new(vec![Step::execution(
                    JitteredUppercase::new(5, 60),
                )
                .with_options(StepOptions {
                    use_mutex: false,
                    timeout: Duration::ZERO,
                })])],
            )],
        );
        let instance = pipeline.register_instance();
        let (tx, mut rx) = mpsc::unbounded_channel();
        for i in 0..10 {
            let (on_success, on_exit, on_error) = callbacks(tx.clone());
            pipeline.execute(
                Record::with_key(format!("v{}", i)),
                &instance,
                on_success,
                on_exit,
                on_error,
            );
        }

        let mut delivered = Vec::new();
        let mut exits = 0;
        for _ in 0..10 {
            match next_outcome(&mut rx).await {
                Outcome::Success(pkg) => delivered.push(pkg.controllers[0].sequence_number),
                Outcome::Exit(_) => exits += 1,
                Outcome::Error(_) => panic!("unexpected error"),
            }
        }
        assert_eq!(delivered.len() + exits, 10);
        for pair in delivered.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[tokio::test]
    async fn test_timeout_routes_to_error_and_engine_stays_usable() {
        let slow = Step::execution(JitteredUppercase::new(500, 1_000)).with_options(StepOptions {
            use_mutex: false,
            timeout: Duration::from_millis(50),
        });
        let pipeline = Pipeline::new(
            "timeouts",
            vec![PipelineController::new(
                "slow",
                ControllerMode::NoOrder,
                2,
                vec![PipelinePhase::new(vec![slow, Step::execution(UppercaseKey)])],
            )],
        );
        let instance = pipeline.register_instance();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (on_success, on_exit, on_error) = callbacks(tx.clone());
        pipeline.execute(Record::with_key("abc"), &instance, on_success, on_exit, on_error);

        match next_outcome(&mut rx).await {
            Outcome::Error(pkg) => {
                assert_eq!(pkg.errors[0].kind, "TimeoutError");
                // The step after the timed-out one never ran.
                assert_eq!(pkg.data.key, "abc");
            }
            _ => panic!("expected error"),
        }

        // The engine keeps serving the same instance afterwards.
        let fast = Pipeline::new(
            "fast",
            vec![PipelineController::new(
                "upper",
                ControllerMode::NoOrder,
                2,
                vec![PipelinePhase::new(vec![Step::execution(UppercaseKey)])],
            )],
        );
        let fast_instance = fast.register_instance();
        let (on_success, on_exit, on_error) = callbacks(tx);
        fast.execute(Record::with_key("xyz"), &fast_instance, on_success, on_exit, on_error);
        match next_outcome(&mut rx).await {
            Outcome::Success(pkg) => assert_eq!(pkg.data.key, "XYZ"),
            _ => panic!("expected success"),
        }
    }

    #[tokio::test]
    async fn test_unknown_instance_routes_to_error() {
        let pipeline = linear_pipeline();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (on_success, on_exit, on_error) = callbacks(tx);

        let pkg = pipeline.execute(
            Record::with_key("abc"),
            "PI-bogus",
            on_success,
            on_exit,
            on_error,
        );
        assert!(!pkg.success);
        match next_outcome(&mut rx).await {
            Outcome::Error(pkg) => {
                assert_eq!(pkg.errors[0].kind, "UnknownInstanceError");
            }
            _ => panic!("expected error"),
        }
    }

    #[tokio::test]
    async fn test_unregister_routes_in_flight_to_exit() {
        let pipeline = Pipeline::new(
            "draining",
            vec![PipelineController::new(
                "slow",
                ControllerMode::NoOrder,
                2,
                vec![PipelinePhase::new(vec![Step::execution(
                    JitteredUppercase::new(200, 300),
                )])],
            )],
        );
        let instance = pipeline.register_instance();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (on_success, on_exit, on_error) = callbacks(tx);
        pipeline.execute(Record::with_key("abc"), &instance, on_success, on_exit, on_error);
        tokio::time::sleep(Duration::from_millis(50)).await;
        pipeline.unregister_instance(&instance).unwrap();

        match next_outcome(&mut rx).await {
            Outcome::Exit(pkg) => assert!(!pkg.running),
            _ => panic!("expected exit"),
        }
        assert!(matches!(
            pipeline.unregister_instance(&instance),
            Err(PipelineError::UnknownInstance(_))
        ));
    }

    #[tokio::test]
    async fn test_condition_branch_sets_status() {
        let branching = Step::condition(
            |pkg: &Package<Record>| pkg.data.condition,
            Step::execution(MarkStatus::success()),
            Step::execution(MarkStatus::failure()),
        );
        let pipeline = Pipeline::new(
            "branching",
            vec![PipelineController::new(
                "decide",
                ControllerMode::NotParallel,
                2,
                vec![PipelinePhase::new(vec![branching])],
            )],
        );
        let instance = pipeline.register_instance();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut record = Record::with_key("abc");
        record.condition = true;
        let (on_success, on_exit, on_error) = callbacks(tx.clone());
        pipeline.execute(record, &instance, on_success, on_exit, on_error);
        match next_outcome(&mut rx).await {
            Outcome::Success(pkg) => assert_eq!(pkg.data.status, "success"),
            _ => panic!("expected success"),
        }

        let (on_success, on_exit, on_error) = callbacks(tx);
        pipeline.execute(Record::with_key("abc"), &instance, on_success, on_exit, on_error);
        match next_outcome(&mut rx).await {
            Outcome::Success(pkg) => assert_eq!(pkg.data.status, "failure"),
            _ => panic!("expected success"),
        }
    }
}
