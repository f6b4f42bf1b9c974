use std::sync::{Arc, RwLock};
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::metrics::EngineContext;
use crate::step::Step;
use crate::trace::{Package, PhaseTrace, TracePath};

/// Ordered list of steps executed as a unit. Phases own no concurrency;
/// their controller does.
///
/// The step list may be swapped at runtime; packages that already entered
/// the phase keep the snapshot they started with.
pub struct PipelinePhase<T> {
    id: String,
    name: String,
    steps: RwLock<Vec<Arc<Step<T>>>>,
}

impl<T: Send + 'static> PipelinePhase<T> {
    pub fn new(steps: Vec<Step<T>>) -> Self {
        let id = format!("P-{}", Uuid::new_v4());
        Self {
            name: id.clone(),
            id,
            steps: RwLock::new(steps.into_iter().map(Arc::new).collect()),
        }
    }

    pub fn named(name: impl Into<String>, steps: Vec<Step<T>>) -> Self {
        let mut phase = Self::new(steps);
        phase.name = name.into();
        phase
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn step_count(&self) -> usize {
        self.steps.read().unwrap().len()
    }

    /// Replaces the step list; applies to packages entering afterwards.
    pub fn set_steps(&self, steps: Vec<Step<T>>) {
        *self.steps.write().unwrap() = steps.into_iter().map(Arc::new).collect();
    }

    #[instrument(skip(self, pkg, ctx), fields(phase = %self.name))]
    pub(crate) async fn run(
        &self,
        pkg: &mut Package<T>,
        controller_idx: usize,
        ctx: &EngineContext,
    ) {
        let steps: Vec<Arc<Step<T>>> = self.steps.read().unwrap().clone();
        debug!("Starting phase '{}' with {} steps", self.name, steps.len());

        let phases = &mut pkg.controllers[controller_idx].phases;
        phases.push(PhaseTrace::new(self.id.clone()));
        let phase_idx = phases.len() - 1;
        {
            let trace = &mut phases[phase_idx];
            trace.running = true;
            trace.start_time = Some(Utc::now());
        }

        let clock = Instant::now();
        for step in &steps {
            debug!("Executing step '{}' in phase '{}'", step.name(), self.name);
            step.run(pkg, TracePath::new(controller_idx, phase_idx), ctx)
                .await;
            if !pkg.success {
                debug!(
                    "Phase '{}' stopping after failed step '{}'",
                    self.name,
                    step.name()
                );
                break;
            }
        }

        let trace = &mut pkg.controllers[controller_idx].phases[phase_idx];
        trace.running = false;
        trace.end_time = Some(Utc::now());
        trace.processing_time = clock.elapsed();
        debug!(
            "Completed phase '{}' in {}us",
            self.name,
            trace.processing_time.as_micros()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerMode;
    use crate::error::PipelineError;
    use crate::step::ExecutionStep;
    use crate::trace::{ControllerTrace, StepTrace};
    use async_trait::async_trait;

    struct Append(&'static str);

    #[async_trait]
    impl ExecutionStep<String> for Append {
        async fn execute(
            &self,
            data: &mut String,
            _trace: &mut StepTrace,
        ) -> Result<(), PipelineError> {
            data.push_str(self.0);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Append"
        }
    }

    fn package_with_controller() -> Package<String> {
        let mut pkg = Package::new("PL-test", "PI-test", String::new());
        pkg.controllers
            .push(ControllerTrace::new("C-test", ControllerMode::NoOrder, 0, 0));
        pkg
    }

    #[tokio::test]
    async fn test_phase_runs_steps_in_order() {
        let phase = PipelinePhase::named(
            "build",
            vec![Step::execution(Append("a")), Step::execution(Append("b"))],
        );
        let mut pkg = package_with_controller();
        phase.run(&mut pkg, 0, &EngineContext::default()).await;

        assert_eq!(pkg.data, "ab");
        let trace = &pkg.controllers[0].phases[0];
        assert_eq!(trace.id, phase.id());
        assert_eq!(trace.steps.len(), 2);
        assert!(!trace.running);
        assert!(trace.end_time.is_some());
    }

    #[tokio::test]
    async fn test_step_swap_applies_to_next_run() {
        let phase = PipelinePhase::new(vec![Step::execution(Append("a"))]);
        let mut pkg = package_with_controller();
        phase.run(&mut pkg, 0, &EngineContext::default()).await;

        phase.set_steps(vec![Step::execution(Append("z")), Step::execution(Append("z"))]);
        phase.run(&mut pkg, 0, &EngineContext::default()).await;

        assert_eq!(pkg.data, "azz");
        assert_eq!(pkg.controllers[0].phases.len(), 2);
        assert_eq!(pkg.controllers[0].phases[1].steps.len(), 2);
    }
}
