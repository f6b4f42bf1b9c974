use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::controller::ControllerMode;
use crate::error::PipelineError;
use crate::remote::PayloadCodec;
use crate::trace::TraceError;

/// Write-once cell guarding fields that must never change after they are
/// first assigned. A second assignment fails with a dedicated error kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Immutable<V>(Option<V>);

impl<V> Immutable<V> {
    pub fn new(value: V) -> Self {
        Self(Some(value))
    }

    pub fn unset() -> Self {
        Self(None)
    }

    pub fn get(&self) -> Option<&V> {
        self.0.as_ref()
    }

    pub fn try_set(&mut self, field: &'static str, value: V) -> Result<(), PipelineError> {
        if self.0.is_some() {
            return Err(PipelineError::ImmutableField(field));
        }
        self.0 = Some(value);
        Ok(())
    }
}

/// Per-step record: one node per `run` invocation, nested for composites.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepTrace {
    pub id: String,
    pub running: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub waiting_time: Duration,
    pub processing_time: Duration,
    pub total_time: Duration,
    pub message: String,
    pub success: bool,
    pub error: Option<TraceError>,
    pub children: Vec<StepTrace>,
}

impl StepTrace {
    pub fn new(step_id: impl Into<String>) -> Self {
        Self {
            id: step_id.into(),
            running: false,
            start_time: None,
            end_time: None,
            waiting_time: Duration::ZERO,
            processing_time: Duration::ZERO,
            total_time: Duration::ZERO,
            message: String::new(),
            success: true,
            error: None,
            children: Vec::new(),
        }
    }

    /// Updates this node from a peer copy, matching children by id.
    pub fn merge_from(&mut self, other: StepTrace) {
        let StepTrace {
            id: _,
            running,
            start_time,
            end_time,
            waiting_time,
            processing_time,
            total_time,
            message,
            success,
            error,
            children,
        } = other;
        self.running = running;
        self.start_time = start_time;
        self.end_time = end_time;
        self.waiting_time = waiting_time;
        self.processing_time = processing_time;
        self.total_time = total_time;
        self.message = message;
        self.success = success;
        self.error = error;
        merge_step_lists(&mut self.children, children);
    }
}

fn merge_step_lists(local: &mut Vec<StepTrace>, incoming: Vec<StepTrace>) {
    for step in incoming {
        match local.iter_mut().find(|s| s.id == step.id) {
            Some(existing) => existing.merge_from(step),
            None => local.push(step),
        }
    }
}

/// Per-phase record: the ordered step traces produced by one phase pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseTrace {
    pub id: String,
    pub running: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub processing_time: Duration,
    pub steps: Vec<StepTrace>,
}

impl PhaseTrace {
    pub fn new(phase_id: impl Into<String>) -> Self {
        Self {
            id: phase_id.into(),
            running: false,
            start_time: None,
            end_time: None,
            processing_time: Duration::ZERO,
            steps: Vec::new(),
        }
    }

    pub fn merge_from(&mut self, other: PhaseTrace) {
        self.running = other.running;
        self.start_time = other.start_time;
        self.end_time = other.end_time;
        self.processing_time = other.processing_time;
        merge_step_lists(&mut self.steps, other.steps);
    }
}

/// Per-controller record: one entry per controller a package passes through.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControllerTrace {
    pub id: String,
    pub mode: ControllerMode,
    pub workers: usize,
    pub sequence_number: u64,
    pub running: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub waiting_time: Duration,
    pub processing_time: Duration,
    pub total_time: Duration,
    pub phases: Vec<PhaseTrace>,
}

impl ControllerTrace {
    pub fn new(
        controller_id: impl Into<String>,
        mode: ControllerMode,
        workers: usize,
        sequence_number: u64,
    ) -> Self {
        Self {
            id: controller_id.into(),
            mode,
            workers,
            sequence_number,
            running: false,
            start_time: None,
            end_time: None,
            waiting_time: Duration::ZERO,
            processing_time: Duration::ZERO,
            total_time: Duration::ZERO,
            phases: Vec::new(),
        }
    }

    pub fn merge_from(&mut self, other: ControllerTrace) {
        self.mode = other.mode;
        self.workers = other.workers;
        self.sequence_number = other.sequence_number;
        self.running = other.running;
        self.start_time = other.start_time;
        self.end_time = other.end_time;
        self.waiting_time = other.waiting_time;
        self.processing_time = other.processing_time;
        self.total_time = other.total_time;
        for phase in other.phases {
            match self.phases.iter_mut().find(|p| p.id == phase.id) {
                Some(existing) => existing.merge_from(phase),
                None => self.phases.push(phase),
            }
        }
    }
}

/// Index path to a step-trace container inside a package's trace tree.
///
/// `steps` descends through nested children; an empty list addresses the
/// phase-level step list itself.
#[derive(Debug, Clone)]
pub(crate) struct TracePath {
    pub controller: usize,
    pub phase: usize,
    pub steps: Vec<usize>,
}

impl TracePath {
    pub fn new(controller: usize, phase: usize) -> Self {
        Self {
            controller,
            phase,
            steps: Vec::new(),
        }
    }

    pub fn child(&self, idx: usize) -> Self {
        let mut path = self.clone();
        path.steps.push(idx);
        path
    }
}

/// One submission's live record: the payload plus the hierarchical trace of
/// everything that happened to it on its way through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Package<T> {
    id: Immutable<String>,
    pipeline_id: Immutable<String>,
    pub instance_id: String,
    pub data: T,
    pub running: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_waiting_time: Duration,
    pub total_processing_time: Duration,
    pub total_time: Duration,
    pub success: bool,
    pub controllers: Vec<ControllerTrace>,
    pub errors: Vec<TraceError>,
}

impl<T> Package<T> {
    pub fn new(
        pipeline_id: impl Into<String>,
        instance_id: impl Into<String>,
        data: T,
    ) -> Self {
        Self {
            id: Immutable::new(format!("DP-{}", Uuid::new_v4())),
            pipeline_id: Immutable::new(pipeline_id.into()),
            instance_id: instance_id.into(),
            data,
            running: false,
            start_time: None,
            end_time: None,
            total_waiting_time: Duration::ZERO,
            total_processing_time: Duration::ZERO,
            total_time: Duration::ZERO,
            success: true,
            controllers: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        self.id.get().map(String::as_str).unwrap_or_default()
    }

    pub fn pipeline_id(&self) -> &str {
        self.pipeline_id.get().map(String::as_str).unwrap_or_default()
    }

    /// Fails with [`PipelineError::ImmutableField`] once the id is set,
    /// which it always is after construction.
    pub fn try_set_id(&mut self, id: impl Into<String>) -> Result<(), PipelineError> {
        self.id.try_set("id", id.into())
    }

    pub fn try_set_pipeline_id(&mut self, id: impl Into<String>) -> Result<(), PipelineError> {
        self.pipeline_id.try_set("pipeline_id", id.into())
    }

    /// Records an error and flips the package into the failed state.
    pub fn record_error(&mut self, error: TraceError) {
        self.errors.push(error);
        self.success = false;
    }

    pub(crate) fn container(&self, path: &TracePath) -> &Vec<StepTrace> {
        let mut steps = &self.controllers[path.controller].phases[path.phase].steps;
        for idx in &path.steps {
            steps = &steps[*idx].children;
        }
        steps
    }

    pub(crate) fn container_mut(&mut self, path: &TracePath) -> &mut Vec<StepTrace> {
        let mut steps = &mut self.controllers[path.controller].phases[path.phase].steps;
        for idx in &path.steps {
            steps = &mut steps[*idx].children;
        }
        steps
    }

    /// Splits the package into the payload and one step trace, so a step
    /// body can mutate both without aliasing the rest of the tree.
    pub(crate) fn data_and_trace(
        &mut self,
        path: &TracePath,
        idx: usize,
    ) -> (&mut T, &mut StepTrace) {
        let Package {
            data, controllers, ..
        } = self;
        let mut steps = &mut controllers[path.controller].phases[path.phase].steps;
        for child in &path.steps {
            steps = &mut steps[*child].children;
        }
        (data, &mut steps[idx])
    }

    /// Locates the container holding the children of the step trace with
    /// the given id, anywhere in the tree.
    pub(crate) fn find_step_container(&self, step_id: &str) -> Option<TracePath> {
        for (c_idx, controller) in self.controllers.iter().enumerate() {
            for (p_idx, phase) in controller.phases.iter().enumerate() {
                let mut acc = Vec::new();
                if search_steps(&phase.steps, step_id, &mut acc) {
                    return Some(TracePath {
                        controller: c_idx,
                        phase: p_idx,
                        steps: acc,
                    });
                }
            }
        }
        None
    }

    /// Encodes the payload through `codec` and clones the trace tree into
    /// a wire-shaped package carrying opaque bytes.
    pub fn to_wire(&self, codec: &dyn PayloadCodec<T>) -> Result<Package<Vec<u8>>, PipelineError> {
        Ok(Package {
            id: self.id.clone(),
            pipeline_id: self.pipeline_id.clone(),
            instance_id: self.instance_id.clone(),
            data: codec.encode(&self.data)?,
            running: self.running,
            start_time: self.start_time,
            end_time: self.end_time,
            total_waiting_time: self.total_waiting_time,
            total_processing_time: self.total_processing_time,
            total_time: self.total_time,
            success: self.success,
            controllers: self.controllers.clone(),
            errors: self.errors.clone(),
        })
    }

    /// Reconstructs a typed package from a wire-shaped one.
    pub fn from_wire(
        wire: Package<Vec<u8>>,
        codec: &dyn PayloadCodec<T>,
    ) -> Result<Package<T>, PipelineError> {
        Ok(Package {
            data: codec.decode(&wire.data)?,
            id: wire.id,
            pipeline_id: wire.pipeline_id,
            instance_id: wire.instance_id,
            running: wire.running,
            start_time: wire.start_time,
            end_time: wire.end_time,
            total_waiting_time: wire.total_waiting_time,
            total_processing_time: wire.total_processing_time,
            total_time: wire.total_time,
            success: wire.success,
            controllers: wire.controllers,
            errors: wire.errors,
        })
    }

    /// Merges a peer's copy back into this package: scalars are taken from
    /// the peer, nested trace and error lists are matched by id, and the
    /// local immutable attributes are preserved.
    pub fn merge_wire(
        &mut self,
        wire: Package<Vec<u8>>,
        codec: &dyn PayloadCodec<T>,
    ) -> Result<(), PipelineError> {
        self.data = codec.decode(&wire.data)?;
        self.instance_id = wire.instance_id;
        self.running = wire.running;
        self.start_time = wire.start_time;
        self.end_time = wire.end_time;
        self.total_waiting_time = wire.total_waiting_time;
        self.total_processing_time = wire.total_processing_time;
        self.total_time = wire.total_time;
        self.success = wire.success;
        for controller in wire.controllers {
            match self.controllers.iter_mut().find(|c| c.id == controller.id) {
                Some(existing) => existing.merge_from(controller),
                None => self.controllers.push(controller),
            }
        }
        for error in wire.errors {
            match self.errors.iter_mut().find(|e| e.id == error.id) {
                Some(existing) => *existing = error,
                None => self.errors.push(error),
            }
        }
        Ok(())
    }
}

fn search_steps(steps: &[StepTrace], id: &str, acc: &mut Vec<usize>) -> bool {
    for (idx, step) in steps.iter().enumerate() {
        if step.id == id {
            acc.push(idx);
            return true;
        }
        acc.push(idx);
        if search_steps(&step.children, id, acc) {
            return true;
        }
        acc.pop();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::JsonCodec;

    fn sample_package() -> Package<String> {
        let mut pkg = Package::new("PL-test", "PI-test", "payload".to_string());
        let mut controller =
            ControllerTrace::new("C-1", ControllerMode::OrderBySequence, 4, 0);
        let mut phase = PhaseTrace::new("P-1");
        let mut outer = StepTrace::new("M-combination-1");
        outer.children.push(StepTrace::new("M-execution-2"));
        phase.steps.push(outer);
        phase.steps.push(StepTrace::new("M-execution-3"));
        controller.phases.push(phase);
        pkg.controllers.push(controller);
        pkg
    }

    #[test]
    fn test_immutable_fields_reject_reassignment() {
        let mut pkg = Package::new("PL-test", "PI-test", ());
        let err = pkg.try_set_id("DP-other").unwrap_err();
        assert!(matches!(err, PipelineError::ImmutableField("id")));
        let err = pkg.try_set_pipeline_id("PL-other").unwrap_err();
        assert!(matches!(err, PipelineError::ImmutableField("pipeline_id")));
    }

    #[test]
    fn test_record_error_marks_package_failed() {
        let mut pkg = Package::new("PL-test", "PI-test", ());
        assert!(pkg.success);
        pkg.record_error(TraceError::new("StepError", "boom"));
        assert!(!pkg.success);
        assert_eq!(pkg.errors.len(), 1);
    }

    #[test]
    fn test_find_step_container_descends_into_children() {
        let pkg = sample_package();
        let path = pkg.find_step_container("M-execution-2").unwrap();
        assert_eq!(path.controller, 0);
        assert_eq!(path.phase, 0);
        assert_eq!(path.steps, vec![0, 0]);
        assert!(pkg.container(&path).is_empty());

        let path = pkg.find_step_container("M-combination-1").unwrap();
        assert_eq!(path.steps, vec![0]);
        assert_eq!(pkg.container(&path).len(), 1);

        assert!(pkg.find_step_container("M-missing").is_none());
    }

    #[test]
    fn test_wire_round_trip_preserves_tree() {
        let mut pkg = sample_package();
        pkg.record_error(TraceError::new("StepError", "boom").with_context("M-execution-3"));
        let codec = JsonCodec;
        let wire = pkg.to_wire(&codec).unwrap();
        let encoded = serde_json::to_vec(&wire).unwrap();
        let decoded: Package<Vec<u8>> = serde_json::from_slice(&encoded).unwrap();
        let restored = Package::<String>::from_wire(decoded, &codec).unwrap();
        assert_eq!(pkg, restored);
    }

    #[test]
    fn test_merge_updates_in_place_and_appends_new() {
        let mut local = sample_package();
        let codec = JsonCodec;

        let mut peer = local.clone();
        peer.data = "transformed".to_string();
        peer.controllers[0].phases[0].steps[0].children[0].message =
            "done on peer".to_string();
        peer.controllers[0].phases[0].steps[0]
            .children
            .push(StepTrace::new("M-execution-new"));
        peer.record_error(TraceError::new("ValueError", "peer error"));

        let wire = peer.to_wire(&codec).unwrap();
        local.merge_wire(wire, &codec).unwrap();

        assert_eq!(local.data, "transformed");
        let outer = &local.controllers[0].phases[0].steps[0];
        assert_eq!(outer.children.len(), 2);
        assert_eq!(outer.children[0].message, "done on peer");
        assert_eq!(outer.children[1].id, "M-execution-new");
        assert_eq!(local.errors.len(), 1);
        assert!(!local.success);
    }

    #[test]
    fn test_merge_preserves_local_immutable_attributes() {
        let mut local = sample_package();
        let local_id = local.id().to_string();
        let codec = JsonCodec;

        // A peer copy with different identity fields must not overwrite ours.
        let mut peer = Package::new("PL-peer", "PI-test", "data".to_string());
        peer.controllers = local.controllers.clone();
        let wire = peer.to_wire(&codec).unwrap();
        local.merge_wire(wire, &codec).unwrap();

        assert_eq!(local.id(), local_id);
        assert_eq!(local.pipeline_id(), "PL-test");
    }
}
