mod slot;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::metrics::EngineContext;
use crate::phase::PipelinePhase;
use crate::trace::{ControllerTrace, Package};

pub use slot::Delivery;
pub(crate) use slot::DeliveryFn;
use slot::{InstanceSlot, Pending};

/// Scheduling mode governing concurrency and completion ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControllerMode {
    NotParallel,
    OrderBySequence,
    FirstWins,
    NoOrder,
}

impl ControllerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerMode::NotParallel => "NOT_PARALLEL",
            ControllerMode::OrderBySequence => "ORDER_BY_SEQUENCE",
            ControllerMode::FirstWins => "FIRST_WINS",
            ControllerMode::NoOrder => "NO_ORDER",
        }
    }
}

/// Scheduler for one or more phases: assigns sequence numbers, runs
/// packages on a bounded worker pool (or inline when `max_workers == 0`),
/// and enforces the completion ordering of its mode.
pub struct PipelineController<T> {
    id: String,
    name: String,
    mode: ControllerMode,
    max_workers: usize,
    phases: Vec<Arc<PipelinePhase<T>>>,
    pool: Option<Arc<Semaphore>>,
    slots: Mutex<HashMap<String, Arc<InstanceSlot<T>>>>,
}

impl<T: Send + 'static> PipelineController<T> {
    pub fn new(
        name: impl Into<String>,
        mode: ControllerMode,
        max_workers: usize,
        phases: Vec<PipelinePhase<T>>,
    ) -> Self {
        Self {
            id: format!("C-{}", Uuid::new_v4()),
            name: name.into(),
            mode,
            max_workers,
            phases: phases.into_iter().map(Arc::new).collect(),
            pool: (max_workers > 0).then(|| Arc::new(Semaphore::new(max_workers))),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> ControllerMode {
        self.mode
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn phases(&self) -> &[Arc<PipelinePhase<T>>] {
        &self.phases
    }

    pub(crate) fn register_instance(&self, instance_id: &str) {
        self.slots
            .lock()
            .unwrap()
            .insert(instance_id.to_string(), Arc::new(InstanceSlot::new()));
    }

    /// Closes the slot: buffered results drain to the exit route, queued
    /// work is cancelled, and running work is dropped at delivery time.
    pub(crate) fn close_instance(&self, instance_id: &str) {
        let slot = self.slots.lock().unwrap().remove(instance_id);
        let Some(slot) = slot else { return };
        let should_drain = {
            let mut state = slot.state.lock().unwrap();
            state.closed = true;
            for token in state.queued.values() {
                token.cancel();
            }
            let buffered = std::mem::take(&mut state.buffered);
            for (_, pending) in buffered {
                state
                    .delivery_queue
                    .push_back((Delivery::Dropped(pending.package), pending.deliver));
            }
            state.claim_drain()
        };
        slot.turn.notify_waiters();
        if should_drain {
            let slot = Arc::clone(&slot);
            tokio::spawn(async move { slot.drain().await });
        }
    }

    /// Assigns the next sequence number under the instance lock and builds
    /// the job, synchronously, so assignment order always equals submission
    /// order. Fails with the package when the instance is gone.
    pub(crate) fn prepare(
        self: Arc<Self>,
        mut pkg: Package<T>,
        instance_id: &str,
        ctx: Arc<EngineContext>,
    ) -> Result<PreparedSubmission<T>, Package<T>> {
        let slot = self.slots.lock().unwrap().get(instance_id).cloned();
        let Some(slot) = slot else {
            // Instance vanished between controllers.
            return Err(pkg);
        };

        let seq = {
            let mut state = slot.state.lock().unwrap();
            if state.closed {
                return Err(pkg);
            }
            let seq = state.next_sequence;
            state.next_sequence += 1;
            seq
        };
        pkg.controllers.push(ControllerTrace::new(
            self.id.clone(),
            self.mode,
            self.max_workers,
            seq,
        ));
        let controller_idx = pkg.controllers.len() - 1;
        debug!(
            "Controller '{}' assigned sequence {} to package {}",
            self.name,
            seq,
            pkg.id()
        );

        Ok(PreparedSubmission {
            job: Job {
                controller: self,
                slot,
                ctx,
                seq,
                controller_idx,
                submitted: Instant::now(),
            },
            pkg,
        })
    }

    /// Prepares and launches in one go; delivery ordering is governed
    /// solely by the mode.
    pub(crate) async fn submit(
        self: Arc<Self>,
        pkg: Package<T>,
        instance_id: &str,
        ctx: Arc<EngineContext>,
        deliver: DeliveryFn<T>,
    ) {
        match self.prepare(pkg, instance_id, ctx) {
            Ok(prepared) => prepared.launch(deliver).await,
            Err(pkg) => deliver(Delivery::Dropped(pkg)).await,
        }
    }

    async fn execute_phases(
        &self,
        pkg: &mut Package<T>,
        controller_idx: usize,
        waited: Duration,
        ctx: &EngineContext,
    ) {
        {
            let trace = &mut pkg.controllers[controller_idx];
            trace.running = true;
            trace.start_time = Some(Utc::now());
            trace.waiting_time = waited;
        }
        pkg.total_waiting_time += waited;

        let clock = Instant::now();
        for phase in &self.phases {
            phase.run(pkg, controller_idx, ctx).await;
            if !pkg.success {
                debug!(
                    "Controller '{}' aborting remaining phases for failed package {}",
                    self.name,
                    pkg.id()
                );
                break;
            }
        }
        let processing = clock.elapsed();

        let trace = &mut pkg.controllers[controller_idx];
        trace.running = false;
        trace.end_time = Some(Utc::now());
        trace.processing_time = processing;
        trace.total_time = trace.waiting_time + processing;
        pkg.total_processing_time += processing;
    }
}

/// A submission with its sequence number already assigned, ready to run.
pub(crate) struct PreparedSubmission<T> {
    job: Job<T>,
    pkg: Package<T>,
}

impl<T: Send + 'static> PreparedSubmission<T> {
    /// Runs inline when the controller has no pool, otherwise on a worker.
    pub(crate) async fn launch(self, deliver: DeliveryFn<T>) {
        if self.job.controller.max_workers == 0 {
            self.job.run(self.pkg, deliver).await;
        } else {
            tokio::spawn(self.job.run(self.pkg, deliver));
        }
    }
}

/// One package's pass through a controller.
struct Job<T> {
    controller: Arc<PipelineController<T>>,
    slot: Arc<InstanceSlot<T>>,
    ctx: Arc<EngineContext>,
    seq: u64,
    controller_idx: usize,
    submitted: Instant,
}

impl<T: Send + 'static> Job<T> {
    async fn run(self, pkg: Package<T>, deliver: DeliveryFn<T>) {
        match self.controller.mode {
            ControllerMode::NotParallel => self.run_serialized(pkg, deliver).await,
            _ => self.run_pooled(pkg, deliver).await,
        }
    }

    /// NOT_PARALLEL: strict FIFO, at most one package executing per
    /// instance. Tasks take turns by sequence number.
    async fn run_serialized(self, mut pkg: Package<T>, deliver: DeliveryFn<T>) {
        if !self.wait_turn().await {
            self.advance_turn();
            deliver(Delivery::Dropped(pkg)).await;
            return;
        }
        let waited = self.submitted.elapsed();
        self.controller
            .execute_phases(&mut pkg, self.controller_idx, waited, &self.ctx)
            .await;
        self.advance_turn();
        let closed = self.slot.state.lock().unwrap().closed;
        let delivery = if closed {
            Delivery::Dropped(pkg)
        } else {
            Delivery::Completed(pkg)
        };
        self.deliver(delivery, deliver).await;
    }

    async fn run_pooled(self, mut pkg: Package<T>, deliver: DeliveryFn<T>) {
        // FIRST_WINS work is cancellable while it waits for a permit.
        let mut dropped_early = false;
        let token = if self.controller.mode == ControllerMode::FirstWins {
            let mut state = self.slot.state.lock().unwrap();
            if state.closed || matches!(state.highest_delivered, Some(h) if self.seq <= h) {
                dropped_early = true;
                None
            } else {
                let token = CancellationToken::new();
                state.queued.insert(self.seq, token.clone());
                Some(token)
            }
        } else {
            None
        };
        if dropped_early {
            deliver(Delivery::Dropped(pkg)).await;
            return;
        }

        let permit = match &self.controller.pool {
            Some(pool) => {
                let acquire = Arc::clone(pool).acquire_owned();
                if let Some(token) = &token {
                    tokio::select! {
                        _ = token.cancelled() => {
                            self.slot.state.lock().unwrap().queued.remove(&self.seq);
                            debug!(
                                "Controller '{}' cancelled queued sequence {}",
                                self.controller.name, self.seq
                            );
                            deliver(Delivery::Dropped(pkg)).await;
                            return;
                        }
                        permit = acquire => permit.ok(),
                    }
                } else {
                    acquire.await.ok()
                }
            }
            None => None,
        };
        if let Some(token) = &token {
            self.slot.state.lock().unwrap().queued.remove(&self.seq);
            if token.is_cancelled() {
                // Lost the race just before getting a permit.
                deliver(Delivery::Dropped(pkg)).await;
                return;
            }
        }

        let waited = self.submitted.elapsed();
        self.controller
            .execute_phases(&mut pkg, self.controller_idx, waited, &self.ctx)
            .await;
        drop(permit);
        self.deliver(Delivery::Completed(pkg), deliver).await;
    }

    /// Routes one completed pass into the slot's delivery queue according
    /// to the controller mode, then drains the queue if nobody else is.
    async fn deliver(self, delivery: Delivery<T>, deliver: DeliveryFn<T>) {
        let should_drain = {
            let mut state = self.slot.state.lock().unwrap();
            if state.closed {
                let pkg = match delivery {
                    Delivery::Completed(pkg) | Delivery::Dropped(pkg) => pkg,
                };
                state
                    .delivery_queue
                    .push_back((Delivery::Dropped(pkg), deliver));
                state.claim_drain()
            } else {
                match self.controller.mode {
                    ControllerMode::NoOrder | ControllerMode::NotParallel => {
                        state.delivery_queue.push_back((delivery, deliver));
                        state.claim_drain()
                    }
                    ControllerMode::OrderBySequence => {
                        let pkg = match delivery {
                            Delivery::Completed(pkg) | Delivery::Dropped(pkg) => pkg,
                        };
                        if self.seq == state.next_expected {
                            state
                                .delivery_queue
                                .push_back((Delivery::Completed(pkg), deliver));
                            state.next_expected += 1;
                            // Drain everything the gap was holding back.
                            loop {
                                let next = state.next_expected;
                                let Some(pending) = state.buffered.remove(&next) else {
                                    break;
                                };
                                state.delivery_queue.push_back((
                                    Delivery::Completed(pending.package),
                                    pending.deliver,
                                ));
                                state.next_expected += 1;
                            }
                            state.claim_drain()
                        } else {
                            state.buffered.insert(
                                self.seq,
                                Pending {
                                    package: pkg,
                                    deliver,
                                },
                            );
                            false
                        }
                    }
                    ControllerMode::FirstWins => {
                        let pkg = match delivery {
                            Delivery::Completed(pkg) | Delivery::Dropped(pkg) => pkg,
                        };
                        match state.highest_delivered {
                            Some(highest) if self.seq <= highest => {
                                state
                                    .delivery_queue
                                    .push_back((Delivery::Dropped(pkg), deliver));
                            }
                            _ => {
                                state.highest_delivered = Some(self.seq);
                                for (queued_seq, token) in state.queued.iter() {
                                    if *queued_seq <= self.seq {
                                        token.cancel();
                                    }
                                }
                                state
                                    .delivery_queue
                                    .push_back((Delivery::Completed(pkg), deliver));
                            }
                        }
                        state.claim_drain()
                    }
                }
            }
        };
        if should_drain {
            self.slot.drain().await;
        }
    }

    /// Waits until this sequence is the next to run. Returns false when the
    /// instance closed while waiting.
    async fn wait_turn(&self) -> bool {
        loop {
            let notified = self.slot.turn.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.slot.state.lock().unwrap();
                if state.closed {
                    return false;
                }
                if state.next_expected == self.seq {
                    return true;
                }
                if state.next_expected > self.seq {
                    warn!(
                        "Controller '{}' skipped sequence {} (turn already passed)",
                        self.controller.name, self.seq
                    );
                    return false;
                }
            }
            notified.await;
        }
    }

    fn advance_turn(&self) {
        {
            let mut state = self.slot.state.lock().unwrap();
            if state.next_expected <= self.seq {
                state.next_expected = self.seq + 1;
            }
        }
        self.slot.turn.notify_waiters();
    }
}
