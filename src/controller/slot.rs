use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use futures::future::BoxFuture;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::trace::Package;

/// Outcome of one controller pass, handed to the delivery continuation.
#[derive(Debug)]
pub enum Delivery<T> {
    /// Phases ran to completion; `package.success` carries the verdict.
    Completed(Package<T>),
    /// The package was deliberately dropped: a first-wins loser or a
    /// package whose instance was unregistered mid-flight.
    Dropped(Package<T>),
}

/// Continuation invoked from the delivering worker task. The pipeline
/// chains controllers through these; the last one fires a user callback.
pub(crate) type DeliveryFn<T> = Box<dyn FnOnce(Delivery<T>) -> BoxFuture<'static, ()> + Send>;

pub(crate) struct Pending<T> {
    pub package: Package<T>,
    pub deliver: DeliveryFn<T>,
}

/// Per-(controller, instance) scheduling state.
pub(crate) struct InstanceSlot<T> {
    pub state: Mutex<SlotState<T>>,
    /// Turn signal for NOT_PARALLEL serialization.
    pub turn: Notify,
}

pub(crate) struct SlotState<T> {
    pub closed: bool,
    pub next_sequence: u64,
    /// Next sequence to run (NOT_PARALLEL) or to deliver (ORDER_BY_SEQUENCE).
    pub next_expected: u64,
    pub buffered: BTreeMap<u64, Pending<T>>,
    pub highest_delivered: Option<u64>,
    /// FIRST_WINS work still waiting for a pool permit, cancellable by seq.
    pub queued: HashMap<u64, CancellationToken>,
    /// Deliveries are funneled through one queue so continuations run
    /// strictly in enqueue order, whichever worker enqueued them.
    pub delivering: bool,
    pub delivery_queue: VecDeque<(Delivery<T>, DeliveryFn<T>)>,
}

impl<T> InstanceSlot<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                closed: false,
                next_sequence: 0,
                next_expected: 0,
                buffered: BTreeMap::new(),
                highest_delivered: None,
                queued: HashMap::new(),
                delivering: false,
                delivery_queue: VecDeque::new(),
            }),
            turn: Notify::new(),
        }
    }

    /// Runs queued continuations until the queue is empty. Exactly one
    /// task drains at a time; enqueue order equals invocation order.
    pub async fn drain(&self) {
        loop {
            let (delivery, deliver) = {
                let mut state = self.state.lock().unwrap();
                match state.delivery_queue.pop_front() {
                    Some(item) => item,
                    None => {
                        state.delivering = false;
                        return;
                    }
                }
            };
            deliver(delivery).await;
        }
    }
}

impl<T> SlotState<T> {
    /// Claims the drain duty when nobody else holds it and there is work.
    pub fn claim_drain(&mut self) -> bool {
        if !self.delivering && !self.delivery_queue.is_empty() {
            self.delivering = true;
            true
        } else {
            false
        }
    }
}
