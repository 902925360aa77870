// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The typed event bus.
//!
//! Every cross-component step in the engine is an [`Event`]. The payload of
//! each event is part of its variant, so an event type can never be paired
//! with the wrong payload. Events are held in a deadline-ordered heap and
//! dispatched on the kernel task; events with equal deadlines dispatch in
//! post order.

use crate::datastore::RepositoryEntry;
use crate::store::{DataObjectRef, NodeRef};
use haggle_protocol::{Interface, NodeType};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

/// Identifies one registered filter; deliveries for the filter carry its id.
/// Ids are allocated from a reserved range so they never collide with
/// anything else.
pub type FilterEventId = u32;

/// First id handed out by [`crate::KernelHandle::allocate_filter_event`].
pub const FILTER_EVENT_ID_BASE: FilterEventId = 5000;

/// Everything that can happen in the engine.
#[derive(Clone, Debug)]
pub enum Event {
    // System lifecycle.
    PrepareStartup,
    Startup,
    PrepareShutdown,
    /// A manager finished its shutdown preparation.
    ShutdownReady(&'static str),
    Shutdown,

    // Node lifecycle.
    NodeContactNew(NodeRef),
    NodeContactEnd(NodeRef),
    NodeUpdated {
        node: NodeRef,
        replaced: Vec<NodeRef>,
    },
    /// Push this node's description to all current neighbors.
    NodeDescriptionSend,

    // Interface lifecycle.
    LocalInterfaceUp(Interface),
    LocalInterfaceDown(Interface),
    NeighborInterfaceUp(Interface),
    NeighborInterfaceDown(Interface),

    // Data object lifecycle.
    DataObjectIncoming(DataObjectRef),
    DataObjectReceived(DataObjectRef),
    DataObjectVerified(DataObjectRef),
    /// Posted by the data store on every non-duplicate insertion.
    DataObjectNew(DataObjectRef),
    DataObjectSend {
        data_object: DataObjectRef,
        targets: Vec<NodeRef>,
    },
    DataObjectSendSuccessful {
        data_object: DataObjectRef,
        node: NodeRef,
    },
    DataObjectSendFailure {
        data_object: DataObjectRef,
        node: NodeRef,
    },
    DataObjectForward {
        data_object: DataObjectRef,
        node: NodeRef,
    },
    DataObjectsDeleted(Vec<DataObjectRef>),

    // Resolution.
    TargetNodes {
        delegate: NodeRef,
        targets: Vec<NodeRef>,
    },
    DelegateNodes {
        data_object: DataObjectRef,
        target: NodeRef,
        delegates: Vec<NodeRef>,
    },

    // Filter delivery: one event per matching filter, carrying the matched
    // data objects.
    FilterMatch {
        event: FilterEventId,
        data_objects: Vec<DataObjectRef>,
    },

    // Typed data store completions.
    NodeRetrieved {
        node: Option<NodeRef>,
        probe: NodeRef,
    },
    ThisNodeRetrieved {
        node: Option<NodeRef>,
    },
    NodesRetrievedByType {
        node_type: NodeType,
        nodes: Vec<NodeRef>,
    },
    DataObjectInserted {
        data_object: DataObjectRef,
        duplicate: bool,
    },
    DataObjectQueryResult {
        node: NodeRef,
        data_objects: Vec<DataObjectRef>,
    },
    NodeQueryResult {
        data_object: DataObjectRef,
        nodes: Vec<NodeRef>,
    },
    FilterQueryResult {
        event: FilterEventId,
        data_objects: Vec<DataObjectRef>,
    },
    RepositoryResult {
        authority: String,
        entries: Vec<RepositoryEntry>,
    },
    DataStoreDump(String),
}

impl Event {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Event::PrepareStartup => "PrepareStartup",
            Event::Startup => "Startup",
            Event::PrepareShutdown => "PrepareShutdown",
            Event::ShutdownReady(_) => "ShutdownReady",
            Event::Shutdown => "Shutdown",
            Event::NodeContactNew(_) => "NodeContactNew",
            Event::NodeContactEnd(_) => "NodeContactEnd",
            Event::NodeUpdated { .. } => "NodeUpdated",
            Event::NodeDescriptionSend => "NodeDescriptionSend",
            Event::LocalInterfaceUp(_) => "LocalInterfaceUp",
            Event::LocalInterfaceDown(_) => "LocalInterfaceDown",
            Event::NeighborInterfaceUp(_) => "NeighborInterfaceUp",
            Event::NeighborInterfaceDown(_) => "NeighborInterfaceDown",
            Event::DataObjectIncoming(_) => "DataObjectIncoming",
            Event::DataObjectReceived(_) => "DataObjectReceived",
            Event::DataObjectVerified(_) => "DataObjectVerified",
            Event::DataObjectNew(_) => "DataObjectNew",
            Event::DataObjectSend { .. } => "DataObjectSend",
            Event::DataObjectSendSuccessful { .. } => "DataObjectSendSuccessful",
            Event::DataObjectSendFailure { .. } => "DataObjectSendFailure",
            Event::DataObjectForward { .. } => "DataObjectForward",
            Event::DataObjectsDeleted(_) => "DataObjectsDeleted",
            Event::TargetNodes { .. } => "TargetNodes",
            Event::DelegateNodes { .. } => "DelegateNodes",
            Event::FilterMatch { .. } => "FilterMatch",
            Event::NodeRetrieved { .. } => "NodeRetrieved",
            Event::ThisNodeRetrieved { .. } => "ThisNodeRetrieved",
            Event::NodesRetrievedByType { .. } => "NodesRetrievedByType",
            Event::DataObjectInserted { .. } => "DataObjectInserted",
            Event::DataObjectQueryResult { .. } => "DataObjectQueryResult",
            Event::NodeQueryResult { .. } => "NodeQueryResult",
            Event::FilterQueryResult { .. } => "FilterQueryResult",
            Event::RepositoryResult { .. } => "RepositoryResult",
            Event::DataStoreDump(_) => "DataStoreDump",
        }
    }
}

/// An event with its dispatch deadline, ordered for the min-heap: earliest
/// deadline first, post order among equals.
struct TimedEvent {
    deadline: Instant,
    seq: u64,
    event: Event,
}

impl PartialEq for TimedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimedEvent {}

impl PartialOrd for TimedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimedEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the earliest deadline wins.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Deadline-ordered event heap. Only the kernel task touches it; workers
/// post through an [`EventSender`].
pub(crate) struct EventQueue {
    heap: BinaryHeap<TimedEvent>,
    seq: u64,
}

impl EventQueue {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            seq: 0,
        }
    }

    pub(crate) fn push(&mut self, event: Event, delay: Duration) {
        self.seq += 1;
        self.heap.push(TimedEvent {
            deadline: Instant::now() + delay,
            seq: self.seq,
            event,
        });
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|t| t.deadline)
    }

    /// Pops the next event if it is due at `now`.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<Event> {
        if self.next_deadline()? <= now {
            self.heap.pop().map(|t| t.event)
        } else {
            None
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }
}

/// Cloneable handle for posting events onto the kernel queue from any task
/// or thread.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<(Event, Duration)>,
}

impl EventSender {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<(Event, Duration)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn post(&self, event: Event) {
        self.post_delayed(event, Duration::ZERO);
    }

    pub fn post_delayed(&self, event: Event, delay: Duration) {
        if let Err(err) = self.tx.send((event, delay)) {
            // Only happens while the kernel is tearing down.
            debug!("event dropped, kernel queue closed: {}", err.0 .0.name());
        }
    }
}

/// Broadcast mirror of every dispatched event, for observers (the binary,
/// tests, diagnostics). Lagging observers lose oldest events, never block
/// the kernel.
#[derive(Clone)]
pub struct KernelEventsChannel {
    tx: broadcast::Sender<Event>,
}

const EVENTS_CHANNEL_CAPACITY: usize = 1024;

impl Default for KernelEventsChannel {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(EVENTS_CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl KernelEventsChannel {
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub(crate) fn broadcast(&self, event: &Event) {
        // No receivers is fine.
        let _ = self.tx.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_orders_by_deadline() {
        let mut queue = EventQueue::new();
        queue.push(Event::Startup, Duration::from_millis(50));
        queue.push(Event::PrepareStartup, Duration::ZERO);
        queue.push(Event::NodeDescriptionSend, Duration::from_millis(20));

        let far_future = Instant::now() + Duration::from_secs(10);
        assert!(matches!(
            queue.pop_due(far_future),
            Some(Event::PrepareStartup)
        ));
        assert!(matches!(
            queue.pop_due(far_future),
            Some(Event::NodeDescriptionSend)
        ));
        assert!(matches!(queue.pop_due(far_future), Some(Event::Startup)));
        assert!(queue.pop_due(far_future).is_none());
    }

    #[test]
    fn equal_deadlines_dispatch_in_post_order() {
        let mut queue = EventQueue::new();
        for _ in 0..3 {
            queue.push(Event::Startup, Duration::ZERO);
        }
        queue.push(Event::Shutdown, Duration::ZERO);

        let now = Instant::now() + Duration::from_millis(1);
        let mut names = Vec::new();
        while let Some(event) = queue.pop_due(now) {
            names.push(event.name());
        }
        assert_eq!(names, ["Startup", "Startup", "Startup", "Shutdown"]);
    }

    #[test]
    fn events_held_until_due() {
        let mut queue = EventQueue::new();
        queue.push(Event::Startup, Duration::from_secs(60));
        assert!(queue.pop_due(Instant::now()).is_none());
        assert_eq!(queue.len(), 1);
    }
}
