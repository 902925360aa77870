// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Pluggable forwarding policy modules.
//!
//! A forwarder answers two questions for the forwarding manager: which
//! targets is a given neighbor a good delegate for, and which delegates can
//! carry a given data object toward a target. Modules exchange their routing
//! metric inside dedicated routing-information data objects and checkpoint
//! their state to the repository.
//!
//! A cheap module implements [`Forwarder`] and runs on the kernel task. An
//! expensive one is wrapped in [`AsyncForwarder`], which moves it onto its
//! own worker fed by a typed task queue; `quit` drains persistence before
//! the worker exits, so the worker is never just dropped.

use crate::{
    datastore::RepositoryEntry,
    error::{Error, Result},
    event::{Event, EventSender},
    store::{self, DataObjectRef, NodeRef},
};
use haggle_protocol::{Attribute, DataObject, Metadata, NodeId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};

/// Metadata element a module stores its routing metric under.
pub(crate) const ROUTING_ELEMENT: &str = "Routing";
const ROUTING_MODULE_PARAM: &str = "module";
const ROUTING_NODE_PARAM: &str = "node_id";
const ROUTING_METRIC_PARAM: &str = "metric";

/// Attribute carried by routing-information data objects.
pub(crate) const ROUTING_ATTR: &str = "Routing";

/// Checks whether a data object carries routing information stamped by the
/// named module.
pub(crate) fn has_routing_information(dobj: &DataObject, module: &str) -> bool {
    dobj.metadata()
        .child(ROUTING_ELEMENT)
        .and_then(|m| m.parameter(ROUTING_MODULE_PARAM))
        == Some(module)
}

/// A forwarding policy module. All methods run on the caller's task; posting
/// of `TargetNodes`/`DelegateNodes` events is the module's own business so
/// that an empty answer posts nothing.
pub trait Forwarder: Send + 'static {
    fn name(&self) -> &'static str;

    /// Digests routing information received from a peer.
    fn new_routing_information(&mut self, dobj: &DataObject);

    fn new_neighbor(&mut self, neighbor: &NodeRef);

    fn end_neighbor(&mut self, neighbor: &NodeRef);

    /// Posts `TargetNodes` with the nodes the neighbor is a good delegate
    /// for, if any.
    fn generate_targets_for(&mut self, neighbor: &NodeRef);

    /// Posts `DelegateNodes` with the nodes that can carry the data object
    /// toward the target, if any.
    fn generate_delegates_for(&mut self, data_object: &DataObjectRef, target: &NodeRef);

    /// Builds this module's routing-metric data object for a neighbor.
    fn generate_routing_information_data_object(
        &mut self,
        neighbor: &NodeRef,
        storage_dir: &Path,
    ) -> Option<DataObject>;

    fn save_state(&self) -> Vec<RepositoryEntry>;

    fn restore_state(&mut self, entry: &RepositoryEntry) -> bool;
}

/// The RANK module: every node's metric is a static rank derived from its
/// id, and content is handed to delegates ranked above this node. Simple,
/// deterministic, and enough to exercise delegation end to end.
pub struct ForwarderRank {
    events: EventSender,
    this_id: NodeId,
    my_rank: u32,
    ranks: HashMap<NodeId, u32>,
}

#[derive(Serialize, Deserialize)]
struct SavedRank {
    rank: u32,
}

fn rank_of(id: &NodeId) -> u32 {
    id.as_bytes()[0] as u32
}

impl ForwarderRank {
    pub const NAME: &'static str = "RANK";

    pub fn new(events: EventSender, this_id: NodeId) -> Self {
        Self {
            events,
            this_id,
            my_rank: rank_of(&this_id),
            ranks: HashMap::new(),
        }
    }

    fn learn(&mut self, id: NodeId, rank: u32) {
        if id != self.this_id {
            let _ = self.ranks.insert(id, rank);
        }
    }
}

impl Forwarder for ForwarderRank {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn new_routing_information(&mut self, dobj: &DataObject) {
        let Some(md) = dobj.metadata().child(ROUTING_ELEMENT) else {
            return;
        };
        if md.parameter(ROUTING_MODULE_PARAM) != Some(Self::NAME) {
            return;
        }
        let Some(id) = md
            .parameter(ROUTING_NODE_PARAM)
            .and_then(|s| s.parse::<NodeId>().ok())
        else {
            return;
        };
        let Some(rank) = md
            .parameter(ROUTING_METRIC_PARAM)
            .and_then(|s| s.parse::<u32>().ok())
        else {
            return;
        };
        trace!("learned rank {rank} for node {id}");
        self.learn(id, rank);
    }

    fn new_neighbor(&mut self, neighbor: &NodeRef) {
        let id = store::read(neighbor).id();
        self.learn(id, rank_of(&id));
    }

    fn end_neighbor(&mut self, _neighbor: &NodeRef) {}

    fn generate_targets_for(&mut self, neighbor: &NodeRef) {
        let neighbor_id = store::read(neighbor).id();
        let neighbor_rank = rank_of(&neighbor_id);
        let targets: Vec<NodeRef> = self
            .ranks
            .iter()
            .filter(|(id, rank)| **rank < neighbor_rank && **id != neighbor_id)
            .map(|(id, _)| {
                store::new_node_ref(
                    haggle_protocol::Node::new(haggle_protocol::NodeType::Peer).with_id(*id),
                )
            })
            .collect();

        if !targets.is_empty() {
            self.events.post(Event::TargetNodes {
                delegate: neighbor.clone(),
                targets,
            });
        }
    }

    fn generate_delegates_for(&mut self, data_object: &DataObjectRef, target: &NodeRef) {
        let target_id = store::read(target).id();
        let delegates: Vec<NodeRef> = self
            .ranks
            .iter()
            .filter(|(id, rank)| **rank > self.my_rank && **id != target_id)
            .map(|(id, _)| {
                store::new_node_ref(
                    haggle_protocol::Node::new(haggle_protocol::NodeType::Peer).with_id(*id),
                )
            })
            .collect();

        if !delegates.is_empty() {
            self.events.post(Event::DelegateNodes {
                data_object: data_object.clone(),
                target: target.clone(),
                delegates,
            });
        }
    }

    fn generate_routing_information_data_object(
        &mut self,
        _neighbor: &NodeRef,
        storage_dir: &Path,
    ) -> Option<DataObject> {
        let mut dobj = DataObject::new(storage_dir);
        // Routing metrics are point-in-time; no reason to keep them around
        // after the match pass.
        dobj.set_persistent(false);
        let _ = dobj.add_attribute(Attribute::new(ROUTING_ATTR, Self::NAME));
        let md = dobj
            .metadata_mut()
            .add_child(Metadata::new(ROUTING_ELEMENT));
        md.set_parameter(ROUTING_MODULE_PARAM, Self::NAME);
        md.set_parameter(ROUTING_NODE_PARAM, self.this_id.to_string());
        md.set_parameter(ROUTING_METRIC_PARAM, self.my_rank.to_string());
        dobj.set_create_time(Timestamp::now());
        Some(dobj)
    }

    fn save_state(&self) -> Vec<RepositoryEntry> {
        self.ranks
            .iter()
            .filter_map(|(id, rank)| {
                let value = serde_json::to_string(&SavedRank { rank: *rank }).ok()?;
                Some(RepositoryEntry::new(Self::NAME, id.to_string(), value))
            })
            .collect()
    }

    fn restore_state(&mut self, entry: &RepositoryEntry) -> bool {
        if entry.authority != Self::NAME {
            return false;
        }
        let Ok(id) = entry.key.parse::<NodeId>() else {
            return false;
        };
        let Ok(saved) = serde_json::from_str::<SavedRank>(&entry.value) else {
            return false;
        };
        self.learn(id, saved.rank);
        true
    }
}

/// Tasks understood by the asynchronous forwarder worker.
pub enum ForwardingTask {
    NewRoutingInformation(DataObjectRef),
    NewNeighbor(NodeRef),
    EndNeighbor(NodeRef),
    GenerateTargets(NodeRef),
    GenerateDelegates {
        data_object: DataObjectRef,
        target: NodeRef,
    },
    GenerateRoutingInformationDataObject {
        neighbor: NodeRef,
        reply: oneshot::Sender<Option<DataObject>>,
    },
    RestoreState(RepositoryEntry),
    Quit {
        reply: oneshot::Sender<Vec<RepositoryEntry>>,
    },
}

/// Runs a [`Forwarder`] on its own worker task, fed over a typed queue.
pub struct AsyncForwarder {
    name: &'static str,
    tx: mpsc::UnboundedSender<ForwardingTask>,
}

impl AsyncForwarder {
    pub fn spawn(mut inner: Box<dyn Forwarder>, storage_dir: PathBuf) -> Self {
        let name = inner.name();
        let (tx, mut rx) = mpsc::unbounded_channel::<ForwardingTask>();

        let _handle = tokio::spawn(async move {
            debug!("forwarder worker {name} up");
            while let Some(task) = rx.recv().await {
                match task {
                    ForwardingTask::NewRoutingInformation(dobj) => {
                        inner.new_routing_information(&store::read(&dobj));
                    }
                    ForwardingTask::NewNeighbor(node) => inner.new_neighbor(&node),
                    ForwardingTask::EndNeighbor(node) => inner.end_neighbor(&node),
                    ForwardingTask::GenerateTargets(node) => inner.generate_targets_for(&node),
                    ForwardingTask::GenerateDelegates {
                        data_object,
                        target,
                    } => inner.generate_delegates_for(&data_object, &target),
                    ForwardingTask::GenerateRoutingInformationDataObject { neighbor, reply } => {
                        let dobj = inner
                            .generate_routing_information_data_object(&neighbor, &storage_dir);
                        let _ = reply.send(dobj);
                    }
                    ForwardingTask::RestoreState(entry) => {
                        let _ = inner.restore_state(&entry);
                    }
                    ForwardingTask::Quit { reply } => {
                        // Persist before the worker goes away.
                        let _ = reply.send(inner.save_state());
                        break;
                    }
                }
            }
            debug!("forwarder worker {name} exiting");
        });

        Self { name, tx }
    }

    fn send(&self, task: ForwardingTask) {
        if self.tx.send(task).is_err() {
            debug!("forwarder task dropped, worker {} is gone", self.name);
        }
    }

    async fn quit(&self) -> Result<Vec<RepositoryEntry>> {
        let (reply, rx) = oneshot::channel();
        self.send(ForwardingTask::Quit { reply });
        rx.await.map_err(|_| Error::ForwarderClosed)
    }
}

/// The forwarding manager's uniform view over a direct or asynchronous
/// module.
pub enum ForwarderModule {
    Direct(Box<dyn Forwarder>),
    Asynchronous(AsyncForwarder),
}

impl ForwarderModule {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Direct(f) => f.name(),
            Self::Asynchronous(f) => f.name,
        }
    }

    pub fn has_routing_information(&self, dobj: &DataObject) -> bool {
        has_routing_information(dobj, self.name())
    }

    pub fn new_routing_information(&mut self, dobj: &DataObjectRef) {
        match self {
            Self::Direct(f) => f.new_routing_information(&store::read(dobj)),
            Self::Asynchronous(f) => f.send(ForwardingTask::NewRoutingInformation(dobj.clone())),
        }
    }

    pub fn new_neighbor(&mut self, neighbor: &NodeRef) {
        match self {
            Self::Direct(f) => f.new_neighbor(neighbor),
            Self::Asynchronous(f) => f.send(ForwardingTask::NewNeighbor(neighbor.clone())),
        }
    }

    pub fn end_neighbor(&mut self, neighbor: &NodeRef) {
        match self {
            Self::Direct(f) => f.end_neighbor(neighbor),
            Self::Asynchronous(f) => f.send(ForwardingTask::EndNeighbor(neighbor.clone())),
        }
    }

    pub fn generate_targets_for(&mut self, neighbor: &NodeRef) {
        match self {
            Self::Direct(f) => f.generate_targets_for(neighbor),
            Self::Asynchronous(f) => f.send(ForwardingTask::GenerateTargets(neighbor.clone())),
        }
    }

    pub fn generate_delegates_for(&mut self, data_object: &DataObjectRef, target: &NodeRef) {
        match self {
            Self::Direct(f) => f.generate_delegates_for(data_object, target),
            Self::Asynchronous(f) => f.send(ForwardingTask::GenerateDelegates {
                data_object: data_object.clone(),
                target: target.clone(),
            }),
        }
    }

    pub async fn generate_routing_information_data_object(
        &mut self,
        neighbor: &NodeRef,
        storage_dir: &Path,
    ) -> Option<DataObject> {
        match self {
            Self::Direct(f) => f.generate_routing_information_data_object(neighbor, storage_dir),
            Self::Asynchronous(f) => {
                let (reply, rx) = oneshot::channel();
                f.send(ForwardingTask::GenerateRoutingInformationDataObject {
                    neighbor: neighbor.clone(),
                    reply,
                });
                rx.await.ok().flatten()
            }
        }
    }

    pub fn restore_state(&mut self, entry: &RepositoryEntry) {
        match self {
            Self::Direct(f) => {
                let _ = f.restore_state(entry);
            }
            Self::Asynchronous(f) => f.send(ForwardingTask::RestoreState(entry.clone())),
        }
    }

    /// Collects the module's save state, draining the async worker.
    pub async fn shutdown(&mut self) -> Vec<RepositoryEntry> {
        match self {
            Self::Direct(f) => f.save_state(),
            Self::Asynchronous(f) => f.quit().await.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventSender;
    use crate::store::new_node_ref;
    use haggle_protocol::{Node, NodeType};

    fn node_with_first_byte(b: u8) -> NodeRef {
        let mut bytes = [0u8; 20];
        bytes[0] = b;
        new_node_ref(Node::new(NodeType::Peer).with_id(NodeId::new(bytes)))
    }

    #[tokio::test]
    async fn rank_learns_and_delegates_upward() {
        let (events, mut rx) = EventSender::new();
        let mut this_id = [0u8; 20];
        this_id[0] = 50;
        let mut rank = ForwarderRank::new(events, NodeId::new(this_id));

        rank.new_neighbor(&node_with_first_byte(10));
        rank.new_neighbor(&node_with_first_byte(200));

        let dir = std::env::temp_dir();
        let dobj = store::new_data_object_ref(DataObject::new(&dir));
        rank.generate_delegates_for(&dobj, &node_with_first_byte(1));

        let (event, _) = rx.recv().await.expect("delegates posted");
        match event {
            Event::DelegateNodes { delegates, .. } => {
                // Only the rank-200 node sits above our rank of 50.
                assert_eq!(delegates.len(), 1);
                assert_eq!(store::read(&delegates[0]).id().as_bytes()[0], 200);
            }
            other => panic!("unexpected event {}", other.name()),
        }
    }

    #[tokio::test]
    async fn rank_routing_information_round_trip() {
        let (events, _rx) = EventSender::new();
        let mut a_id = [0u8; 20];
        a_id[0] = 77;
        let mut sender = ForwarderRank::new(events.clone(), NodeId::new(a_id));

        let dir = std::env::temp_dir();
        let dobj = sender
            .generate_routing_information_data_object(&node_with_first_byte(1), &dir)
            .expect("routing data object");
        assert!(has_routing_information(&dobj, ForwarderRank::NAME));
        assert!(!dobj.is_persistent());

        let mut receiver = ForwarderRank::new(events, NodeId::new([9u8; 20]));
        receiver.new_routing_information(&dobj);
        assert_eq!(receiver.ranks.get(&NodeId::new(a_id)), Some(&77));
    }

    #[tokio::test]
    async fn save_and_restore_state() {
        let (events, _rx) = EventSender::new();
        let mut rank = ForwarderRank::new(events.clone(), NodeId::new([1u8; 20]));
        rank.new_neighbor(&node_with_first_byte(42));

        let entries = rank.save_state();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].authority, ForwarderRank::NAME);

        let mut restored = ForwarderRank::new(events, NodeId::new([1u8; 20]));
        assert!(restored.restore_state(&entries[0]));
        assert_eq!(restored.ranks.len(), 1);
    }

    #[tokio::test]
    async fn async_wrapper_quits_with_state() {
        let (events, _rx) = EventSender::new();
        let mut rank = ForwarderRank::new(events, NodeId::new([1u8; 20]));
        rank.new_neighbor(&node_with_first_byte(42));

        let mut module = ForwarderModule::Asynchronous(AsyncForwarder::spawn(
            Box::new(rank),
            std::env::temp_dir(),
        ));
        module.new_neighbor(&node_with_first_byte(43));

        let entries = module.shutdown().await;
        assert_eq!(entries.len(), 2);
    }
}
