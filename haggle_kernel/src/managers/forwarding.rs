// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! What to send to whom.
//!
//! The forwarding manager reacts to four triggers: a neighbor appeared, a
//! neighbor left, a data object with routing metadata arrived, and a plain
//! new data object arrived. The pluggable forwarder module answers the
//! delegation questions; this manager owns the pending send list, which is
//! keyed by (data object, node) so the same pair is never in flight twice,
//! and counts bounded retries on send failures. A successful send records
//! the data object in the peer's bloom filter: at most one delivery per
//! contact.

use super::forwarder::ForwarderModule;
use crate::{
    event::Event,
    kernel::KernelHandle,
    store::{self, DataObjectRef, NodeRef},
};
use haggle_protocol::{DataObjectId, NodeId, NodeType};
use std::collections::HashMap;
use std::time::Duration;

/// Cap on targets resolved for one data object.
const MAX_NODES_TO_FIND: u32 = 30;

/// Delay before a failed send is queued again.
const RESEND_DELAY: Duration = Duration::from_secs(10);

pub(crate) struct ForwardingManager {
    kernel: KernelHandle,
    module: ForwarderModule,
    /// In-flight sends with their retry counts.
    pending: HashMap<(DataObjectId, NodeId), u32>,
}

impl ForwardingManager {
    pub(crate) fn new(kernel: KernelHandle, module: ForwarderModule) -> Self {
        Self {
            kernel,
            module,
            pending: HashMap::new(),
        }
    }

    pub(crate) async fn handle_event(&mut self, event: &Event) {
        match event {
            Event::Startup => {
                // Recover whatever state the module checkpointed last run.
                self.kernel
                    .data_store()
                    .repository_read(self.module.name(), None);
            }
            Event::RepositoryResult { authority, entries }
                if authority == self.module.name() =>
            {
                for entry in entries {
                    self.module.restore_state(entry);
                }
            }
            Event::NodeContactNew(node) => self.neighbor_appeared(node).await,
            Event::NodeUpdated { node, .. } => self.neighbor_appeared(node).await,
            Event::NodeContactEnd(node) => self.module.end_neighbor(node),
            Event::DataObjectNew(data_object) => self.new_data_object(data_object),
            Event::DataObjectQueryResult { node, data_objects } => {
                for dobj in data_objects {
                    self.queue_send(dobj, node);
                }
            }
            Event::NodeQueryResult { data_object, nodes } => {
                self.targets_resolved(data_object, nodes);
            }
            Event::TargetNodes { delegate, targets } => {
                self.kernel.data_store().data_object_query_for_nodes(
                    delegate.clone(),
                    targets.clone(),
                    1,
                );
            }
            Event::DelegateNodes {
                data_object,
                delegates,
                ..
            } => {
                for delegate in delegates {
                    // Only delegates actually in contact can help right now.
                    let live = self
                        .kernel
                        .node_store()
                        .retrieve(&store::read(delegate).id());
                    if let Some(live) = live {
                        if store::read(&live).is_available() {
                            self.queue_send(data_object, &live);
                        }
                    }
                }
            }
            Event::DataObjectForward { data_object, node } => {
                self.queue_send(data_object, node);
            }
            Event::DataObjectSendSuccessful { data_object, node } => {
                self.send_finished(data_object, node, true);
            }
            Event::DataObjectSendFailure { data_object, node } => {
                self.send_finished(data_object, node, false);
            }
            Event::PrepareShutdown => {
                let entries = self.module.shutdown().await;
                for entry in entries {
                    self.kernel.data_store().repository_insert(entry);
                }
                self.kernel
                    .post(Event::ShutdownReady("ForwardingManager"));
            }
            _ => {}
        }
    }

    /// A neighbor became known or got a fresh description. Nothing is
    /// queried for Undefined nodes: content exchange waits for the node
    /// description exchange.
    async fn neighbor_appeared(&mut self, node: &NodeRef) {
        if store::read(node).node_type() == NodeType::Undefined {
            trace!("neighbor still undefined, deferring forwarding");
            return;
        }

        self.module.new_neighbor(node);
        self.module.generate_targets_for(node);

        let routing_info = self
            .module
            .generate_routing_information_data_object(node, &self.kernel.config().storage_dir)
            .await;
        if let Some(dobj) = routing_info {
            let dobj = store::new_data_object_ref(dobj);
            self.kernel.post(Event::DataObjectSend {
                data_object: dobj,
                targets: vec![node.clone()],
            });
        }

        // Everything in the neighbor's interest match that its bloom filter
        // does not already report.
        self.kernel.data_store().data_object_query(node.clone(), 1);
    }

    fn new_data_object(&mut self, data_object: &DataObjectRef) {
        let (has_routing, is_node_description) = {
            let dobj = store::read(data_object);
            (
                self.module.has_routing_information(&dobj),
                dobj.is_node_description(),
            )
        };

        if has_routing {
            self.module.new_routing_information(data_object);
            return;
        }
        if is_node_description {
            // Descriptions are the node manager's business.
            return;
        }

        // Find the nodes this object is for; neighbors get it directly,
        // everyone else through delegates.
        self.kernel
            .data_store()
            .node_query(data_object.clone(), 0, 1, MAX_NODES_TO_FIND);
    }

    fn targets_resolved(&mut self, data_object: &DataObjectRef, targets: &[NodeRef]) {
        for target in targets {
            let live = self
                .kernel
                .node_store()
                .retrieve(&store::read(target).id());
            match live {
                Some(live) if store::read(&live).is_available() => {
                    self.queue_send(data_object, &live);
                }
                _ => self.module.generate_delegates_for(data_object, target),
            }
        }
    }

    /// Queues a send unless the peer already holds the object or the same
    /// (data object, node) pair is in flight.
    fn queue_send(&mut self, data_object: &DataObjectRef, node: &NodeRef) {
        let (dobj_id, is_node_description) = {
            let dobj = store::read(data_object);
            (dobj.id(), dobj.is_node_description())
        };
        if is_node_description {
            return;
        }

        let (node_id, already_seen) = {
            let n = store::read(node);
            (n.id(), n.bloomfilter().check(dobj_id.as_bytes()))
        };
        if already_seen {
            trace!("{node_id} already holds {dobj_id}, not sending");
            return;
        }

        let key = (dobj_id, node_id);
        if self.pending.contains_key(&key) {
            return;
        }
        let _ = self.pending.insert(key, 0);

        self.kernel.post(Event::DataObjectSend {
            data_object: data_object.clone(),
            targets: vec![node.clone()],
        });
    }

    fn send_finished(&mut self, data_object: &DataObjectRef, node: &NodeRef, success: bool) {
        let dobj_id = store::read(data_object).id();
        let node_id = store::read(node).id();
        let key = (dobj_id, node_id);

        if success {
            let _ = self.pending.remove(&key);
            // The peer now holds the object; never offer it again on this
            // contact.
            store::write(node).bloomfilter_mut().add(dobj_id.as_bytes());
            return;
        }

        let Some(retries) = self.pending.get_mut(&key) else {
            return;
        };
        *retries += 1;
        if *retries > self.kernel.config().max_forwarding_retries {
            warn!("giving up on sending {dobj_id} to {node_id}");
            let _ = self.pending.remove(&key);
            return;
        }
        debug!("requeueing {dobj_id} to {node_id}, attempt {retries}");
        self.kernel.post_delayed(
            Event::DataObjectSend {
                data_object: data_object.clone(),
                targets: vec![node.clone()],
            },
            RESEND_DELAY,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::managers::forwarder::ForwarderRank;
    use crate::store::{new_data_object_ref, new_node_ref};
    use haggle_protocol::{Attribute, DataObject, Node};

    fn manager() -> (
        ForwardingManager,
        tokio::sync::mpsc::UnboundedReceiver<(Event, Duration)>,
        crate::kernel::TestHandleGuards,
    ) {
        let (kernel, events, guards) = crate::kernel::test_handle();
        let this_id = store::read(&kernel.this_node()).id();
        let module =
            ForwarderModule::Direct(Box::new(ForwarderRank::new(kernel.events().clone(), this_id)));
        (ForwardingManager::new(kernel, module), events, guards)
    }

    fn sample() -> (DataObjectRef, NodeRef) {
        let mut dobj = DataObject::new(std::env::temp_dir());
        let _ = dobj.add_attribute(Attribute::new("Topic", "Weather"));
        let node = Node::new(NodeType::Peer).with_name("peer");
        (new_data_object_ref(dobj), new_node_ref(node))
    }

    #[tokio::test]
    async fn same_pair_is_never_queued_twice() {
        let (mut manager, mut events, _guards) = manager();
        let (dobj, node) = sample();

        manager.queue_send(&dobj, &node);
        manager.queue_send(&dobj, &node);

        assert!(matches!(
            events.try_recv(),
            Ok((Event::DataObjectSend { .. }, _))
        ));
        assert!(events.try_recv().is_err(), "second queue was suppressed");
        assert_eq!(manager.pending.len(), 1);
    }

    #[tokio::test]
    async fn success_updates_bloomfilter_and_clears_pending() {
        let (mut manager, _events, _guards) = manager();
        let (dobj, node) = sample();

        manager.queue_send(&dobj, &node);
        manager.send_finished(&dobj, &node, true);

        assert!(manager.pending.is_empty());
        let id = store::read(&dobj).id();
        assert!(store::read(&node).bloomfilter().check(id.as_bytes()));

        // With the bloom filter updated the pair will not queue again.
        manager.queue_send(&dobj, &node);
        assert!(manager.pending.is_empty());
    }

    #[tokio::test]
    async fn failures_retry_bounded() {
        let (mut manager, _events, _guards) = manager();
        let (dobj, node) = sample();
        let max = manager.kernel.config().max_forwarding_retries;

        manager.queue_send(&dobj, &node);
        for _ in 0..=max {
            manager.send_finished(&dobj, &node, false);
        }
        assert!(
            manager.pending.is_empty(),
            "pair dropped after {max} retries"
        );
    }

    #[tokio::test]
    async fn node_descriptions_are_not_forwarded() {
        let (mut manager, mut events, _guards) = manager();
        let (_, node) = sample();

        let mut desc = DataObject::new(std::env::temp_dir());
        let _ = desc.add_attribute(Attribute::new(
            haggle_protocol::NODE_DESC_ATTR,
            "00".repeat(20),
        ));
        let desc = new_data_object_ref(desc);

        manager.queue_send(&desc, &node);
        assert!(events.try_recv().is_err());
        assert!(manager.pending.is_empty());
    }
}
