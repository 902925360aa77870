// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Identity and contact bookkeeping.
//!
//! The node manager keeps this node's description current, turns neighbor
//! interface sightings into node contacts, merges received node
//! descriptions (keeping only the freshest per node id), and gates content
//! exchange: no peer leaves the Undefined state before a description
//! exchange completed in at least one direction, and the forwarding manager
//! relies on that by skipping Undefined nodes in its targeting queries.

use crate::{
    event::{Event, FilterEventId},
    filter::Filter,
    kernel::KernelHandle,
    store::{self, new_data_object_ref, new_node_ref, DataObjectRef, NodeRef},
};
use haggle_protocol::{
    Attribute, DataObjectId, Interface, Node, NodeId, NodeType, Timestamp, ATTR_WILDCARD,
    NODE_DESC_ATTR,
};

pub(crate) struct NodeManager {
    kernel: KernelHandle,
    /// Standing filter delivering every received node description.
    description_filter_event: FilterEventId,
    /// Ad-hoc queries resolving description freshness per node id.
    description_query_event: FilterEventId,
    /// Description sends in flight: (peer, description) pairs resolved by
    /// send-result events.
    exchange_list: Vec<(NodeId, DataObjectId)>,
    /// Cached description of this node; regenerated when identity state
    /// changes.
    this_description: Option<DataObjectRef>,
}

impl NodeManager {
    pub(crate) fn new(kernel: KernelHandle) -> Self {
        let description_filter_event = kernel.allocate_filter_event();
        let description_query_event = kernel.allocate_filter_event();
        Self {
            kernel,
            description_filter_event,
            description_query_event,
            exchange_list: Vec::new(),
            this_description: None,
        }
    }

    pub(crate) async fn handle_event(&mut self, event: &Event) {
        match event {
            Event::Startup => self.startup(),
            Event::ThisNodeRetrieved { node } => self.this_node_retrieved(node.as_ref()),
            Event::LocalInterfaceUp(iface) => self.local_interface_up(iface),
            Event::LocalInterfaceDown(iface) => self.local_interface_down(iface),
            Event::NeighborInterfaceUp(iface) => self.neighbor_interface_up(iface),
            Event::NeighborInterfaceDown(iface) => self.neighbor_interface_down(iface),
            Event::NodeRetrieved { node, probe } => self.node_retrieved(node.clone(), probe),
            Event::NodeContactNew(node) => self.send_node_description(node),
            Event::NodeDescriptionSend => {
                let neighbors = self.kernel.node_store().neighbors();
                if neighbors.is_empty() {
                    debug!("no neighbors, not pushing node description");
                }
                for neighbor in neighbors {
                    self.send_node_description(&neighbor);
                }
            }
            Event::DataObjectSendSuccessful { data_object, node } => {
                self.send_result(data_object, node, true);
            }
            Event::DataObjectSendFailure { data_object, node } => {
                self.send_result(data_object, node, false);
            }
            Event::FilterMatch {
                event,
                data_objects,
            } if *event == self.description_filter_event => {
                for dobj in data_objects {
                    self.node_description_received(dobj);
                }
            }
            Event::FilterQueryResult {
                event,
                data_objects,
            } if *event == self.description_query_event => {
                self.resolve_description_freshness(data_objects);
            }
            Event::PrepareShutdown => {
                // Persist this node (interests, bloom filter) for the next
                // start before declaring ourselves done.
                self.kernel
                    .data_store()
                    .insert_node(self.kernel.this_node());
                self.kernel.post(Event::ShutdownReady("NodeManager"));
            }
            _ => {}
        }
    }

    fn startup(&mut self) {
        self.kernel
            .data_store()
            .retrieve_this_node(self.kernel.this_node());

        let filter = Filter::new(
            self.description_filter_event,
            [Attribute::new(NODE_DESC_ATTR, ATTR_WILDCARD)],
        );
        self.kernel.data_store().insert_filter(filter, false);
    }

    fn this_node_retrieved(&mut self, stored: Option<&NodeRef>) {
        let this_node = self.kernel.this_node();
        if let Some(stored) = stored {
            let stored = store::read(stored);
            let mut this = store::write(&this_node);
            for interest in stored.interests().iter() {
                let _ = this.add_interest(interest.clone());
            }
            this.set_bloomfilter(stored.bloomfilter().clone());
            debug!("restored this node from the data store");
        }
        // Mark the freshness of the description we will advertise from now.
        store::write(&this_node).set_create_time(Timestamp::now());
        self.this_description = None;
    }

    fn local_interface_up(&mut self, iface: &Interface) {
        let mut up = iface.clone();
        up.set_up(true);
        store::write(&self.kernel.this_node()).add_interface(up);
        self.this_description = None;
    }

    fn local_interface_down(&mut self, iface: &Interface) {
        let _ = store::write(&self.kernel.this_node()).remove_interface(iface);
        self.this_description = None;
    }

    fn neighbor_interface_up(&mut self, iface: &Interface) {
        if let Some(node) = self.kernel.node_store().retrieve_by_interface(iface, false) {
            let _ = store::write(&node).set_interface_up(iface, true);
            return;
        }

        // First sighting: hold the contact as an Undefined placeholder and
        // ask the data store whether we already know who this is.
        let mut placeholder = Node::new(NodeType::Undefined);
        let mut iface = iface.clone();
        iface.set_up(true);
        placeholder.add_interface(iface);
        self.kernel
            .data_store()
            .retrieve_node(new_node_ref(placeholder), true);
    }

    fn node_retrieved(&mut self, node: Option<NodeRef>, probe: &NodeRef) {
        let node = node.unwrap_or_else(|| probe.clone());

        if self.kernel.node_store().update(&node).is_some() {
            debug!("node {} updated in neighbor list", store::read(&node).id());
        } else {
            self.kernel.node_store().add(node.clone());
        }
        self.kernel.post(Event::NodeContactNew(node));
    }

    fn neighbor_interface_down(&mut self, iface: &Interface) {
        let Some(node) = self.kernel.node_store().retrieve_by_interface(iface, false) else {
            return;
        };

        let available = {
            let mut n = store::write(&node);
            let _ = n.set_interface_up(iface, false);
            n.is_available()
        };

        if !available {
            let _ = self.kernel.node_store().remove(&node);
            // The bloom filter may have grown during the co-location; keep
            // the stored copy current.
            self.kernel.data_store().insert_node(node.clone());
            self.kernel.post(Event::NodeContactEnd(node));
        }
    }

    /// Sends this node's description to a neighbor, unless its bloom filter
    /// already reports it.
    fn send_node_description(&mut self, neighbor: &NodeRef) {
        let description = match self.description() {
            Ok(description) => description,
            Err(err) => {
                error!("could not build this node's description: {err}");
                return;
            }
        };

        let (desc_id, neighbor_id, already_has) = {
            let desc = store::read(&description);
            let neigh = store::read(neighbor);
            (
                desc.id(),
                neigh.id(),
                neigh.bloomfilter().check(desc.id().as_bytes()),
            )
        };
        if already_has {
            debug!("neighbor {neighbor_id} already has our node description");
            return;
        }

        debug!("sending node description to {neighbor_id}");
        self.exchange_list.push((neighbor_id, desc_id));
        self.kernel.post(Event::DataObjectSend {
            data_object: description,
            targets: vec![neighbor.clone()],
        });
    }

    fn description(&mut self) -> crate::Result<DataObjectRef> {
        if let Some(description) = &self.this_description {
            return Ok(description.clone());
        }
        let description = {
            let this_node = self.kernel.this_node();
            let this = store::read(&this_node);
            this.to_data_object(&self.kernel.config().storage_dir)?
        };
        let description = new_data_object_ref(description);
        self.this_description = Some(description.clone());
        Ok(description)
    }

    fn send_result(&mut self, data_object: &DataObjectRef, node: &NodeRef, success: bool) {
        let dobj_id = store::read(data_object).id();
        let node_id = store::read(node).id();

        let Some(idx) = self
            .exchange_list
            .iter()
            .position(|(n, d)| *n == node_id && *d == dobj_id)
        else {
            return;
        };
        let _ = self.exchange_list.remove(idx);

        // Prefer the live neighbor entry if the node has been replaced in
        // the store since the send was queued.
        let target = self
            .kernel
            .node_store()
            .retrieve(&node_id)
            .unwrap_or_else(|| node.clone());
        store::write(&target).set_exchanged_node_description(success);
        if success {
            debug!("node description exchange with {node_id} completed");
        }
    }

    fn node_description_received(&mut self, dobj: &DataObjectRef) {
        let node = {
            let dobj = store::read(dobj);
            match Node::from_data_object(&dobj) {
                Ok(node) => node,
                Err(err) => {
                    warn!("could not rebuild node from description: {err}");
                    return;
                }
            }
        };

        if node.id() == store::read(&self.kernel.this_node()).id() {
            debug!("received our own node description back, dropping it");
            self.kernel
                .data_store()
                .delete_data_object(store::read(dobj).id(), false);
            return;
        }

        // The received description may be older than one already stored;
        // fetch everything we hold for this node id and resolve freshness.
        let filter = Filter::new(
            self.description_query_event,
            [Attribute::new(NODE_DESC_ATTR, node.id().to_string())],
        );
        self.kernel.data_store().filter_query(filter);
    }

    fn resolve_description_freshness(&mut self, descriptions: &[DataObjectRef]) {
        let Some(first) = descriptions.first() else {
            return;
        };

        // Keep only the newest description by create time; whatever it
        // loses to gets removed from the data store.
        let mut newest = first.clone();
        let mut max_receive_time = store::read(first).receive_time();
        for dobj in &descriptions[1..] {
            let (candidate_create, candidate_receive) = {
                let d = store::read(dobj);
                (d.create_time(), d.receive_time())
            };
            if candidate_receive > max_receive_time {
                max_receive_time = candidate_receive;
            }
            if candidate_create > store::read(&newest).create_time() {
                self.kernel
                    .data_store()
                    .delete_data_object(store::read(&newest).id(), false);
                newest = dobj.clone();
            } else {
                self.kernel
                    .data_store()
                    .delete_data_object(store::read(dobj).id(), false);
            }
        }

        // If the newest description is not also the most recently received
        // one, what just arrived was an old copy via a third party.
        if store::read(&newest).receive_time() < max_receive_time {
            debug!("received node description is not the latest, ignoring");
            return;
        }

        let (node, remote_interface) = {
            let dobj = store::read(&newest);
            let node = match Node::from_data_object(&dobj) {
                Ok(node) => node,
                Err(err) => {
                    warn!("could not rebuild node from freshest description: {err}");
                    return;
                }
            };
            (node, dobj.remote_interface().cloned())
        };
        let node = new_node_ref(node);

        {
            let mut n = store::write(&node);
            if let Some(remote) = &remote_interface {
                if !n.has_interface(remote) {
                    let mut up = remote.clone();
                    up.set_up(true);
                    n.add_interface(up);
                }
                let _ = n.set_interface_up(remote, true);
            }
            // Interfaces the connectivity layer currently tracks are up.
            let known_up: Vec<Interface> = n
                .interfaces()
                .iter()
                .filter(|i| self.kernel.interface_store().stored(i))
                .cloned()
                .collect();
            for iface in known_up {
                let _ = n.set_interface_up(&iface, true);
            }
        }

        self.kernel.data_store().insert_node(node.clone());

        if let Some(replaced) = self.kernel.node_store().update(&node) {
            debug!("known neighbor {} got a fresh description", store::read(&node).id());
            self.kernel.post(Event::NodeUpdated { node, replaced });
        } else if store::read(&node).is_available() {
            debug!("new neighbor {} from node description", store::read(&node).id());
            self.kernel.node_store().add(node.clone());
            self.kernel.post(Event::NodeContactNew(node));
        } else {
            debug!(
                "node {} has no active interface, not adding to the node store",
                store::read(&node).id()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haggle_protocol::InterfaceType;

    fn ts(secs: i64) -> Timestamp {
        Timestamp::from_secs(secs)
    }

    fn description(
        kernel: &KernelHandle,
        iface: &Interface,
        create: i64,
        receive: i64,
    ) -> DataObjectRef {
        let mut node = Node::new(NodeType::Peer).with_name("bob").with_id(
            haggle_protocol::NodeId::new([0xb0; 20]),
        );
        node.add_interface(iface.clone());
        node.set_create_time(ts(create));

        let mut dobj = node
            .to_data_object(&kernel.config().storage_dir)
            .expect("description");
        dobj.set_receive_time(ts(receive));
        let mut up = iface.clone();
        up.set_up(true);
        dobj.set_remote_interface(up);
        new_data_object_ref(dobj)
    }

    #[tokio::test]
    async fn only_the_freshest_description_is_kept() {
        let (kernel, mut events, _guards) = crate::kernel::test_handle();
        let mut manager = NodeManager::new(kernel.clone());
        let iface = Interface::new(InterfaceType::Ethernet, vec![5]);

        let older = description(&kernel, &iface, 1000, 2000);
        let newer = description(&kernel, &iface, 3000, 4000);
        manager.resolve_description_freshness(&[older, newer]);

        loop {
            let (event, _) = events.recv().await.expect("event");
            if let Event::NodeContactNew(node) = event {
                let node = store::read(&node);
                assert_eq!(node.create_time(), Some(ts(3000)));
                break;
            }
        }
    }

    #[tokio::test]
    async fn stale_third_party_description_is_ignored() {
        let (kernel, mut events, _guards) = crate::kernel::test_handle();
        let mut manager = NodeManager::new(kernel.clone());
        let iface = Interface::new(InterfaceType::Ethernet, vec![5]);

        // The newest description by create time was received before an older
        // one: an old copy relayed by a third party, to be ignored.
        let newest_but_early = description(&kernel, &iface, 3000, 100);
        let older_but_late = description(&kernel, &iface, 1000, 200);
        manager.resolve_description_freshness(&[newest_but_early, older_but_late]);

        assert!(
            events.try_recv().is_err(),
            "no contact events for a stale description"
        );
        assert!(kernel.node_store().is_empty());
    }
}
