// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use super::{read, write, NodeRef};
use haggle_protocol::{Interface, NodeId, NodeType};
use std::sync::RwLock;

/// The set of currently known neighbors (and recently current ones), keyed
/// by node id and reachable by interface.
#[derive(Default)]
pub struct NodeStore {
    inner: RwLock<Vec<NodeRef>>,
}

impl NodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, node: NodeRef) {
        write(&self.inner).push(node);
    }

    pub fn retrieve(&self, id: &NodeId) -> Option<NodeRef> {
        read(&self.inner)
            .iter()
            .find(|n| read(n).id() == *id)
            .cloned()
    }

    /// Node holding the given interface; with `must_be_available` only nodes
    /// with at least one interface up qualify.
    pub fn retrieve_by_interface(
        &self,
        iface: &Interface,
        must_be_available: bool,
    ) -> Option<NodeRef> {
        read(&self.inner)
            .iter()
            .find(|n| {
                let node = read(n);
                node.has_interface(iface) && (!must_be_available || node.is_available())
            })
            .cloned()
    }

    /// Replaces any stored node that the given node supersedes: same id, or
    /// an Undefined placeholder sharing one of its interfaces. Interface up
    /// states of the replaced entries carry over. Returns the replaced nodes,
    /// or `None` when nothing matched (the node was not stored).
    pub fn update(&self, node: &NodeRef) -> Option<Vec<NodeRef>> {
        let mut inner = write(&self.inner);

        let (id, interfaces) = {
            let n = read(node);
            (n.id(), n.interfaces().to_vec())
        };

        let mut replaced = Vec::new();
        let mut i = 0;
        while i < inner.len() {
            let matches = {
                let stored = read(&inner[i]);
                stored.id() == id
                    || (stored.node_type() == NodeType::Undefined
                        && interfaces.iter().any(|ifc| stored.has_interface(ifc)))
            };
            if matches {
                replaced.push(inner.remove(i));
            } else {
                i += 1;
            }
        }

        if replaced.is_empty() {
            return None;
        }

        {
            let mut fresh = write(node);
            for old in &replaced {
                for iface in read(old).interfaces() {
                    if iface.is_up() {
                        if !fresh.has_interface(iface) {
                            fresh.add_interface(iface.clone());
                        }
                        let _ = fresh.set_interface_up(iface, true);
                    }
                }
            }
        }

        inner.push(node.clone());
        Some(replaced)
    }

    pub fn remove(&self, node: &NodeRef) -> bool {
        let id = read(node).id();
        let mut inner = write(&self.inner);
        let before = inner.len();
        inner.retain(|n| read(n).id() != id);
        before != inner.len()
    }

    /// All currently available neighbors (peers and gateways with an
    /// interface up).
    pub fn neighbors(&self) -> Vec<NodeRef> {
        read(&self.inner)
            .iter()
            .filter(|n| {
                let node = read(n);
                node.is_available()
                    && matches!(
                        node.node_type(),
                        NodeType::Peer | NodeType::Gateway | NodeType::Undefined
                    )
            })
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        read(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::new_node_ref;
    use haggle_protocol::{InterfaceType, Node};

    fn iface(id: u8) -> Interface {
        Interface::new(InterfaceType::Ethernet, vec![id])
    }

    #[test]
    fn update_promotes_undefined_placeholder() {
        let store = NodeStore::new();

        let mut placeholder = Node::new(NodeType::Undefined);
        placeholder.add_interface(iface(7));
        let _ = placeholder.set_interface_up(&iface(7), true);
        store.add(new_node_ref(placeholder));

        let mut real = Node::new(NodeType::Peer).with_name("bob");
        real.add_interface(iface(7));
        let real = new_node_ref(real);

        let replaced = store.update(&real).expect("placeholder should match");
        assert_eq!(replaced.len(), 1);
        assert_eq!(store.len(), 1);
        // The up state of the placeholder's interface carried over.
        assert!(read(&real).is_available());
        assert_eq!(read(&store.neighbors()[0]).name(), "bob");
    }

    #[test]
    fn update_without_match_reports_none() {
        let store = NodeStore::new();
        let node = new_node_ref(Node::new(NodeType::Peer));
        assert!(store.update(&node).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn retrieve_by_interface_respects_availability() {
        let store = NodeStore::new();
        let mut node = Node::new(NodeType::Peer);
        node.add_interface(iface(1));
        store.add(new_node_ref(node));

        assert!(store.retrieve_by_interface(&iface(1), false).is_some());
        assert!(store.retrieve_by_interface(&iface(1), true).is_none());
    }
}
