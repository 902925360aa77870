// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::{
    attribute::{Attribute, Attributes},
    bloomfilter::Bloomfilter,
    data_object::DataObject,
    error::{Error, Result},
    id::NodeId,
    interface::{Interface, InterfaceType},
    metadata::Metadata,
    timestamp::Timestamp,
};
use sha1::{Digest, Sha1};
use std::fmt::{self, Display, Formatter};
use std::path::Path;

/// Attribute name that marks a data object as a node description; the value
/// is the node id in hex (or the `*` wildcard in filters).
pub const NODE_DESC_ATTR: &str = "NodeDescription";

pub(crate) const NODE_ELEMENT: &str = "Node";
const NODE_ID_PARAM: &str = "id";
const NODE_NAME_PARAM: &str = "name";
const NODE_THRESHOLD_PARAM: &str = "matching_threshold";
const NODE_MAX_MATCHES_PARAM: &str = "max_dataobjects_in_match";
const BLOOMFILTER_ELEMENT: &str = "Bloomfilter";
const INTERFACE_ELEMENT: &str = "Interface";
const INTERFACE_TYPE_PARAM: &str = "type";
const INTERFACE_IDENTIFIER_PARAM: &str = "identifier";
const ADDRESS_ELEMENT: &str = "Address";

/// Default cap on data objects returned per match query (0 = unbounded).
pub const DEFAULT_MAX_MATCHES: u32 = 10;

/// Default minimum match ratio (percent) a data object needs for delivery.
pub const DEFAULT_MATCHING_THRESHOLD: u32 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeType {
    /// Placeholder for a peer seen on a link before its description arrived.
    Undefined,
    Peer,
    Gateway,
    /// Local IPC client.
    Application,
}

impl NodeType {
    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => Self::Peer,
            2 => Self::Gateway,
            3 => Self::Application,
            _ => Self::Undefined,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::Undefined => 0,
            Self::Peer => 1,
            Self::Gateway => 2,
            Self::Application => 3,
        }
    }
}

impl Display for NodeType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Undefined => "undefined",
            Self::Peer => "peer",
            Self::Gateway => "gateway",
            Self::Application => "application",
        };
        write!(f, "{s}")
    }
}

/// A peer, gateway or application as the matching engine sees it: declared
/// interests, a bloom filter of already-seen data object ids, matching
/// parameters and the set of interfaces the node is reachable over.
#[derive(Clone, Debug)]
pub struct Node {
    node_type: NodeType,
    id: NodeId,
    name: String,
    interests: Attributes,
    bloomfilter: Bloomfilter,
    max_matches: u32,
    matching_threshold: u32,
    interfaces: Vec<Interface>,
    create_time: Option<Timestamp>,
    exchanged_node_description: bool,
}

impl Node {
    /// A fresh node record. Placeholders get a random id until their real
    /// identity is learned from a node description.
    pub fn new(node_type: NodeType) -> Self {
        Self {
            node_type,
            id: NodeId::random(),
            name: String::new(),
            interests: Attributes::new(),
            bloomfilter: Bloomfilter::default(),
            max_matches: DEFAULT_MAX_MATCHES,
            matching_threshold: DEFAULT_MATCHING_THRESHOLD,
            interfaces: Vec::new(),
            create_time: None,
            exchanged_node_description: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_id(mut self, id: NodeId) -> Self {
        self.id = id;
        self
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn set_node_type(&mut self, node_type: NodeType) {
        self.node_type = node_type;
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn set_id(&mut self, id: NodeId) {
        self.id = id;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn interests(&self) -> &Attributes {
        &self.interests
    }

    pub fn add_interest(&mut self, attr: Attribute) -> bool {
        self.interests.add(attr)
    }

    pub fn remove_interests(&mut self, name: &str, value: &str) -> usize {
        self.interests.remove_matching(name, value)
    }

    pub fn set_interests(&mut self, interests: Attributes) {
        self.interests = interests;
    }

    pub fn bloomfilter(&self) -> &Bloomfilter {
        &self.bloomfilter
    }

    pub fn bloomfilter_mut(&mut self) -> &mut Bloomfilter {
        &mut self.bloomfilter
    }

    pub fn set_bloomfilter(&mut self, bf: Bloomfilter) {
        self.bloomfilter = bf;
    }

    /// Matching parameters (max matches, threshold percent).
    pub fn max_matches(&self) -> u32 {
        self.max_matches
    }

    pub fn set_max_matches(&mut self, max: u32) {
        self.max_matches = max;
    }

    pub fn matching_threshold(&self) -> u32 {
        self.matching_threshold
    }

    pub fn set_matching_threshold(&mut self, threshold: u32) {
        self.matching_threshold = threshold;
    }

    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    /// Adds (or refreshes) an interface on this node; identity is
    /// (type, identifier).
    pub fn add_interface(&mut self, iface: Interface) {
        match self.interfaces.iter_mut().find(|i| i.is_same(&iface)) {
            Some(existing) => *existing = iface,
            None => self.interfaces.push(iface),
        }
    }

    pub fn remove_interface(&mut self, iface: &Interface) -> bool {
        let before = self.interfaces.len();
        self.interfaces.retain(|i| !i.is_same(iface));
        before != self.interfaces.len()
    }

    pub fn has_interface(&self, iface: &Interface) -> bool {
        self.interfaces.iter().any(|i| i.is_same(iface))
    }

    /// Marks a matching interface up/down; returns whether one matched.
    pub fn set_interface_up(&mut self, iface: &Interface, up: bool) -> bool {
        match self.interfaces.iter_mut().find(|i| i.is_same(iface)) {
            Some(existing) => {
                existing.set_up(up);
                true
            }
            None => false,
        }
    }

    /// A node is available while any of its interfaces is up.
    pub fn is_available(&self) -> bool {
        self.interfaces.iter().any(|i| i.is_up())
    }

    pub fn create_time(&self) -> Option<Timestamp> {
        self.create_time
    }

    pub fn set_create_time(&mut self, t: Timestamp) {
        self.create_time = Some(t);
    }

    pub fn has_exchanged_node_description(&self) -> bool {
        self.exchanged_node_description
    }

    pub fn set_exchanged_node_description(&mut self, exchanged: bool) {
        self.exchanged_node_description = exchanged;
    }

    /// Derives this node's identity from its identifying data (the set of
    /// interface identifiers), the way the local instance establishes who it
    /// is before any description exists.
    pub fn calc_id_from_interfaces(&mut self) {
        let mut keys: Vec<_> = self
            .interfaces
            .iter()
            .map(|i| (i.iface_type(), i.identifier().to_vec()))
            .collect();
        keys.sort();

        let mut hasher = Sha1::new();
        for (iface_type, identifier) in keys {
            hasher.update(iface_type.as_u32().to_be_bytes());
            hasher.update(&identifier);
        }
        self.id = NodeId::new(hasher.finalize().into());
    }

    /// Builds this node's description data object: interests as attributes,
    /// identity/bloom filter/interfaces under a `Node` element, stamped with
    /// the node's create time.
    pub fn to_data_object(&self, storage_dir: impl AsRef<Path>) -> Result<DataObject> {
        let mut dobj = DataObject::new(storage_dir.as_ref());

        let node_md = dobj.metadata_mut().add_child(Metadata::new(NODE_ELEMENT));
        node_md.set_parameter(NODE_ID_PARAM, self.id.to_string());
        node_md.set_parameter(NODE_NAME_PARAM, &self.name);
        node_md.set_parameter(NODE_THRESHOLD_PARAM, self.matching_threshold.to_string());
        node_md.set_parameter(NODE_MAX_MATCHES_PARAM, self.max_matches.to_string());
        let _ = node_md.add_child(Metadata::with_content(
            BLOOMFILTER_ELEMENT,
            self.bloomfilter.to_base64(),
        ));
        for iface in &self.interfaces {
            let imd = node_md.add_child(Metadata::new(INTERFACE_ELEMENT));
            imd.set_parameter(INTERFACE_TYPE_PARAM, iface.iface_type().to_string());
            imd.set_parameter(INTERFACE_IDENTIFIER_PARAM, iface.identifier_str());
            for addr in iface.addresses() {
                let _ = imd.add_child(Metadata::with_content(ADDRESS_ELEMENT, addr.to_string()));
            }
        }

        let _ = dobj.add_attribute(Attribute::new(NODE_DESC_ATTR, self.id.to_string()));
        for interest in &self.interests {
            let _ = dobj.add_attribute(interest.clone());
        }
        dobj.set_create_time(self.create_time.unwrap_or_else(Timestamp::now));

        Ok(dobj)
    }

    /// Rebuilds a peer node from a received node description.
    pub fn from_data_object(dobj: &DataObject) -> Result<Self> {
        let desc = dobj
            .attributes()
            .first_by_name(NODE_DESC_ATTR)
            .ok_or(Error::NotANodeDescription)?;
        let id: NodeId = desc
            .value()
            .parse()
            .map_err(|_| Error::NotANodeDescription)?;

        let mut node = Node::new(NodeType::Peer).with_id(id);
        node.create_time = dobj.create_time();

        for attr in dobj.attributes().iter() {
            if attr.name() != NODE_DESC_ATTR {
                let _ = node.interests.add(attr.clone());
            }
        }

        if let Some(node_md) = dobj.metadata().child(NODE_ELEMENT) {
            if let Some(name) = node_md.parameter(NODE_NAME_PARAM) {
                node.name = name.to_string();
            }
            if let Some(threshold) = node_md.parameter(NODE_THRESHOLD_PARAM) {
                node.matching_threshold = threshold.parse().map_err(|_| {
                    Error::MetadataParse(format!("bad matching threshold {threshold:?}"))
                })?;
            }
            if let Some(max) = node_md.parameter(NODE_MAX_MATCHES_PARAM) {
                node.max_matches = max
                    .parse()
                    .map_err(|_| Error::MetadataParse(format!("bad max matches {max:?}")))?;
            }
            if let Some(bf) = node_md.child(BLOOMFILTER_ELEMENT) {
                node.bloomfilter = Bloomfilter::from_base64(bf.content().unwrap_or_default())?;
            }
            for imd in node_md.children_named(INTERFACE_ELEMENT) {
                let iface_type: InterfaceType = imd
                    .parameter(INTERFACE_TYPE_PARAM)
                    .unwrap_or("undefined")
                    .parse()?;
                let identifier = hex::decode(
                    imd.parameter(INTERFACE_IDENTIFIER_PARAM).unwrap_or_default(),
                )
                .map_err(|e| Error::MetadataParse(format!("bad interface identifier: {e}")))?;
                let mut iface = Interface::new(iface_type, identifier);
                for addr in imd.children_named(ADDRESS_ELEMENT) {
                    if let Some(content) = addr.content() {
                        if let Ok(sock) = content.parse() {
                            iface.add_address(crate::interface::Address::Socket(sock));
                        }
                    }
                }
                node.add_interface(iface);
            }
            // Interests may also be listed under the Node element.
            for mattr in node_md.children_named(crate::data_object::ATTR_ELEMENT) {
                if let Some(name) = mattr.parameter(crate::data_object::ATTR_NAME_PARAM) {
                    let weight = mattr
                        .parameter(crate::data_object::ATTR_WEIGHT_PARAM)
                        .and_then(|w| w.parse().ok())
                        .unwrap_or(crate::attribute::ATTR_WEIGHT_DEFAULT);
                    let _ = node.interests.add(Attribute::with_weight(
                        name,
                        mattr.content().unwrap_or_default(),
                        weight,
                    ));
                }
            }
        }

        Ok(node)
    }
}

impl Display for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}[{:?}]", self.node_type, self.id)
        } else {
            write!(f, "{}[{}]", self.node_type, self.name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    fn sample_node() -> Node {
        let mut node = Node::new(NodeType::Peer).with_name("alice");
        let _ = node.add_interest(Attribute::with_weight("Topic", "Weather", 3));
        let _ = node.add_interest(Attribute::new("Topic", "News"));
        node.set_matching_threshold(50);
        node.set_max_matches(2);
        node.add_interface(
            Interface::new(InterfaceType::Ethernet, vec![0xaa, 0xbb]).with_address(
                crate::Address::Socket("10.0.0.2:9697".parse().expect("addr")),
            ),
        );
        node.set_create_time("1700000000.000000".parse().expect("timestamp"));
        node.bloomfilter_mut().add(b"some seen id");
        node
    }

    #[test]
    fn description_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let node = sample_node();

        let dobj = node.to_data_object(dir.path())?;
        assert!(dobj.is_node_description());

        // Over the wire and back.
        let received = DataObject::from_raw(&dobj.to_wire(), dir.path())?;
        let rebuilt = Node::from_data_object(&received)?;

        assert_eq!(rebuilt.id(), node.id());
        assert_eq!(rebuilt.name(), "alice");
        assert_eq!(rebuilt.interests(), node.interests());
        assert_eq!(rebuilt.matching_threshold(), 50);
        assert_eq!(rebuilt.max_matches(), 2);
        assert_eq!(rebuilt.create_time(), node.create_time());
        assert!(rebuilt.bloomfilter().check(b"some seen id"));
        assert_eq!(rebuilt.interfaces().len(), 1);
        assert!(rebuilt.interfaces()[0].socket_address().is_some());
        Ok(())
    }

    #[test]
    fn not_a_description_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut dobj = DataObject::new(dir.path());
        let _ = dobj.add_attribute(Attribute::new("Topic", "Weather"));
        assert!(matches!(
            Node::from_data_object(&dobj),
            Err(Error::NotANodeDescription)
        ));
        Ok(())
    }

    #[test]
    fn interface_identity_drives_id() {
        let mut a = Node::new(NodeType::Peer);
        a.add_interface(Interface::new(InterfaceType::Ethernet, vec![1, 2]));
        a.add_interface(Interface::new(InterfaceType::Wifi, vec![3, 4]));
        a.calc_id_from_interfaces();

        // Same interfaces in a different order yield the same id.
        let mut b = Node::new(NodeType::Peer);
        b.add_interface(Interface::new(InterfaceType::Wifi, vec![3, 4]));
        b.add_interface(Interface::new(InterfaceType::Ethernet, vec![1, 2]));
        b.calc_id_from_interfaces();
        assert_eq!(a.id(), b.id());

        let mut c = Node::new(NodeType::Peer);
        c.add_interface(Interface::new(InterfaceType::Ethernet, vec![9, 9]));
        c.calc_id_from_interfaces();
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn availability_follows_interface_state() {
        let mut node = Node::new(NodeType::Peer);
        let iface = Interface::new(InterfaceType::Ethernet, vec![1]);
        node.add_interface(iface.clone());
        assert!(!node.is_available());

        assert!(node.set_interface_up(&iface, true));
        assert!(node.is_available());

        assert!(node.set_interface_up(&iface, false));
        assert!(!node.is_available());
    }
}
