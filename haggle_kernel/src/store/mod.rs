// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Shared in-memory entity stores.
//!
//! Nodes, interfaces and data objects are shared mutable values held behind
//! per-object locks; the stores themselves are internally synchronized.
//! Handlers take the per-object lock only around compound read/modify steps
//! and never hold a store lock across an event post.

mod interface_store;
mod node_store;

pub use interface_store::{InterfaceStore, LifetimePolicy};
pub use node_store::NodeStore;

use haggle_protocol::{DataObject, Interface, Node};
use std::sync::{Arc, RwLock};

pub type NodeRef = Arc<RwLock<Node>>;
pub type InterfaceRef = Arc<RwLock<Interface>>;
pub type DataObjectRef = Arc<RwLock<DataObject>>;

pub fn new_node_ref(node: Node) -> NodeRef {
    Arc::new(RwLock::new(node))
}

pub fn new_interface_ref(iface: Interface) -> InterfaceRef {
    Arc::new(RwLock::new(iface))
}

pub fn new_data_object_ref(dobj: DataObject) -> DataObjectRef {
    Arc::new(RwLock::new(dobj))
}

/// Poison-tolerant lock helpers: a panicking handler must not wedge every
/// other holder of the object.
pub(crate) fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}
