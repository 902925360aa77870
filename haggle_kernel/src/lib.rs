// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The Haggle coordination engine.
//!
//! A single kernel task owns a deadline-ordered event queue and dispatches
//! each due event to a fixed set of managers. Managers never call each other;
//! they interact by posting events and by reading the shared interface and
//! node stores. Long or blocking work runs on workers fed over channels: the
//! SQLite-backed data store has its own thread, each peer contact is served
//! by its own protocol task, discovery runs one cancelable task per local
//! interface, and an expensive forwarder can be pushed onto its own worker.
//!
//! Delivery emerges from the pieces in here: the data store ranks stored
//! data objects against a node's weighted interests, bloom filters suppress
//! what a peer has already seen, and the forwarding manager turns contact
//! and query events into per-contact send queues.

#[macro_use]
extern crate tracing;

mod config;
mod datastore;
mod error;
mod event;
mod filter;
mod kernel;
mod managers;
mod store;

pub use self::{
    config::{KernelConfig, HAGGLE_SERVICE_UUID, RFCOMM_DEFAULT_CHANNEL, TCP_DEFAULT_PORT},
    datastore::{DataStoreHandle, RepositoryEntry},
    error::{Error, Result},
    event::{Event, EventSender, FilterEventId, KernelEventsChannel, FILTER_EVENT_ID_BASE},
    filter::Filter,
    kernel::{Kernel, KernelBuilder, KernelHandle},
    managers::{
        connectivity::{Discoverer, DiscovererContext, DiscovererFactory, HaggleStatus},
        forwarder::{AsyncForwarder, Forwarder, ForwarderModule, ForwarderRank, ForwardingTask},
        protocol::{MemoryConnector, ProtocolTransport, TcpConnector, TransportConnector},
    },
    store::{
        new_data_object_ref, new_interface_ref, new_node_ref, DataObjectRef, InterfaceRef,
        InterfaceStore, LifetimePolicy, NodeRef, NodeStore,
    },
};
