// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Domain types and wire codecs for the Haggle core.
//!
//! A *data object* is the atom of exchange: a weighted attribute set plus an
//! optional payload file, content-addressed by SHA-1. Data objects travel as a
//! metadata header followed back-to-back by the raw payload bytes. This crate
//! holds the data object model (identity, streaming ingest and egress,
//! verification), the attribute and metadata containers the header is built
//! from, the bloom filters nodes use for duplicate suppression, and the node
//! and interface records that feed the matching engine.
//!
//! Nothing in here is async or stateful beyond the individual values; the
//! engine that wires these types together lives in `haggle_kernel`.

#[macro_use]
extern crate tracing;

mod attribute;
mod bloomfilter;
mod data_object;
mod error;
mod id;
mod interface;
mod metadata;
mod node;
mod timestamp;

pub use self::{
    attribute::{Attribute, Attributes, ATTR_WEIGHT_DEFAULT, ATTR_WEIGHT_NO_MATCH, ATTR_WILDCARD},
    bloomfilter::{Bloomfilter, DEFAULT_BLOOMFILTER_CAPACITY, DEFAULT_BLOOMFILTER_ERROR_RATE},
    data_object::{
        DataObject, DataObjectIngest, DataObjectRetriever, DataState, PutData, SignatureStatus,
    },
    error::{Error, Result},
    id::{DataObjectId, NodeId, ID_LEN},
    interface::{Address, Interface, InterfaceType},
    metadata::{find_header_end, Metadata, HAGGLE_ROOT_NAME},
    node::{Node, NodeType, NODE_DESC_ATTR},
    timestamp::Timestamp,
};
