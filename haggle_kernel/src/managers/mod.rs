// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The long-lived managers driven by the kernel event loop.
//!
//! Managers are leaves: they never call each other, only post events and
//! read the shared stores. Each handler runs on the kernel task and must
//! not block; anything long goes to a worker.

pub(crate) mod connectivity;
pub(crate) mod data_manager;
pub(crate) mod forwarder;
pub(crate) mod forwarding;
pub(crate) mod node_manager;
pub(crate) mod protocol;

/// Number of managers that must report ready before shutdown proceeds.
pub(crate) const MANAGER_COUNT: usize = 5;
