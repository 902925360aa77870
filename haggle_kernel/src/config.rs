// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use std::path::PathBuf;
use std::time::Duration;

/// Port peers listen on for TCP contacts.
pub const TCP_DEFAULT_PORT: u16 = 9697;

/// RFCOMM channel advertised for Bluetooth contacts. A parameter for the
/// link-specific discoverers, not a behavior of the engine.
pub const RFCOMM_DEFAULT_CHANNEL: u8 = 7;

/// 128-bit service UUID the service is advertised under in SDP records.
pub const HAGGLE_SERVICE_UUID: [u8; 16] = [
    0x97, 0x97, 0x26, 0x16, 0x1a, 0x4f, 0x4e, 0x3e, 0x8d, 0x7c, 0x60, 0x4a, 0x55, 0x1f, 0x9a,
    0x0d,
];

/// Tunables of one engine instance.
#[derive(Clone, Debug)]
pub struct KernelConfig {
    /// Where payload files and the data store database live.
    pub storage_dir: PathBuf,
    /// Database file name inside `storage_dir`.
    pub datastore_file: String,
    /// Human-readable name of this node.
    pub node_name: String,
    /// Default cap on data objects per match query (0 = unbounded).
    pub max_matches: u32,
    /// Default minimum match ratio (percent) for delivery to this node.
    pub matching_threshold: u32,
    /// Bloom filter sizing for this node and fresh peers.
    pub bloomfilter_error_rate: f64,
    pub bloomfilter_capacity: u32,
    /// Per-send timeout on a protocol contact.
    pub send_timeout: Duration,
    /// Bounded attempts for one send before a failure event is posted.
    pub max_send_retries: u32,
    /// Bounded re-queues of a (data object, node) pair after send failures.
    pub max_forwarding_retries: u32,
    /// How often the data manager triggers an aging pass.
    pub aging_interval: Duration,
    /// Minimum age before an unmatched persistent data object may be aged out.
    pub aging_max_age: Duration,
    /// Payload size above which verification is pushed off the kernel thread.
    pub verify_offload_threshold: u64,
    /// TCP listen port.
    pub tcp_port: u16,
}

impl KernelConfig {
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            datastore_file: "haggle.db".to_string(),
            node_name: "haggle-node".to_string(),
            max_matches: 10,
            matching_threshold: 0,
            bloomfilter_error_rate: haggle_protocol::DEFAULT_BLOOMFILTER_ERROR_RATE,
            bloomfilter_capacity: haggle_protocol::DEFAULT_BLOOMFILTER_CAPACITY,
            send_timeout: Duration::from_secs(60),
            max_send_retries: 3,
            max_forwarding_retries: 3,
            aging_interval: Duration::from_secs(600),
            aging_max_age: Duration::from_secs(24 * 3600),
            verify_offload_threshold: 64 * 1024,
            tcp_port: TCP_DEFAULT_PORT,
        }
    }

    pub fn datastore_path(&self) -> PathBuf {
        self.storage_dir.join(&self.datastore_file)
    }
}
