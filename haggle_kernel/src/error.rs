// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    #[error(transparent)]
    Protocol(#[from] haggle_protocol::Error),

    #[error(transparent)]
    Sql(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("The data store worker is gone")]
    DataStoreClosed,

    #[error("The kernel event queue is gone")]
    EventQueueClosed,

    #[error("The forwarder worker is gone")]
    ForwarderClosed,

    #[error("Node {0} has no usable interface to send over")]
    NoRouteToNode(String),

    #[error("Send of {data_object} to {node} timed out")]
    SendTimeout { data_object: String, node: String },

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Serialized state is not valid: {0}")]
    BadSaveState(#[from] serde_json::Error),
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::EventQueueClosed
    }
}
