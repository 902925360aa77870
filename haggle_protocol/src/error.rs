// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    #[error("Malformed metadata: {0}")]
    MetadataParse(String),

    #[error("Metadata root is {got:?}, expected {expected:?}")]
    UnexpectedRoot { expected: String, got: String },

    #[error("Malformed bloomfilter: {0}")]
    BloomfilterParse(String),

    #[error("Remove is only defined for counting bloomfilters")]
    BloomfilterNotCounting,

    #[error("Invalid identifier {0:?}, expected 40 hex chars")]
    InvalidId(String),

    #[error("Invalid timestamp {0:?}")]
    InvalidTimestamp(String),

    #[error("Data object has no payload file")]
    NoPayloadFile,

    #[error("Ingest already failed or completed")]
    IngestFinished,

    #[error("Could not create a unique payload file under {0:?}")]
    PayloadFileCollision(PathBuf),

    #[error("Node description is missing the NodeDescription attribute")]
    NotANodeDescription,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
