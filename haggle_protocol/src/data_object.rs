// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::{
    attribute::{Attribute, Attributes, ATTR_WEIGHT_DEFAULT},
    error::{Error, Result},
    id::{DataObjectId, ID_LEN},
    interface::Interface,
    metadata::{find_header_end, Metadata, HAGGLE_ROOT_NAME},
    node::NODE_DESC_ATTR,
    timestamp::Timestamp,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha1::{Digest, Sha1};
use std::{
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
};

pub(crate) const ATTR_ELEMENT: &str = "Attr";
pub(crate) const ATTR_NAME_PARAM: &str = "name";
pub(crate) const ATTR_WEIGHT_PARAM: &str = "weight";
pub(crate) const DATA_ELEMENT: &str = "Data";
pub(crate) const DATA_LEN_PARAM: &str = "data_len";
pub(crate) const FILE_NAME_ELEMENT: &str = "FileName";
pub(crate) const FILE_PATH_ELEMENT: &str = "FilePath";
pub(crate) const FILE_HASH_ELEMENT: &str = "FileHash";
pub(crate) const SIGNATURE_ELEMENT: &str = "Signature";
pub(crate) const SIGNEE_PARAM: &str = "signee";
pub(crate) const PERSISTENT_PARAM: &str = "persistent";
pub(crate) const CREATE_TIME_PARAM: &str = "create_time";

/// Read/hash block size for payload verification.
const VERIFY_BLOCK_SIZE: usize = 4096;

/// Upper bound when probing for a free payload file name.
const MAX_FILENAME_COLLISIONS: u32 = 10_000;

/// Verification state of a data object's payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataState {
    NoData,
    NotVerified,
    VerifiedOk,
    VerifiedBad,
}

/// Verification state of a data object's signature.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignatureStatus {
    Missing,
    Unverified,
    Valid,
    Invalid,
}

impl SignatureStatus {
    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => Self::Unverified,
            2 => Self::Valid,
            3 => Self::Invalid,
            _ => Self::Missing,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::Missing => 0,
            Self::Unverified => 1,
            Self::Valid => 2,
            Self::Invalid => 3,
        }
    }
}

/// The atom of exchange: a weighted attribute set with an optional payload
/// file, content-addressed by SHA-1.
///
/// The id is a pure function of (attributes, create time, payload
/// fingerprint); every mutation of those fields recomputes it. A data object
/// owns its payload file only when it created the file itself (streaming
/// ingest); clones never own, so dropping a clone cannot delete data out from
/// under the original.
#[derive(Debug)]
pub struct DataObject {
    id: DataObjectId,
    attributes: Attributes,
    /// Base metadata tree. Foreign elements added by other components (e.g.
    /// the `Node` element of a node description) are preserved here and
    /// survive the round trip; the known elements are re-projected from the
    /// typed fields on serialization.
    metadata: Metadata,
    create_time: Option<Timestamp>,
    receive_time: Option<Timestamp>,
    persistent: bool,
    duplicate: bool,
    is_node_description: bool,
    is_for_local_app: bool,
    signature: Option<Vec<u8>>,
    signee: Option<String>,
    signature_status: SignatureStatus,
    file_name: Option<String>,
    file_path: Option<PathBuf>,
    data_len: u64,
    data_hash: Option<[u8; ID_LEN]>,
    data_state: DataState,
    owns_file: bool,
    local_interface: Option<Interface>,
    remote_interface: Option<Interface>,
    storage_dir: PathBuf,
}

impl DataObject {
    /// An empty data object for local publishing.
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        let mut dobj = Self {
            id: DataObjectId::default(),
            attributes: Attributes::new(),
            metadata: Metadata::new(HAGGLE_ROOT_NAME),
            create_time: None,
            receive_time: None,
            persistent: true,
            duplicate: false,
            is_node_description: false,
            is_for_local_app: false,
            signature: None,
            signee: None,
            signature_status: SignatureStatus::Missing,
            file_name: None,
            file_path: None,
            data_len: 0,
            data_hash: None,
            data_state: DataState::NoData,
            owns_file: false,
            local_interface: None,
            remote_interface: None,
            storage_dir: storage_dir.into(),
        };
        dobj.calc_id();
        dobj
    }

    /// Builds a data object from a fully materialized metadata buffer.
    pub fn from_raw(raw: &[u8], storage_dir: impl Into<PathBuf>) -> Result<Self> {
        let metadata = Metadata::parse_header(raw)?;
        let mut dobj = Self::new(storage_dir);
        dobj.metadata = metadata;
        dobj.parse_metadata()?;
        Ok(dobj)
    }

    /// Starts a streaming ingest from a network contact; feed the raw byte
    /// stream through [`DataObjectIngest::put_data`].
    pub fn ingest(
        storage_dir: impl Into<PathBuf>,
        local_interface: Option<Interface>,
        remote_interface: Option<Interface>,
    ) -> DataObjectIngest {
        DataObjectIngest {
            storage_dir: storage_dir.into(),
            local_interface,
            remote_interface,
            header: Vec::new(),
            object: None,
            file: None,
            bytes_left: 0,
            failed: false,
        }
    }

    pub fn id(&self) -> DataObjectId {
        self.id
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Adds an attribute, de-duplicating by (name, value) regardless of
    /// weight, and recomputes the id on change.
    pub fn add_attribute(&mut self, attr: Attribute) -> bool {
        if self
            .attributes
            .contains_name_value(attr.name(), attr.value())
        {
            return false;
        }
        if attr.name() == NODE_DESC_ATTR {
            self.is_node_description = true;
        }
        let added = self.attributes.add(attr);
        self.calc_id();
        added
    }

    /// Removes attributes by (name, value); value `*` removes all with the
    /// name. Recomputes the id when anything went.
    pub fn remove_attribute(&mut self, name: &str, value: &str) -> usize {
        let n = self.attributes.remove_matching(name, value);
        if n > 0 {
            self.calc_id();
        }
        n
    }

    pub fn create_time(&self) -> Option<Timestamp> {
        self.create_time
    }

    pub fn set_create_time(&mut self, t: Timestamp) {
        self.create_time = Some(t);
        self.calc_id();
    }

    pub fn receive_time(&self) -> Option<Timestamp> {
        self.receive_time
    }

    pub fn set_receive_time(&mut self, t: Timestamp) {
        self.receive_time = Some(t);
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn set_persistent(&mut self, persistent: bool) {
        self.persistent = persistent;
    }

    pub fn is_duplicate(&self) -> bool {
        self.duplicate
    }

    pub fn mark_duplicate(&mut self) {
        self.duplicate = true;
    }

    pub fn is_node_description(&self) -> bool {
        self.is_node_description
    }

    pub fn is_for_local_app(&self) -> bool {
        self.is_for_local_app
    }

    /// Marks the object as destined for a local application; only then is
    /// the local `FilePath` emitted in the metadata.
    pub fn set_for_local_app(&mut self, val: bool) {
        self.is_for_local_app = val;
    }

    pub fn signature(&self) -> Option<&[u8]> {
        self.signature.as_deref()
    }

    pub fn signee(&self) -> Option<&str> {
        self.signee.as_deref()
    }

    pub fn signature_status(&self) -> SignatureStatus {
        self.signature_status
    }

    pub fn set_signature(&mut self, signee: impl Into<String>, signature: Vec<u8>) {
        self.signee = Some(signee.into());
        self.signature = Some(signature);
        self.signature_status = SignatureStatus::Unverified;
    }

    pub fn set_signature_status(&mut self, status: SignatureStatus) {
        self.signature_status = status;
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    pub fn data_len(&self) -> u64 {
        self.data_len
    }

    pub fn data_hash(&self) -> Option<&[u8; ID_LEN]> {
        self.data_hash.as_ref()
    }

    pub fn data_state(&self) -> DataState {
        self.data_state
    }

    pub fn owns_file(&self) -> bool {
        self.owns_file
    }

    /// Transfers payload file ownership onto this object; it will delete the
    /// file when dropped.
    pub fn take_file_ownership(&mut self) {
        self.owns_file = true;
    }

    /// Releases payload file ownership (e.g. once the data store has taken
    /// responsibility for the file's lifetime).
    pub fn release_file_ownership(&mut self) {
        self.owns_file = false;
    }

    pub fn local_interface(&self) -> Option<&Interface> {
        self.local_interface.as_ref()
    }

    pub fn set_local_interface(&mut self, iface: Interface) {
        self.local_interface = Some(iface);
    }

    pub fn remote_interface(&self) -> Option<&Interface> {
        self.remote_interface.as_ref()
    }

    pub fn set_remote_interface(&mut self, iface: Interface) {
        self.remote_interface = Some(iface);
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Attaches a local payload file for publishing. The length is read from
    /// disk; the file is referenced, never owned.
    pub fn set_file(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        let len = fs::metadata(&path)?.len();
        self.file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        self.file_path = Some(path);
        self.data_len = len;
        self.data_state = DataState::NotVerified;
        self.owns_file = false;
        self.calc_id();
        Ok(())
    }

    pub fn set_data_hash(&mut self, hash: [u8; ID_LEN]) {
        self.data_hash = Some(hash);
        if self.data_len > 0 {
            self.data_state = DataState::NotVerified;
        }
        self.calc_id();
    }

    /// Restores fields that only live in the data store row, not in the wire
    /// header (used when rebuilding an object from persistence).
    pub fn restore_payload(&mut self, file_path: Option<PathBuf>, file_name: Option<String>) {
        if let Some(name) = file_name {
            self.file_name = Some(name);
        }
        if let Some(path) = file_path {
            self.data_state = DataState::NotVerified;
            self.file_path = Some(path);
        }
        self.owns_file = false;
        self.calc_id();
    }

    /// Base metadata tree carrying any foreign elements.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    /// Projects the typed fields into the metadata tree.
    pub fn to_metadata(&self) -> Metadata {
        let mut md = self.metadata.clone();

        md.set_parameter(PERSISTENT_PARAM, if self.persistent { "yes" } else { "no" });
        if let Some(t) = self.create_time {
            md.set_parameter(CREATE_TIME_PARAM, t.to_string());
        }

        if self.data_len > 0 || self.data_hash.is_some() {
            if md.child(DATA_ELEMENT).is_none() {
                let _ = md.add_child(Metadata::new(DATA_ELEMENT));
            }
            let data = md.child_mut(DATA_ELEMENT).expect("just ensured");
            data.set_parameter(DATA_LEN_PARAM, self.data_len.to_string());

            let _ = data.remove_children(FILE_PATH_ELEMENT);
            if self.is_for_local_app {
                if let Some(path) = &self.file_path {
                    let _ = data.add_child(Metadata::with_content(
                        FILE_PATH_ELEMENT,
                        path.to_string_lossy(),
                    ));
                }
            }
            if let Some(name) = &self.file_name {
                match data.child_mut(FILE_NAME_ELEMENT) {
                    Some(fnm) => fnm.set_content(name),
                    None => {
                        let _ = data.add_child(Metadata::with_content(FILE_NAME_ELEMENT, name));
                    }
                }
            }
            if let Some(hash) = &self.data_hash {
                let b64 = STANDARD.encode(hash);
                match data.child_mut(FILE_HASH_ELEMENT) {
                    Some(fhm) => fhm.set_content(&b64),
                    None => {
                        let _ = data.add_child(Metadata::with_content(FILE_HASH_ELEMENT, &b64));
                    }
                }
            }
        }

        if let (Some(signature), Some(signee)) = (&self.signature, &self.signee) {
            let b64 = STANDARD.encode(signature);
            match md.child_mut(SIGNATURE_ELEMENT) {
                Some(ms) => ms.set_content(&b64),
                None => {
                    let _ = md.add_child(Metadata::with_content(SIGNATURE_ELEMENT, &b64));
                }
            }
            let ms = md.child_mut(SIGNATURE_ELEMENT).expect("just ensured");
            ms.set_parameter(SIGNEE_PARAM, signee);
        }

        // Sync attributes by wiping the existing Attr elements and re-adding
        // from the container.
        let _ = md.remove_children(ATTR_ELEMENT);
        for attr in &self.attributes {
            let element = md.add_child(Metadata::with_content(ATTR_ELEMENT, attr.value()));
            element.set_parameter(ATTR_NAME_PARAM, attr.name());
            if attr.weight() != ATTR_WEIGHT_DEFAULT {
                element.set_parameter(ATTR_WEIGHT_PARAM, attr.weight().to_string());
            }
        }

        md
    }

    /// Serialized metadata header, ready to precede the payload on the wire.
    pub fn to_wire(&self) -> Vec<u8> {
        self.to_metadata().to_wire()
    }

    /// Fills in the typed fields from the metadata tree.
    fn parse_metadata(&mut self) -> Result<()> {
        if let Some(pval) = self.metadata.parameter(PERSISTENT_PARAM) {
            self.persistent = pval != "no";
        }

        if let Some(ct) = self.metadata.parameter(CREATE_TIME_PARAM) {
            self.create_time = Some(ct.parse()?);
        }

        if let Some(sm) = self.metadata.child(SIGNATURE_ELEMENT) {
            let content = sm.content().unwrap_or_default();
            let signature = STANDARD
                .decode(content)
                .map_err(|e| Error::MetadataParse(format!("bad signature base64: {e}")))?;
            self.signee = sm.parameter(SIGNEE_PARAM).map(str::to_string);
            self.signature = Some(signature);
            self.signature_status = SignatureStatus::Unverified;
        }

        if let Some(dm) = self.metadata.child(DATA_ELEMENT) {
            if let Some(len) = dm.parameter(DATA_LEN_PARAM) {
                self.data_len = len
                    .parse()
                    .map_err(|_| Error::MetadataParse(format!("bad data_len {len:?}")))?;
                if self.data_len > 0 {
                    self.data_state = DataState::NotVerified;
                }
            }

            if let Some(m) = dm.child(FILE_NAME_ELEMENT) {
                self.file_name = m.content().map(str::to_string);
            }

            // A FilePath element only makes sense for locally published
            // objects whose payload already sits on this host; a remote
            // sender's path is meaningless here and gets stripped.
            if let Some(m) = dm.child(FILE_PATH_ELEMENT) {
                let path = PathBuf::from(m.content().unwrap_or_default());
                if let Ok(md) = fs::metadata(&path) {
                    self.data_len = md.len();
                    self.file_name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned());
                    self.file_path = Some(path);
                    self.data_state = DataState::NotVerified;
                } else {
                    trace!("data object file {path:?} does not exist (yet)");
                }
            }

            if let Some(m) = dm.child(FILE_HASH_ELEMENT) {
                let content = m.content().unwrap_or_default();
                let hash = STANDARD
                    .decode(content)
                    .map_err(|e| Error::MetadataParse(format!("bad file hash base64: {e}")))?;
                let hash: [u8; ID_LEN] = hash.try_into().map_err(|_| {
                    Error::MetadataParse("file hash is not 20 bytes".to_string())
                })?;
                self.data_hash = Some(hash);
                if self.data_len > 0 {
                    self.data_state = DataState::NotVerified;
                }
            }
        }
        // The local path never travels onwards.
        if let Some(dm) = self.metadata.child_mut(DATA_ELEMENT) {
            let _ = dm.remove_children(FILE_PATH_ELEMENT);
        }

        for mattr in self.metadata.children_named(ATTR_ELEMENT) {
            let name = mattr.parameter(ATTR_NAME_PARAM).ok_or_else(|| {
                Error::MetadataParse("Attr element without a name parameter".to_string())
            })?;
            let weight = match mattr.parameter(ATTR_WEIGHT_PARAM) {
                Some(w) => w
                    .parse()
                    .map_err(|_| Error::MetadataParse(format!("bad weight {w:?}")))?,
                None => ATTR_WEIGHT_DEFAULT,
            };
            let attr = Attribute::with_weight(name, mattr.content().unwrap_or_default(), weight);

            if attr.name() == NODE_DESC_ATTR {
                self.is_node_description = true;
            }
            if !self
                .attributes
                .contains_name_value(attr.name(), attr.value())
            {
                let _ = self.attributes.add(attr);
            }
        }

        self.calc_id();
        Ok(())
    }

    /// Recomputes the content-derived id.
    ///
    /// The hash covers the sorted attribute triples, the creation time
    /// string if present, and the payload fingerprint: the payload hash when
    /// known, otherwise (filename, data length as big-endian u64). Two
    /// publishers producing the same attributes and payload therefore yield
    /// the same id, on any platform.
    fn calc_id(&mut self) {
        let mut hasher = Sha1::new();

        for attr in &self.attributes {
            hasher.update(attr.name().as_bytes());
            hasher.update(attr.value().as_bytes());
            hasher.update(attr.weight().to_be_bytes());
        }

        if let Some(create_time) = self.create_time {
            hasher.update(create_time.to_string().as_bytes());
        }

        if let Some(hash) = &self.data_hash {
            hasher.update(hash);
        } else if let Some(file_name) = &self.file_name {
            if self.data_len > 0 {
                hasher.update(file_name.as_bytes());
                hasher.update(self.data_len.to_be_bytes());
            }
        }

        self.id = DataObjectId::new(hasher.finalize().into());
    }

    /// Streams the payload through SHA-1 and compares against the carried
    /// hash. Idempotent: an already verified (good or bad) object returns its
    /// state without re-reading the file. A missing hash leaves the object
    /// `NotVerified` for the caller's policy to handle.
    pub fn verify_data(&mut self) -> Result<DataState> {
        if self.data_len == 0 {
            return Ok(DataState::NoData);
        }
        let expected = match self.data_hash {
            Some(hash) => hash,
            None => return Ok(DataState::NotVerified),
        };
        if matches!(
            self.data_state,
            DataState::VerifiedOk | DataState::VerifiedBad
        ) {
            return Ok(self.data_state);
        }

        let path = self.file_path.as_ref().ok_or(Error::NoPayloadFile)?;
        let mut file = File::open(path)?;
        let mut hasher = Sha1::new();
        let mut block = [0u8; VERIFY_BLOCK_SIZE];
        loop {
            let n = file.read(&mut block)?;
            if n == 0 {
                break;
            }
            hasher.update(&block[..n]);
        }
        let digest: [u8; ID_LEN] = hasher.finalize().into();

        self.data_state = if digest == expected {
            DataState::VerifiedOk
        } else {
            warn!(
                "payload hash mismatch for data object {}, marking bad",
                self.id
            );
            DataState::VerifiedBad
        };
        Ok(self.data_state)
    }

    /// Opens the object for egress: serialized header first, then the
    /// payload stream.
    pub fn retriever(&self) -> Result<DataObjectRetriever> {
        DataObjectRetriever::new(self)
    }
}

// A clone is a reference copy of the content: it never owns the payload file
// and carries no duplicate mark of its own.
impl Clone for DataObject {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            attributes: self.attributes.clone(),
            metadata: self.metadata.clone(),
            create_time: self.create_time,
            receive_time: self.receive_time,
            persistent: self.persistent,
            duplicate: false,
            is_node_description: self.is_node_description,
            is_for_local_app: self.is_for_local_app,
            signature: self.signature.clone(),
            signee: self.signee.clone(),
            signature_status: self.signature_status,
            file_name: self.file_name.clone(),
            file_path: self.file_path.clone(),
            data_len: self.data_len,
            data_hash: self.data_hash,
            data_state: self.data_state,
            owns_file: false,
            local_interface: self.local_interface.clone(),
            remote_interface: self.remote_interface.clone(),
            storage_dir: self.storage_dir.clone(),
        }
    }
}

impl Drop for DataObject {
    fn drop(&mut self) {
        if self.owns_file {
            if let Some(path) = &self.file_path {
                if let Err(err) = fs::remove_file(path) {
                    trace!("could not remove payload file {path:?}: {err}");
                }
            }
        }
    }
}

/// Outcome of one [`DataObjectIngest::put_data`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PutData {
    /// Bytes of the input chunk that were consumed.
    pub consumed: usize,
    /// Payload bytes still expected; `None` while the header is incomplete.
    pub remaining: Option<u64>,
}

/// Streaming construction of a data object from a byte stream.
///
/// Bytes are buffered until the closing root tag of the metadata is seen,
/// the header is then parsed, and any remaining bytes are written to a
/// freshly created payload file until `data_len` is reached. Parse or write
/// errors are fatal to the ingest; the partial payload file is removed.
#[derive(Debug)]
pub struct DataObjectIngest {
    storage_dir: PathBuf,
    local_interface: Option<Interface>,
    remote_interface: Option<Interface>,
    header: Vec<u8>,
    object: Option<DataObject>,
    file: Option<File>,
    bytes_left: u64,
    failed: bool,
}

impl DataObjectIngest {
    /// Feeds a chunk of the incoming stream. Returns how much of the chunk
    /// was consumed and how many payload bytes are still expected. Bytes
    /// beyond the end of this data object are left unconsumed for the
    /// caller (the next object on the session starts there).
    pub fn put_data(&mut self, data: &[u8]) -> Result<PutData> {
        if self.failed {
            return Err(Error::IngestFinished);
        }
        if self.is_complete() {
            return Ok(PutData {
                consumed: 0,
                remaining: Some(0),
            });
        }

        let mut consumed = 0;

        if self.object.is_none() {
            // Header phase. Resume the terminator scan a window short of the
            // previous end so a terminator split across chunks is still found.
            let scan_from = self.header.len().saturating_sub(8);
            self.header.extend_from_slice(data);

            let end = match find_header_end(&self.header[scan_from..]) {
                Some(rel) => scan_from + rel,
                None => {
                    return Ok(PutData {
                        consumed: data.len(),
                        remaining: None,
                    })
                }
            };

            let chunk_start = self.header.len() - data.len();
            consumed = end - chunk_start;
            self.header.truncate(end);

            let mut object = match DataObject::from_raw(&self.header, &self.storage_dir) {
                Ok(object) => object,
                Err(err) => {
                    self.failed = true;
                    return Err(err);
                }
            };
            object.local_interface = self.local_interface.clone();
            object.remote_interface = self.remote_interface.clone();

            self.bytes_left = object.data_len();

            if self.bytes_left == 0 {
                object.set_receive_time(Timestamp::now());
                self.object = Some(object);
                return Ok(PutData {
                    consumed,
                    remaining: Some(0),
                });
            }

            match self.open_payload_file(&mut object) {
                Ok(file) => self.file = Some(file),
                Err(err) => {
                    self.failed = true;
                    return Err(err);
                }
            }
            object.data_state = DataState::NotVerified;
            self.object = Some(object);
        }

        // Payload phase.
        let rest = &data[consumed..];
        let take = rest.len().min(self.bytes_left as usize);
        if take > 0 {
            let file = self.file.as_mut().expect("payload file open");
            if let Err(err) = file.write_all(&rest[..take]) {
                self.fail();
                return Err(err.into());
            }
            self.bytes_left -= take as u64;
            consumed += take;
        }

        if self.bytes_left == 0 {
            let _ = self.file.take();
            if let Some(object) = &mut self.object {
                object.set_receive_time(Timestamp::now());
            }
        }

        Ok(PutData {
            consumed,
            remaining: Some(self.bytes_left),
        })
    }

    pub fn is_complete(&self) -> bool {
        self.object.is_some() && self.bytes_left == 0
    }

    /// Hands out the finished data object. Calling this before the stream
    /// completed fails the ingest and removes the partial file.
    pub fn into_data_object(mut self) -> Result<DataObject> {
        if !self.is_complete() {
            self.fail();
            return Err(Error::IngestFinished);
        }
        Ok(self.object.take().expect("complete"))
    }

    fn open_payload_file(&self, object: &mut DataObject) -> Result<File> {
        let base = match object.file_name() {
            Some(name) => name.to_string(),
            None => object.id().to_string(),
        };

        for i in 0..MAX_FILENAME_COLLISIONS {
            let candidate = if i == 0 {
                self.storage_dir.join(&base)
            } else {
                self.storage_dir.join(format!("{i}-{base}"))
            };
            if candidate.exists() {
                continue;
            }
            let file = File::create(&candidate)?;
            debug!(
                "writing {} payload bytes of {} into {candidate:?}",
                object.data_len(),
                object.id()
            );
            object.file_path = Some(candidate);
            object.owns_file = true;
            return Ok(file);
        }
        Err(Error::PayloadFileCollision(self.storage_dir.clone()))
    }

    fn fail(&mut self) {
        self.failed = true;
        let _ = self.file.take();
        // The partial object owns its file; dropping it removes the file.
        let _ = self.object.take();
    }
}

/// Egress view of a data object: drains the serialized header first, then
/// the payload file. Holds its own copy of the object so the payload file
/// stays alive for the retriever's lifetime.
#[derive(Debug)]
pub struct DataObjectRetriever {
    _object: DataObject,
    header: Vec<u8>,
    header_pos: usize,
    file: Option<File>,
    bytes_left: u64,
}

impl DataObjectRetriever {
    fn new(object: &DataObject) -> Result<Self> {
        let mut header = object.to_wire();
        // Trim anything past the closing tag so the payload follows the
        // header back-to-back.
        while header.last().is_some_and(|b| *b != b'>') {
            let _ = header.pop();
        }

        let (file, bytes_left) = if object.data_len() > 0 {
            let path = object.file_path().ok_or(Error::NoPayloadFile)?;
            (Some(File::open(path)?), object.data_len())
        } else {
            (None, 0)
        };

        Ok(Self {
            _object: object.clone(),
            header,
            header_pos: 0,
            file,
            bytes_left,
        })
    }

    pub fn header_len(&self) -> usize {
        self.header.len()
    }

    /// Total bytes this retriever will produce.
    pub fn total_len(&self) -> u64 {
        self.header.len() as u64 + self.bytes_left
    }

    /// Reads the next bytes into `buf`; returns 0 when drained. With
    /// `header_only` the payload is never touched.
    pub fn retrieve(&mut self, buf: &mut [u8], header_only: bool) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut read = 0;
        if self.header_pos < self.header.len() {
            let n = buf.len().min(self.header.len() - self.header_pos);
            buf[..n].copy_from_slice(&self.header[self.header_pos..self.header_pos + n]);
            self.header_pos += n;
            read = n;
            if read == buf.len() {
                return Ok(read);
            }
        }
        if header_only {
            return Ok(read);
        }

        let Some(file) = self.file.as_mut() else {
            return Ok(read);
        };

        let want = (buf.len() - read).min(self.bytes_left as usize);
        let n = file.read(&mut buf[read..read + want])?;
        self.bytes_left -= n as u64;
        read += n;

        if self.bytes_left == 0 || n == 0 {
            let _ = self.file.take();
        }
        Ok(read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;
    use rand::RngCore;

    fn scratch() -> tempfile::TempDir {
        tempfile::tempdir().expect("tempdir")
    }

    fn published(dir: &Path) -> DataObject {
        let mut dobj = DataObject::new(dir);
        let _ = dobj.add_attribute(Attribute::new("Animal", "Cat"));
        let _ = dobj.add_attribute(Attribute::with_weight("Color", "Black", 2));
        dobj.set_create_time("1700000000.000000".parse().expect("timestamp"));
        dobj
    }

    #[test]
    fn attribute_round_trip_keeps_id() -> Result<()> {
        let dir = scratch();
        let dobj = published(dir.path());

        let wire = dobj.to_wire();
        let parsed = DataObject::from_raw(&wire, dir.path())?;

        assert_eq!(parsed.id(), dobj.id());
        assert_eq!(parsed.attributes(), dobj.attributes());
        assert_eq!(parsed.create_time(), dobj.create_time());
        Ok(())
    }

    #[test]
    fn id_is_a_pure_function_of_content() {
        let dir = scratch();
        let a = published(dir.path());
        let b = published(dir.path());
        assert_eq!(a.id(), b.id());

        let mut c = published(dir.path());
        let _ = c.add_attribute(Attribute::new("Extra", "Tag"));
        assert_ne!(a.id(), c.id());

        let mut d = published(dir.path());
        d.set_create_time("1700000001.000000".parse().expect("timestamp"));
        assert_ne!(a.id(), d.id());
    }

    #[test]
    fn streaming_ingest_in_7_byte_chunks() -> Result<()> {
        let send_dir = scratch();
        let recv_dir = scratch();

        // 1 MiB random payload.
        let mut payload = vec![0u8; 1024 * 1024];
        rand::thread_rng().fill_bytes(&mut payload);
        let payload_path = send_dir.path().join("payload.bin");
        fs::write(&payload_path, &payload)?;
        let payload_hash: [u8; ID_LEN] = Sha1::digest(&payload).into();

        let mut dobj = published(send_dir.path());
        dobj.set_file(&payload_path)?;
        dobj.set_data_hash(payload_hash);

        let mut stream = dobj.to_wire();
        stream.extend_from_slice(&payload);

        let mut ingest = DataObject::ingest(recv_dir.path(), None, None);
        for chunk in stream.chunks(7) {
            let put = ingest.put_data(chunk)?;
            assert_eq!(put.consumed, chunk.len());
        }
        assert!(ingest.is_complete());

        let mut received = ingest.into_data_object()?;
        assert_eq!(received.data_len(), payload.len() as u64);
        assert_eq!(received.data_state(), DataState::NotVerified);
        assert_eq!(received.id(), dobj.id());
        assert!(received.owns_file());
        assert!(received.receive_time().is_some());

        let written = fs::read(received.file_path().expect("payload file"))?;
        let written_hash: [u8; ID_LEN] = Sha1::digest(&written).into();
        assert_eq!(written_hash, payload_hash);

        assert_eq!(received.verify_data()?, DataState::VerifiedOk);
        // Idempotent.
        assert_eq!(received.verify_data()?, DataState::VerifiedOk);
        Ok(())
    }

    #[test]
    fn single_shot_and_chunked_ingest_agree() -> Result<()> {
        let dir = scratch();
        let recv_a = scratch();
        let recv_b = scratch();

        let payload = b"some payload bytes".to_vec();
        let payload_path = dir.path().join("p.bin");
        fs::write(&payload_path, &payload)?;

        let mut dobj = published(dir.path());
        dobj.set_file(&payload_path)?;

        let mut stream = dobj.to_wire();
        stream.extend_from_slice(&payload);

        let mut one_shot = DataObject::ingest(recv_a.path(), None, None);
        let put = one_shot.put_data(&stream)?;
        assert_eq!(put.remaining, Some(0));
        let a = one_shot.into_data_object()?;

        let mut chunked = DataObject::ingest(recv_b.path(), None, None);
        for chunk in stream.chunks(3) {
            let _ = chunked.put_data(chunk)?;
        }
        let b = chunked.into_data_object()?;

        assert_eq!(a.id(), b.id());
        assert_eq!(a.attributes(), b.attributes());
        assert_eq!(a.data_len(), b.data_len());
        Ok(())
    }

    #[test]
    fn ingest_leaves_next_object_bytes_unconsumed() -> Result<()> {
        let dir = scratch();
        let recv = scratch();

        let payload = b"0123456789".to_vec();
        let payload_path = dir.path().join("p.bin");
        fs::write(&payload_path, &payload)?;
        let mut dobj = published(dir.path());
        dobj.set_file(&payload_path)?;

        let mut stream = dobj.to_wire();
        stream.extend_from_slice(&payload);
        stream.extend_from_slice(b"<Haggle>next object starts here");

        let mut ingest = DataObject::ingest(recv.path(), None, None);
        let put = ingest.put_data(&stream)?;
        assert_eq!(put.remaining, Some(0));
        assert_eq!(&stream[put.consumed..], b"<Haggle>next object starts here");
        Ok(())
    }

    #[test]
    fn bad_header_fails_the_ingest() {
        let recv = scratch();
        let mut ingest = DataObject::ingest(recv.path(), None, None);
        let put = ingest.put_data(b"<NotHaggle><Attr name=\"a\">b</Attr></nothaggle>");
        assert!(put.is_ok(), "terminator never seen, still pending");

        let mut ingest = DataObject::ingest(recv.path(), None, None);
        assert!(ingest.put_data(b"<Haggle><Broken</haggle>").is_err());
        assert!(matches!(
            ingest.put_data(b"more"),
            Err(Error::IngestFinished)
        ));
    }

    #[test]
    fn verify_flags_corrupted_payload() -> Result<()> {
        let dir = scratch();
        let payload_path = dir.path().join("p.bin");
        fs::write(&payload_path, b"expected content")?;

        let mut dobj = published(dir.path());
        dobj.set_file(&payload_path)?;
        dobj.set_data_hash(Sha1::digest(b"different content").into());

        assert_eq!(dobj.verify_data()?, DataState::VerifiedBad);
        Ok(())
    }

    #[test]
    fn retriever_drains_header_then_payload() -> Result<()> {
        let dir = scratch();
        let payload = b"payload-payload".to_vec();
        let payload_path = dir.path().join("p.bin");
        fs::write(&payload_path, &payload)?;

        let mut dobj = published(dir.path());
        dobj.set_file(&payload_path)?;

        let mut retriever = dobj.retriever()?;
        let mut out = Vec::new();
        let mut buf = [0u8; 11];
        loop {
            let n = retriever.retrieve(&mut buf, false)?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }

        assert_eq!(out.len() as u64, retriever.total_len());
        assert!(out.ends_with(&payload));
        assert!(out.starts_with(b"<?xml"));
        // Header was trimmed to the closing tag before the payload starts.
        let end = find_header_end(&out).expect("header terminator");
        assert_eq!(&out[end..], &payload[..]);
        Ok(())
    }

    #[test]
    fn clones_never_own_the_payload_file() -> Result<()> {
        let recv = scratch();
        let dir = scratch();
        let payload_path = dir.path().join("p.bin");
        fs::write(&payload_path, b"bytes")?;

        let mut dobj = published(dir.path());
        dobj.set_file(&payload_path)?;
        let mut stream = dobj.to_wire();
        stream.extend_from_slice(b"bytes");

        let mut ingest = DataObject::ingest(recv.path(), None, None);
        let _ = ingest.put_data(&stream)?;
        let received = ingest.into_data_object()?;
        let payload_file = received.file_path().expect("file").to_path_buf();

        let copy = received.clone();
        assert!(!copy.owns_file());
        drop(copy);
        assert!(payload_file.exists());

        drop(received);
        assert!(!payload_file.exists());
        Ok(())
    }
}
