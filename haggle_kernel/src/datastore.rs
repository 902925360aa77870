// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The persistent, attribute-indexed query engine.
//!
//! All operations are asynchronous: callers post commands onto the worker's
//! queue and results come back as typed events on the kernel queue. The
//! worker owns a SQLite database holding data objects, nodes, interfaces and
//! the attribute link tables; registered filters live in worker memory and
//! do not survive a restart.
//!
//! Matching semantics: a data object is a candidate for a node iff the
//! integer percent ratio of matched interest weight reaches the node's
//! threshold, the number of matched interests reaches the caller's minimum,
//! and no matching interest carries the zero veto weight. Results order by
//! ratio, then match count, then creation time, and are truncated to the
//! node's match cap.

use crate::{
    error::{Error, Result},
    event::{Event, EventSender, FilterEventId},
    filter::Filter,
    store::{self, new_data_object_ref, new_node_ref, DataObjectRef, NodeRef, NodeStore},
};
use haggle_protocol::{
    Attribute, Bloomfilter, DataObject, DataObjectId, Interface, InterfaceType, Node, NodeId,
    NodeType, Timestamp,
};
use itertools::Itertools;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::{
    path::{Path, PathBuf},
    sync::mpsc,
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// At most this many data objects are removed per aging pass.
const MAX_AGED_PER_PASS: usize = 100;

/// Cap on data objects delivered for a filter scan.
const MAX_FILTER_MATCHES: usize = 10;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS dataobjects (
    rowid INTEGER PRIMARY KEY AUTOINCREMENT,
    id BLOB UNIQUE,
    header TEXT,
    filepath TEXT,
    filename TEXT,
    datalen INTEGER,
    signature_status INTEGER,
    signee TEXT,
    createtime INTEGER,
    receivetime INTEGER,
    inserted INTEGER
);
CREATE TABLE IF NOT EXISTS nodes (
    rowid INTEGER PRIMARY KEY AUTOINCREMENT,
    type INTEGER,
    id BLOB UNIQUE,
    name TEXT,
    bloomfilter BLOB,
    sum_weights INTEGER DEFAULT 0,
    max_matches INTEGER,
    threshold INTEGER
);
CREATE TABLE IF NOT EXISTS attributes (
    rowid INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT,
    value TEXT,
    UNIQUE (name, value)
);
CREATE TABLE IF NOT EXISTS dataobject_attrs (
    dataobject_rowid INTEGER,
    attr_rowid INTEGER,
    UNIQUE (dataobject_rowid, attr_rowid)
);
CREATE TABLE IF NOT EXISTS node_attrs (
    node_rowid INTEGER,
    attr_rowid INTEGER,
    weight INTEGER,
    UNIQUE (node_rowid, attr_rowid)
);
CREATE TABLE IF NOT EXISTS interfaces (
    rowid INTEGER PRIMARY KEY AUTOINCREMENT,
    type INTEGER,
    identifier BLOB,
    node_rowid INTEGER,
    UNIQUE (type, identifier)
);
CREATE TABLE IF NOT EXISTS repository (
    rowid INTEGER PRIMARY KEY AUTOINCREMENT,
    authority TEXT,
    key TEXT,
    value TEXT
);
CREATE INDEX IF NOT EXISTS index_dataobjects_id ON dataobjects (id);
CREATE INDEX IF NOT EXISTS index_nodes_id ON nodes (id);
CREATE INDEX IF NOT EXISTS index_attributes ON attributes (name, value);
CREATE INDEX IF NOT EXISTS index_dataobject_attrs ON dataobject_attrs (attr_rowid);
CREATE INDEX IF NOT EXISTS index_node_attrs ON node_attrs (attr_rowid);

CREATE TRIGGER IF NOT EXISTS delete_dataobject AFTER DELETE ON dataobjects
BEGIN
    DELETE FROM dataobject_attrs WHERE dataobject_rowid = old.rowid;
END;
CREATE TRIGGER IF NOT EXISTS delete_node AFTER DELETE ON nodes
BEGIN
    DELETE FROM node_attrs WHERE node_rowid = old.rowid;
    DELETE FROM interfaces WHERE node_rowid = old.rowid;
END;
CREATE TRIGGER IF NOT EXISTS insert_node_attr AFTER INSERT ON node_attrs
BEGIN
    UPDATE nodes SET sum_weights = sum_weights + new.weight WHERE rowid = new.node_rowid;
END;
CREATE TRIGGER IF NOT EXISTS delete_node_attr AFTER DELETE ON node_attrs
BEGIN
    UPDATE nodes SET sum_weights = sum_weights - old.weight WHERE rowid = old.node_rowid;
END;
";

/// A flat persistent key/value row, segmented by authority; managers use the
/// repository to checkpoint their own state across restarts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepositoryEntry {
    pub authority: String,
    pub key: String,
    pub value: String,
    pub id: u64,
}

impl RepositoryEntry {
    pub fn new(
        authority: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            authority: authority.into(),
            key: key.into(),
            value: value.into(),
            id: 0,
        }
    }
}

enum DataStoreCmd {
    InsertDataObject {
        data_object: DataObjectRef,
        notify: bool,
    },
    DeleteDataObject {
        id: DataObjectId,
        report: bool,
    },
    AgeDataObjects {
        min_age: Duration,
    },
    InsertNode {
        node: NodeRef,
    },
    DeleteNode {
        node: NodeRef,
    },
    RetrieveNode {
        probe: NodeRef,
        force: bool,
        this_node: bool,
    },
    RetrieveNodesByType {
        node_type: NodeType,
    },
    InsertFilter {
        filter: Filter,
        match_first: bool,
    },
    DeleteFilter {
        event: FilterEventId,
    },
    DataObjectQuery {
        node: NodeRef,
        min_attr_matches: u32,
    },
    DataObjectQueryForNodes {
        delegate: NodeRef,
        targets: Vec<NodeRef>,
        min_attr_matches: u32,
    },
    NodeQuery {
        data_object: DataObjectRef,
        min_ratio: u32,
        min_attr_matches: u32,
        max: u32,
    },
    FilterQuery {
        filter: Filter,
    },
    RepositoryInsert {
        entry: RepositoryEntry,
    },
    RepositoryRead {
        authority: String,
        key: Option<String>,
    },
    RepositoryDelete {
        authority: String,
        key: String,
    },
    Dump,
    DumpToFile {
        path: PathBuf,
    },
    Stop,
}

/// Cloneable command handle onto the data store worker.
#[derive(Clone)]
pub struct DataStoreHandle {
    tx: mpsc::Sender<DataStoreCmd>,
}

impl DataStoreHandle {
    fn send(&self, cmd: DataStoreCmd) {
        if self.tx.send(cmd).is_err() {
            debug!("data store command dropped, worker is gone");
        }
    }

    pub fn insert_data_object(&self, data_object: DataObjectRef, notify: bool) {
        self.send(DataStoreCmd::InsertDataObject {
            data_object,
            notify,
        });
    }

    pub fn delete_data_object(&self, id: DataObjectId, report: bool) {
        self.send(DataStoreCmd::DeleteDataObject { id, report });
    }

    pub fn age_data_objects(&self, min_age: Duration) {
        self.send(DataStoreCmd::AgeDataObjects { min_age });
    }

    pub fn insert_node(&self, node: NodeRef) {
        self.send(DataStoreCmd::InsertNode { node });
    }

    pub fn delete_node(&self, node: NodeRef) {
        self.send(DataStoreCmd::DeleteNode { node });
    }

    /// Looks a node up by id, or by common interface for an Undefined probe;
    /// with `force` the completion fires even on a miss, carrying the probe.
    pub fn retrieve_node(&self, probe: NodeRef, force: bool) {
        self.send(DataStoreCmd::RetrieveNode {
            probe,
            force,
            this_node: false,
        });
    }

    /// Like [`Self::retrieve_node`] but completes as `ThisNodeRetrieved`.
    pub fn retrieve_this_node(&self, probe: NodeRef) {
        self.send(DataStoreCmd::RetrieveNode {
            probe,
            force: false,
            this_node: true,
        });
    }

    pub fn retrieve_nodes_by_type(&self, node_type: NodeType) {
        self.send(DataStoreCmd::RetrieveNodesByType { node_type });
    }

    pub fn insert_filter(&self, filter: Filter, match_first: bool) {
        self.send(DataStoreCmd::InsertFilter {
            filter,
            match_first,
        });
    }

    pub fn delete_filter(&self, event: FilterEventId) {
        self.send(DataStoreCmd::DeleteFilter { event });
    }

    pub fn data_object_query(&self, node: NodeRef, min_attr_matches: u32) {
        self.send(DataStoreCmd::DataObjectQuery {
            node,
            min_attr_matches,
        });
    }

    /// Accumulates matches for the target nodes, excluding anything the
    /// delegate has already seen; the completion carries the delegate.
    pub fn data_object_query_for_nodes(
        &self,
        delegate: NodeRef,
        targets: Vec<NodeRef>,
        min_attr_matches: u32,
    ) {
        self.send(DataStoreCmd::DataObjectQueryForNodes {
            delegate,
            targets,
            min_attr_matches,
        });
    }

    pub fn node_query(
        &self,
        data_object: DataObjectRef,
        min_ratio: u32,
        min_attr_matches: u32,
        max: u32,
    ) {
        self.send(DataStoreCmd::NodeQuery {
            data_object,
            min_ratio,
            min_attr_matches,
            max,
        });
    }

    pub fn filter_query(&self, filter: Filter) {
        self.send(DataStoreCmd::FilterQuery { filter });
    }

    pub fn repository_insert(&self, entry: RepositoryEntry) {
        self.send(DataStoreCmd::RepositoryInsert { entry });
    }

    /// Reads entries under an authority; `key` supports SQL `LIKE` patterns.
    pub fn repository_read(&self, authority: impl Into<String>, key: Option<String>) {
        self.send(DataStoreCmd::RepositoryRead {
            authority: authority.into(),
            key,
        });
    }

    pub fn repository_delete(&self, authority: impl Into<String>, key: impl Into<String>) {
        self.send(DataStoreCmd::RepositoryDelete {
            authority: authority.into(),
            key: key.into(),
        });
    }

    pub fn dump(&self) {
        self.send(DataStoreCmd::Dump);
    }

    pub fn dump_to_file(&self, path: PathBuf) {
        self.send(DataStoreCmd::DumpToFile { path });
    }

    pub(crate) fn stop(&self) {
        self.send(DataStoreCmd::Stop);
    }
}

/// Spawns the data store worker thread.
pub(crate) fn spawn(
    db_path: &Path,
    storage_dir: PathBuf,
    events: EventSender,
    node_store: std::sync::Arc<NodeStore>,
) -> Result<(DataStoreHandle, thread::JoinHandle<()>)> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(SCHEMA)?;

    let (tx, rx) = mpsc::channel();
    let mut worker = Worker {
        conn,
        storage_dir,
        events,
        node_store,
        filters: Vec::new(),
    };

    let join = thread::Builder::new()
        .name("haggle-datastore".to_string())
        .spawn(move || worker.run(rx))?;

    Ok((DataStoreHandle { tx }, join))
}

struct Worker {
    conn: Connection,
    storage_dir: PathBuf,
    events: EventSender,
    node_store: std::sync::Arc<NodeStore>,
    filters: Vec<Filter>,
}

impl Worker {
    fn run(&mut self, rx: mpsc::Receiver<DataStoreCmd>) {
        debug!("data store worker up");
        while let Ok(cmd) = rx.recv() {
            if matches!(cmd, DataStoreCmd::Stop) {
                break;
            }
            if let Err(err) = self.handle(cmd) {
                error!("data store operation failed: {err}");
            }
        }
        debug!("data store worker exiting");
    }

    fn handle(&mut self, cmd: DataStoreCmd) -> Result<()> {
        match cmd {
            DataStoreCmd::InsertDataObject {
                data_object,
                notify,
            } => self.insert_data_object(data_object, notify),
            DataStoreCmd::DeleteDataObject { id, report } => self.delete_data_object(&id, report),
            DataStoreCmd::AgeDataObjects { min_age } => self.age_data_objects(min_age),
            DataStoreCmd::InsertNode { node } => self.insert_node(&node),
            DataStoreCmd::DeleteNode { node } => self.delete_node(&node),
            DataStoreCmd::RetrieveNode {
                probe,
                force,
                this_node,
            } => self.retrieve_node(probe, force, this_node),
            DataStoreCmd::RetrieveNodesByType { node_type } => {
                self.retrieve_nodes_by_type(node_type)
            }
            DataStoreCmd::InsertFilter {
                filter,
                match_first,
            } => self.insert_filter(filter, match_first),
            DataStoreCmd::DeleteFilter { event } => {
                self.filters.retain(|f| f.event() != event);
                Ok(())
            }
            DataStoreCmd::DataObjectQuery {
                node,
                min_attr_matches,
            } => {
                let result = self.data_object_query(&node, min_attr_matches, None, None)?;
                if !result.is_empty() {
                    self.events.post(Event::DataObjectQueryResult {
                        node,
                        data_objects: result,
                    });
                }
                Ok(())
            }
            DataStoreCmd::DataObjectQueryForNodes {
                delegate,
                targets,
                min_attr_matches,
            } => self.data_object_query_for_nodes(delegate, targets, min_attr_matches),
            DataStoreCmd::NodeQuery {
                data_object,
                min_ratio,
                min_attr_matches,
                max,
            } => self.node_query(data_object, min_ratio, min_attr_matches, max),
            DataStoreCmd::FilterQuery { filter } => self.filter_query(filter),
            DataStoreCmd::RepositoryInsert { entry } => self.repository_insert(&entry),
            DataStoreCmd::RepositoryRead { authority, key } => {
                self.repository_read(&authority, key.as_deref())
            }
            DataStoreCmd::RepositoryDelete { authority, key } => {
                let _ = self.conn.execute(
                    "DELETE FROM repository WHERE authority = ?1 AND key = ?2",
                    params![authority, key],
                )?;
                Ok(())
            }
            DataStoreCmd::Dump => {
                let dump = self.dump()?;
                self.events.post(Event::DataStoreDump(dump));
                Ok(())
            }
            DataStoreCmd::DumpToFile { path } => {
                let dump = self.dump()?;
                std::fs::write(path, dump)?;
                Ok(())
            }
            DataStoreCmd::Stop => Ok(()),
        }
    }

    // ---------- data objects ----------

    fn insert_data_object(&mut self, data_object: DataObjectRef, notify: bool) -> Result<()> {
        let duplicate = {
            let dobj = store::read(&data_object);
            self.data_object_rowid(&dobj.id())?.is_some()
        };

        if duplicate {
            store::write(&data_object).mark_duplicate();
            trace!("data object already in data store, marked duplicate");
            if notify {
                self.events.post(Event::DataObjectInserted {
                    data_object,
                    duplicate: true,
                });
            }
            return Ok(());
        }

        let rowid = {
            let dobj = store::read(&data_object);
            let header = String::from_utf8_lossy(&dobj.to_wire()).into_owned();
            self.conn.execute(
                "INSERT INTO dataobjects \
                 (id, header, filepath, filename, datalen, signature_status, signee, \
                  createtime, receivetime, inserted) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    dobj.id().as_bytes().as_slice(),
                    header,
                    dobj.file_path().map(|p| p.to_string_lossy().into_owned()),
                    dobj.file_name(),
                    dobj.data_len() as i64,
                    dobj.signature_status().as_u32(),
                    dobj.signee(),
                    dobj.create_time().map(|t| t.as_millis()),
                    dobj.receive_time().map(|t| t.as_millis()),
                    unix_now() as i64,
                ],
            )?;
            let rowid = self.conn.last_insert_rowid();

            for attr in dobj.attributes().iter() {
                let attr_rowid = self.find_or_insert_attribute(attr.name(), attr.value())?;
                let _ = self.conn.execute(
                    "INSERT OR IGNORE INTO dataobject_attrs (dataobject_rowid, attr_rowid) \
                     VALUES (?1, ?2)",
                    params![rowid, attr_rowid],
                )?;
            }
            rowid
        };

        // The row now references the payload file; the in-memory object no
        // longer deletes it on drop.
        store::write(&data_object).release_file_ownership();

        // Evaluate registered filters: one delivery event per matching
        // filter, each carrying the same list.
        let matching: Vec<FilterEventId> = {
            let dobj = store::read(&data_object);
            self.filters
                .iter()
                .filter(|f| f.matches_data_object(&dobj))
                .map(|f| f.event())
                .collect()
        };
        for event in matching {
            self.events.post(Event::FilterMatch {
                event,
                data_objects: vec![data_object.clone()],
            });
        }

        self.events
            .post(Event::DataObjectNew(data_object.clone()));

        // Non-persistent objects live for exactly one match pass; dropping
        // the row here still allowed the duplicate check and the filter
        // evaluation above to run.
        if !store::read(&data_object).is_persistent() {
            let _ = self
                .conn
                .execute("DELETE FROM dataobjects WHERE rowid = ?1", params![rowid])?;
        }

        if notify {
            self.events.post(Event::DataObjectInserted {
                data_object,
                duplicate: false,
            });
        }
        Ok(())
    }

    fn delete_data_object(&mut self, id: &DataObjectId, report: bool) -> Result<()> {
        if report {
            match self.data_object_rowid(id)? {
                Some(rowid) => {
                    let dobj = self.data_object_from_rowid(rowid)?;
                    self.events
                        .post(Event::DataObjectsDeleted(vec![new_data_object_ref(dobj)]));
                }
                None => {
                    warn!("asked to report removal of unknown data object {id}");
                    return Ok(());
                }
            }
        }
        let _ = self
            .conn
            .execute("DELETE FROM dataobjects WHERE id = ?1", params![id.as_bytes().as_slice()])?;
        Ok(())
    }

    /// Removes persistent data objects older than `min_age` that match no
    /// registered filter, at most [`MAX_AGED_PER_PASS`] per pass.
    fn age_data_objects(&mut self, min_age: Duration) -> Result<()> {
        let cutoff = unix_now().saturating_sub(min_age.as_secs()) as i64;

        let rowids: Vec<i64> = self
            .conn
            .prepare("SELECT rowid FROM dataobjects WHERE inserted < ?1 ORDER BY inserted")?
            .query_map(params![cutoff], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;

        let mut aged = Vec::new();
        for rowid in rowids {
            if aged.len() >= MAX_AGED_PER_PASS {
                break;
            }
            let dobj = self.data_object_from_rowid(rowid)?;
            if self.filters.iter().any(|f| f.matches_data_object(&dobj)) {
                continue;
            }
            let _ = self
                .conn
                .execute("DELETE FROM dataobjects WHERE rowid = ?1", params![rowid])?;
            aged.push(new_data_object_ref(dobj));
        }

        if !aged.is_empty() {
            debug!("aged out {} data objects", aged.len());
            self.events.post(Event::DataObjectsDeleted(aged));
        }
        Ok(())
    }

    // ---------- nodes ----------

    fn insert_node(&mut self, node: &NodeRef) -> Result<()> {
        let node = store::read(node);
        if node.node_type() == NodeType::Undefined {
            debug!("not inserting node with undefined type");
            return Ok(());
        }

        // Insert is an update: an existing row for the id is replaced, the
        // delete trigger cascading to attribute links and interface rows.
        let _ = self.conn.execute(
            "DELETE FROM nodes WHERE id = ?1",
            params![node.id().as_bytes().as_slice()],
        )?;
        let _ = self.conn.execute(
            "INSERT INTO nodes (type, id, name, bloomfilter, max_matches, threshold) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                node.node_type().as_u32(),
                node.id().as_bytes().as_slice(),
                node.name(),
                node.bloomfilter().to_bytes(),
                node.max_matches(),
                node.matching_threshold(),
            ],
        )?;
        let rowid = self.conn.last_insert_rowid();

        for attr in node.interests().iter() {
            let attr_rowid = self.find_or_insert_attribute(attr.name(), attr.value())?;
            let _ = self.conn.execute(
                "INSERT OR IGNORE INTO node_attrs (node_rowid, attr_rowid, weight) \
                 VALUES (?1, ?2, ?3)",
                params![rowid, attr_rowid, attr.weight()],
            )?;
        }

        for iface in node.interfaces() {
            let _ = self.conn.execute(
                "INSERT OR REPLACE INTO interfaces (type, identifier, node_rowid) \
                 VALUES (?1, ?2, ?3)",
                params![iface.iface_type().as_u32(), iface.identifier(), rowid],
            )?;
        }
        Ok(())
    }

    fn delete_node(&mut self, node: &NodeRef) -> Result<()> {
        let id = store::read(node).id();
        let _ = self
            .conn
            .execute("DELETE FROM nodes WHERE id = ?1", params![id.as_bytes().as_slice()])?;
        Ok(())
    }

    fn retrieve_node(&mut self, probe: NodeRef, force: bool, this_node: bool) -> Result<()> {
        let rowid = self.node_rowid(&probe)?;

        let node = match rowid {
            Some(rowid) => {
                let node = self.node_from_rowid(rowid)?;
                if force {
                    // Carry the probe's interfaces over so a freshly seen
                    // link is not lost on the stored identity.
                    let mut merged = store::write(&node);
                    for iface in store::read(&probe).interfaces() {
                        merged.add_interface(iface.clone());
                    }
                }
                Some(node)
            }
            None => None,
        };

        if this_node {
            self.events.post(Event::ThisNodeRetrieved { node });
        } else if node.is_some() || force {
            self.events.post(Event::NodeRetrieved { node, probe });
        }
        Ok(())
    }

    fn retrieve_nodes_by_type(&mut self, node_type: NodeType) -> Result<()> {
        let rowids: Vec<i64> = self
            .conn
            .prepare("SELECT rowid FROM nodes WHERE type = ?1")?
            .query_map(params![node_type.as_u32()], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;

        let mut nodes = Vec::new();
        for rowid in rowids {
            nodes.push(self.node_from_rowid(rowid)?);
        }
        self.events
            .post(Event::NodesRetrievedByType { node_type, nodes });
        Ok(())
    }

    // ---------- filters ----------

    fn insert_filter(&mut self, filter: Filter, match_first: bool) -> Result<()> {
        self.filters.retain(|f| f.event() != filter.event());
        self.filters.push(filter.clone());
        if match_first {
            self.run_filter(&filter, filter.event())?;
        }
        Ok(())
    }

    fn filter_query(&mut self, filter: Filter) -> Result<()> {
        let matches = self.matching_data_objects(&filter)?;
        self.events.post(Event::FilterQueryResult {
            event: filter.event(),
            data_objects: matches,
        });
        Ok(())
    }

    fn run_filter(&mut self, filter: &Filter, event: FilterEventId) -> Result<()> {
        let matches = self.matching_data_objects(filter)?;
        if !matches.is_empty() {
            self.events.post(Event::FilterMatch {
                event,
                data_objects: matches,
            });
        }
        Ok(())
    }

    fn matching_data_objects(&mut self, filter: &Filter) -> Result<Vec<DataObjectRef>> {
        // Narrow candidates on the first pattern's name, then verify the
        // full filter against the reconstructed objects.
        let Some(first) = filter.attributes().iter().next() else {
            return Ok(Vec::new());
        };

        let rowids: Vec<i64> = self
            .conn
            .prepare(
                "SELECT DISTINCT da.dataobject_rowid FROM attributes a \
                 JOIN dataobject_attrs da ON da.attr_rowid = a.rowid \
                 WHERE a.name = ?1 ORDER BY da.dataobject_rowid",
            )?
            .query_map(params![first.name()], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;

        let mut matches = Vec::new();
        for rowid in rowids {
            if matches.len() >= MAX_FILTER_MATCHES {
                break;
            }
            let dobj = self.data_object_from_rowid(rowid)?;
            if filter.matches_data_object(&dobj) {
                matches.push(new_data_object_ref(dobj));
            }
        }
        Ok(matches)
    }

    // ---------- match queries ----------

    /// Ranks stored data objects against the node's weighted interests.
    /// `also_seen` contributes a second bloom filter to exclude against;
    /// `budget` caps the result regardless of the node's own limit.
    fn data_object_query(
        &mut self,
        node: &NodeRef,
        min_attr_matches: u32,
        also_seen: Option<&NodeRef>,
        budget: Option<u64>,
    ) -> Result<Vec<DataObjectRef>> {
        let Some(node_rowid) = self.node_rowid(node)? else {
            debug!("data object query for a node not in the data store");
            return Ok(Vec::new());
        };

        let sum_weights: i64 = self.conn.query_row(
            "SELECT sum_weights FROM nodes WHERE rowid = ?1",
            params![node_rowid],
            |row| row.get(0),
        )?;
        if sum_weights <= 0 {
            return Ok(Vec::new());
        }

        let (threshold, max_matches) = {
            let n = store::read(node);
            (n.matching_threshold() as i64, n.max_matches() as u64)
        };
        let max_matches = match budget {
            Some(budget) if max_matches == 0 || budget < max_matches => budget,
            _ => max_matches,
        };

        struct Candidate {
            rowid: i64,
            ratio: i64,
            mcount: i64,
            createtime: i64,
        }

        let candidates: Vec<Candidate> = self
            .conn
            .prepare(
                "SELECT d.rowid, SUM(na.weight), COUNT(*), MIN(na.weight), \
                        COALESCE(d.createtime, 0) \
                 FROM node_attrs na \
                 JOIN dataobject_attrs da ON da.attr_rowid = na.attr_rowid \
                 JOIN dataobjects d ON d.rowid = da.dataobject_rowid \
                 WHERE na.node_rowid = ?1 \
                 GROUP BY d.rowid",
            )?
            .query_map(params![node_rowid], |row| {
                let weight: i64 = row.get(1)?;
                let min_weight: i64 = row.get(3)?;
                Ok((
                    Candidate {
                        rowid: row.get(0)?,
                        ratio: 100 * weight / sum_weights,
                        mcount: row.get(2)?,
                        createtime: row.get(4)?,
                    },
                    min_weight,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            // The veto rule: a matching zero-weight interest excludes the
            // object outright.
            .filter(|(_, min_weight)| *min_weight > 0)
            .map(|(c, _)| c)
            .filter(|c| c.ratio >= threshold && c.mcount >= min_attr_matches as i64)
            .sorted_by(|a, b| {
                b.ratio
                    .cmp(&a.ratio)
                    .then(b.mcount.cmp(&a.mcount))
                    .then(b.createtime.cmp(&a.createtime))
            })
            .collect();

        let mut result = Vec::new();
        for candidate in candidates {
            if max_matches != 0 && result.len() as u64 >= max_matches {
                break;
            }
            let dobj = self.data_object_from_rowid(candidate.rowid)?;
            let id = dobj.id();
            let seen = store::read(node).bloomfilter().check(id.as_bytes())
                || also_seen
                    .map(|n| store::read(n).bloomfilter().check(id.as_bytes()))
                    .unwrap_or(false);
            if !seen {
                result.push(new_data_object_ref(dobj));
            }
        }
        Ok(result)
    }

    /// Same as a plain data object query, but accumulates matches over the
    /// target nodes, excluding anything the delegate already holds.
    fn data_object_query_for_nodes(
        &mut self,
        delegate: NodeRef,
        targets: Vec<NodeRef>,
        min_attr_matches: u32,
    ) -> Result<()> {
        let max = store::read(&delegate).max_matches() as u64;
        let mut budget_left = max;
        let mut collected: Vec<DataObjectRef> = Vec::new();

        for target in targets {
            if max != 0 && budget_left == 0 {
                break;
            }
            let budget = (max != 0).then_some(budget_left);
            let matches =
                self.data_object_query(&target, min_attr_matches, Some(&delegate), budget)?;
            for dobj in matches {
                let id = store::read(&dobj).id();
                if !collected
                    .iter()
                    .any(|d| store::read(d).id() == id)
                {
                    collected.push(dobj);
                    budget_left = budget_left.saturating_sub(1);
                }
            }
        }

        if !collected.is_empty() {
            self.events.post(Event::DataObjectQueryResult {
                node: delegate,
                data_objects: collected,
            });
        }
        Ok(())
    }

    /// Nodes for which the data object is a candidate, restricted to peers
    /// and gateways.
    fn node_query(
        &mut self,
        data_object: DataObjectRef,
        min_ratio: u32,
        min_attr_matches: u32,
        max: u32,
    ) -> Result<()> {
        let Some(dobj_rowid) = self.data_object_rowid(&store::read(&data_object).id())? else {
            debug!("node query for a data object not in the data store");
            return Ok(());
        };

        struct Candidate {
            node_rowid: i64,
            ratio: i64,
            mcount: i64,
        }

        let candidates: Vec<Candidate> = self
            .conn
            .prepare(
                "SELECT n.rowid, SUM(na.weight), COUNT(*), MIN(na.weight), \
                        n.sum_weights, n.threshold \
                 FROM dataobject_attrs da \
                 JOIN node_attrs na ON na.attr_rowid = da.attr_rowid \
                 JOIN nodes n ON n.rowid = na.node_rowid \
                 WHERE da.dataobject_rowid = ?1 \
                 GROUP BY n.rowid",
            )?
            .query_map(params![dobj_rowid], |row| {
                let weight: i64 = row.get(1)?;
                let min_weight: i64 = row.get(3)?;
                let sum_weights: i64 = row.get::<_, i64>(4)?.max(1);
                let threshold: i64 = row.get(5)?;
                Ok((
                    Candidate {
                        node_rowid: row.get(0)?,
                        ratio: 100 * weight / sum_weights,
                        mcount: row.get(2)?,
                    },
                    min_weight,
                    threshold,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .filter(|(c, min_weight, threshold)| {
                *min_weight > 0
                    && c.ratio >= (min_ratio as i64).max(*threshold)
                    && c.mcount >= min_attr_matches as i64
            })
            .map(|(c, _, _)| c)
            .sorted_by(|a, b| b.ratio.cmp(&a.ratio).then(b.mcount.cmp(&a.mcount)))
            .collect();

        let mut nodes = Vec::new();
        for candidate in candidates {
            if max != 0 && nodes.len() as u32 >= max {
                break;
            }
            let node = self.node_from_rowid(candidate.node_rowid)?;
            let node_type = store::read(&node).node_type();
            // Application nodes get their content through filters instead.
            if matches!(node_type, NodeType::Peer | NodeType::Gateway) {
                nodes.push(node);
            }
        }

        if !nodes.is_empty() {
            self.events.post(Event::NodeQueryResult {
                data_object,
                nodes,
            });
        }
        Ok(())
    }

    // ---------- repository ----------

    fn repository_insert(&mut self, entry: &RepositoryEntry) -> Result<()> {
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT rowid FROM repository WHERE authority = ?1 AND key = ?2",
                params![entry.authority, entry.key],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(rowid) => {
                let _ = self.conn.execute(
                    "UPDATE repository SET value = ?1 WHERE rowid = ?2",
                    params![entry.value, rowid],
                )?;
            }
            None => {
                let _ = self.conn.execute(
                    "INSERT INTO repository (authority, key, value) VALUES (?1, ?2, ?3)",
                    params![entry.authority, entry.key, entry.value],
                )?;
            }
        }
        Ok(())
    }

    fn repository_read(&mut self, authority: &str, key: Option<&str>) -> Result<()> {
        let mut stmt = match key {
            Some(_) => self.conn.prepare(
                "SELECT rowid, authority, key, value FROM repository \
                 WHERE authority = ?1 AND key LIKE ?2",
            )?,
            None => self.conn.prepare(
                "SELECT rowid, authority, key, value FROM repository WHERE authority = ?1",
            )?,
        };

        let map_row = |row: &Row<'_>| -> rusqlite::Result<RepositoryEntry> {
            Ok(RepositoryEntry {
                id: row.get::<_, i64>(0)? as u64,
                authority: row.get(1)?,
                key: row.get(2)?,
                value: row.get(3)?,
            })
        };

        let entries: Vec<RepositoryEntry> = match key {
            Some(key) => stmt
                .query_map(params![authority, key], map_row)?
                .collect::<rusqlite::Result<_>>()?,
            None => stmt
                .query_map(params![authority], map_row)?
                .collect::<rusqlite::Result<_>>()?,
        };

        self.events.post(Event::RepositoryResult {
            authority: authority.to_string(),
            entries,
        });
        Ok(())
    }

    // ---------- dump ----------

    /// Structured textual snapshot of every table; a diagnostic format, not
    /// a stable interface.
    fn dump(&mut self) -> Result<String> {
        use haggle_protocol::Metadata;

        let mut root = Metadata::new("HaggleDump");
        for table in [
            "attributes",
            "dataobjects",
            "nodes",
            "interfaces",
            "dataobject_attrs",
            "node_attrs",
            "repository",
        ] {
            let mut table_md = Metadata::new(table);
            let mut stmt = self.conn.prepare(&format!("SELECT * FROM {table}"))?;
            let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let mut entry = Metadata::new("entry");
                for (idx, column) in columns.iter().enumerate() {
                    use rusqlite::types::ValueRef;
                    let text = match row.get_ref(idx)? {
                        ValueRef::Null => continue,
                        ValueRef::Integer(v) => v.to_string(),
                        ValueRef::Real(v) => v.to_string(),
                        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
                        ValueRef::Blob(b) => hex::encode(b),
                    };
                    entry.set_parameter(column, text);
                }
                let _ = table_md.add_child(entry);
            }
            drop(rows);
            drop(stmt);
            let _ = root.add_child(table_md);
        }
        Ok(String::from_utf8_lossy(&root.to_wire()).into_owned())
    }

    // ---------- row helpers ----------

    fn find_or_insert_attribute(&self, name: &str, value: &str) -> Result<i64> {
        let _ = self.conn.execute(
            "INSERT OR IGNORE INTO attributes (name, value) VALUES (?1, ?2)",
            params![name, value],
        )?;
        let rowid = self.conn.query_row(
            "SELECT rowid FROM attributes WHERE name = ?1 AND value = ?2",
            params![name, value],
            |row| row.get(0),
        )?;
        Ok(rowid)
    }

    fn data_object_rowid(&self, id: &DataObjectId) -> Result<Option<i64>> {
        Ok(self
            .conn
            .query_row(
                "SELECT rowid FROM dataobjects WHERE id = ?1",
                params![id.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn node_rowid(&self, node: &NodeRef) -> Result<Option<i64>> {
        let (node_type, id, interfaces) = {
            let n = store::read(node);
            (n.node_type(), n.id(), n.interfaces().to_vec())
        };

        if node_type != NodeType::Undefined {
            return Ok(self
                .conn
                .query_row(
                    "SELECT rowid FROM nodes WHERE id = ?1",
                    params![id.as_bytes().as_slice()],
                    |row| row.get(0),
                )
                .optional()?);
        }

        // Undefined probes are looked up by common interface.
        for iface in interfaces {
            let rowid = self
                .conn
                .query_row(
                    "SELECT node_rowid FROM interfaces WHERE type = ?1 AND identifier = ?2",
                    params![iface.iface_type().as_u32(), iface.identifier()],
                    |row| row.get(0),
                )
                .optional()?;
            if rowid.is_some() {
                return Ok(rowid);
            }
        }
        Ok(None)
    }

    fn data_object_from_rowid(&self, rowid: i64) -> Result<DataObject> {
        self.conn.query_row(
            "SELECT header, filepath, filename, signature_status, receivetime \
             FROM dataobjects WHERE rowid = ?1",
            params![rowid],
            |row| {
                let header: String = row.get(0)?;
                let filepath: Option<String> = row.get(1)?;
                let filename: Option<String> = row.get(2)?;
                let signature_status: u32 = row.get(3)?;
                let receivetime: Option<i64> = row.get(4)?;
                Ok((header, filepath, filename, signature_status, receivetime))
            },
        )
        .map_err(Error::from)
        .and_then(|(header, filepath, filename, signature_status, receivetime)| {
            let mut dobj = DataObject::from_raw(header.as_bytes(), &self.storage_dir)?;
            dobj.restore_payload(filepath.map(PathBuf::from), filename);
            dobj.set_signature_status(haggle_protocol::SignatureStatus::from_u32(
                signature_status,
            ));
            if let Some(ms) = receivetime {
                dobj.set_receive_time(Timestamp::from_millis(ms));
            }
            Ok(dobj)
        })
    }

    fn node_from_rowid(&self, rowid: i64) -> Result<NodeRef> {
        let (node_type, id, name, bloomfilter, max_matches, threshold) = self.conn.query_row(
            "SELECT type, id, name, bloomfilter, max_matches, threshold \
             FROM nodes WHERE rowid = ?1",
            params![rowid],
            |row| {
                Ok((
                    row.get::<_, u32>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                    row.get::<_, u32>(4)?,
                    row.get::<_, u32>(5)?,
                ))
            },
        )?;

        let id = NodeId::try_from(id.as_slice())?;

        // Prefer the live instance so callers observe current contact state
        // (fresher bloom filter, interface up/down flags).
        if let Some(live) = self.node_store.retrieve(&id) {
            return Ok(live);
        }

        let mut node = Node::new(NodeType::from_u32(node_type))
            .with_id(id)
            .with_name(name);
        node.set_max_matches(max_matches);
        node.set_matching_threshold(threshold);
        if let Ok(bf) = Bloomfilter::from_bytes(&bloomfilter) {
            node.set_bloomfilter(bf);
        }

        let mut stmt = self.conn.prepare(
            "SELECT a.name, a.value, na.weight FROM node_attrs na \
             JOIN attributes a ON a.rowid = na.attr_rowid WHERE na.node_rowid = ?1",
        )?;
        let interests = stmt.query_map(params![rowid], |row| {
            Ok(Attribute::with_weight(
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
            ))
        })?;
        for attr in interests {
            let _ = node.add_interest(attr?);
        }

        let mut stmt = self
            .conn
            .prepare("SELECT type, identifier FROM interfaces WHERE node_rowid = ?1")?;
        let interfaces = stmt.query_map(params![rowid], |row| {
            Ok(Interface::new(
                InterfaceType::from_u32(row.get::<_, u32>(0)?),
                row.get::<_, Vec<u8>>(1)?,
            ))
        })?;
        for iface in interfaces {
            node.add_interface(iface?);
        }

        Ok(new_node_ref(node))
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::test_handle;
    use haggle_protocol::Attribute;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn next_event(rx: &mut UnboundedReceiver<(Event, Duration)>) -> Event {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for data store event")
            .expect("event channel closed")
            .0
    }

    fn sample(dir: &Path, topic: &str) -> DataObjectRef {
        let mut dobj = DataObject::from_raw(b"<Haggle/>", dir).expect("empty header");
        let _ = dobj.add_attribute(Attribute::new("Topic", topic));
        dobj.set_create_time("1700000000.000000".parse().expect("timestamp"));
        new_data_object_ref(dobj)
    }

    #[tokio::test]
    async fn second_insert_is_marked_duplicate() {
        let (handle, mut rx, _guards) = test_handle();
        let dir = handle.config().storage_dir.clone();

        let first = sample(&dir, "Weather");
        handle.data_store().insert_data_object(first.clone(), true);
        assert!(matches!(next_event(&mut rx).await, Event::DataObjectNew(_)));
        assert!(matches!(
            next_event(&mut rx).await,
            Event::DataObjectInserted {
                duplicate: false,
                ..
            }
        ));

        // Same content again: marked duplicate, no DataObjectNew, but the
        // completion still fires so policy can update bloom filters.
        let again = sample(&dir, "Weather");
        handle.data_store().insert_data_object(again.clone(), true);
        assert!(matches!(
            next_event(&mut rx).await,
            Event::DataObjectInserted {
                duplicate: true,
                ..
            }
        ));
        assert!(store::read(&again).is_duplicate());
    }

    #[tokio::test]
    async fn non_persistent_objects_last_one_match_pass() {
        let (handle, mut rx, _guards) = test_handle();
        let dir = handle.config().storage_dir.clone();

        let transient = sample(&dir, "Weather");
        store::write(&transient).set_persistent(false);
        handle.data_store().insert_data_object(transient.clone(), true);
        assert!(matches!(next_event(&mut rx).await, Event::DataObjectNew(_)));
        let _ = next_event(&mut rx).await; // inserted completion

        // The row is gone again: a fresh copy does not count as duplicate.
        let again = sample(&dir, "Weather");
        handle.data_store().insert_data_object(again, true);
        assert!(matches!(next_event(&mut rx).await, Event::DataObjectNew(_)));
    }

    #[tokio::test]
    async fn repository_round_trip() {
        let (handle, mut rx, _guards) = test_handle();

        handle
            .data_store()
            .repository_insert(RepositoryEntry::new("TestManager", "alpha", "1"));
        handle
            .data_store()
            .repository_insert(RepositoryEntry::new("TestManager", "beta", "2"));
        // Same (authority, key) updates in place.
        handle
            .data_store()
            .repository_insert(RepositoryEntry::new("TestManager", "alpha", "3"));
        handle
            .data_store()
            .repository_insert(RepositoryEntry::new("OtherManager", "alpha", "x"));

        handle.data_store().repository_read("TestManager", None);
        match next_event(&mut rx).await {
            Event::RepositoryResult { authority, entries } => {
                assert_eq!(authority, "TestManager");
                let mut pairs: Vec<(String, String)> = entries
                    .into_iter()
                    .map(|e| (e.key, e.value))
                    .collect();
                pairs.sort();
                assert_eq!(
                    pairs,
                    vec![
                        ("alpha".to_string(), "3".to_string()),
                        ("beta".to_string(), "2".to_string()),
                    ]
                );
            }
            other => panic!("unexpected event {}", other.name()),
        }

        handle.data_store().repository_delete("TestManager", "alpha");
        handle.data_store().repository_read("TestManager", None);
        match next_event(&mut rx).await {
            Event::RepositoryResult { entries, .. } => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].key, "beta");
            }
            other => panic!("unexpected event {}", other.name()),
        }
    }

    #[tokio::test]
    async fn aging_spares_filtered_data_objects() {
        let (handle, mut rx, _guards) = test_handle();
        let dir = handle.config().storage_dir.clone();

        let fid = handle.allocate_filter_event();
        handle.data_store().insert_filter(
            Filter::new(fid, [Attribute::new("Topic", "Weather")]),
            false,
        );

        let kept = sample(&dir, "Weather");
        let aged = sample(&dir, "Sports");
        let aged_id = store::read(&aged).id();
        handle.data_store().insert_data_object(kept, false);
        handle.data_store().insert_data_object(aged, false);

        // Insert stamps have one-second resolution; get past them.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        handle.data_store().age_data_objects(Duration::ZERO);

        loop {
            match next_event(&mut rx).await {
                Event::DataObjectsDeleted(gone) => {
                    assert_eq!(gone.len(), 1);
                    assert_eq!(store::read(&gone[0]).id(), aged_id);
                    break;
                }
                // Skip the DataObjectNew noise from the inserts.
                _ => continue,
            }
        }
    }
}
