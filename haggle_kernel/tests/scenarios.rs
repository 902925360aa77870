// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! End-to-end scenarios driven through a running kernel.

use eyre::Result;
use haggle_kernel::{
    new_data_object_ref, new_node_ref, DataObjectRef, Event, Filter, KernelBuilder, KernelConfig,
    KernelHandle, MemoryConnector,
};
use haggle_protocol::{
    Attribute, DataObject, DataObjectId, Interface, InterfaceType, Node, NodeId, NodeType,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

async fn wait_for<F, T>(events: &mut broadcast::Receiver<Event>, mut pred: F) -> T
where
    F: FnMut(&Event) -> Option<T>,
{
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::time::sleep_until(deadline) => panic!("timed out waiting for event"),
        };
        match event {
            Ok(event) => {
                if let Some(found) = pred(&event) {
                    return found;
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => panic!("kernel events channel closed"),
        }
    }
}

fn data_object_with_topics(dir: &std::path::Path, topics: &[&str], stamp: &str) -> DataObject {
    let mut dobj = DataObject::new(dir);
    for topic in topics {
        let _ = dobj.add_attribute(Attribute::new("Topic", *topic));
    }
    dobj.set_create_time(stamp.parse().expect("timestamp"));
    dobj
}

fn dobj_id(dobj: &DataObjectRef) -> DataObjectId {
    dobj.read().unwrap_or_else(|e| e.into_inner()).id()
}

struct RunningKernel {
    handle: KernelHandle,
    events: broadcast::Receiver<Event>,
    _tmp: tempfile::TempDir,
}

async fn start_kernel(
    configure: impl FnOnce(KernelBuilder) -> KernelBuilder,
) -> Result<RunningKernel> {
    let tmp = tempfile::tempdir()?;
    let builder = KernelBuilder::new(KernelConfig::new(tmp.path()));
    let kernel = configure(builder).build()?;
    let handle = kernel.handle();
    let events = handle.subscribe();
    let _join = tokio::spawn(kernel.run());
    Ok(RunningKernel {
        handle,
        events,
        _tmp: tmp,
    })
}

/// A registered filter delivers exactly one event carrying exactly the
/// matching insertion.
#[tokio::test]
async fn filter_match_on_insert() -> Result<()> {
    let mut running = start_kernel(|b| b).await?;
    let handle = &running.handle;
    let storage = handle.config().storage_dir.clone();

    let fid = handle.allocate_filter_event();
    handle.data_store().insert_filter(
        Filter::new(fid, [Attribute::new("Topic", "Weather")]),
        false,
    );

    let d1 = data_object_with_topics(&storage, &["Weather"], "1700000000.000000");
    let d2 = data_object_with_topics(&storage, &["Sports"], "1700000001.000000");
    let d1_id = d1.id();
    let d2_id = d2.id();
    handle
        .data_store()
        .insert_data_object(new_data_object_ref(d1), false);
    handle
        .data_store()
        .insert_data_object(new_data_object_ref(d2), false);

    let delivered = wait_for(&mut running.events, |event| match event {
        Event::FilterMatch {
            event,
            data_objects,
        } if *event == fid => Some(data_objects.clone()),
        _ => None,
    })
    .await;
    assert_eq!(delivered.len(), 1);
    assert_eq!(dobj_id(&delivered[0]), d1_id);

    // Both insertions completed once the second DataObjectNew shows; no
    // further filter delivery may exist by then.
    wait_for(&mut running.events, |event| match event {
        Event::DataObjectNew(dobj) if dobj_id(dobj) == d2_id => Some(()),
        _ => None,
    })
    .await;
    assert!(matches!(
        running.events.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));

    handle.shutdown();
    Ok(())
}

/// Ranked node-to-data query plus bloom filter suppression.
#[tokio::test]
async fn node_query_ranks_and_bloomfilter_suppresses() -> Result<()> {
    let mut running = start_kernel(|b| b).await?;
    let handle = &running.handle;
    let storage = handle.config().storage_dir.clone();

    let d1 = data_object_with_topics(&storage, &["Weather"], "1700000001.000000");
    let d2 = data_object_with_topics(&storage, &["News"], "1700000002.000000");
    let d3 = data_object_with_topics(&storage, &["Sports"], "1700000003.000000");
    let d4 = data_object_with_topics(&storage, &["Weather", "News"], "1700000004.000000");
    let (d1_id, d4_id) = (d1.id(), d4.id());
    for dobj in [d1, d2, d3, d4] {
        handle
            .data_store()
            .insert_data_object(new_data_object_ref(dobj), false);
    }

    let mut node = Node::new(NodeType::Peer).with_name("querier");
    let _ = node.add_interest(Attribute::with_weight("Topic", "Weather", 3));
    let _ = node.add_interest(Attribute::with_weight("Topic", "News", 1));
    node.set_matching_threshold(50);
    node.set_max_matches(2);
    let node = new_node_ref(node);
    let node_id = node.read().unwrap_or_else(|e| e.into_inner()).id();

    handle.data_store().insert_node(node.clone());
    handle.data_store().data_object_query(node.clone(), 1);

    let result = wait_for(&mut running.events, |event| match event {
        Event::DataObjectQueryResult {
            node: for_node,
            data_objects,
        } if for_node.read().unwrap_or_else(|e| e.into_inner()).id() == node_id => {
            Some(data_objects.clone())
        }
        _ => None,
    })
    .await;

    // Ratios: d4 = 100, d1 = 75, d2 = 25 (below threshold), d3 no match.
    let ids: Vec<_> = result.iter().map(dobj_id).collect();
    assert_eq!(ids, vec![d4_id, d1_id]);

    // Suppression: once d4 sits in the node's bloom filter it is never
    // proposed again.
    node.write()
        .unwrap_or_else(|e| e.into_inner())
        .bloomfilter_mut()
        .add(d4_id.as_bytes());
    handle.data_store().data_object_query(node.clone(), 1);

    let result = wait_for(&mut running.events, |event| match event {
        Event::DataObjectQueryResult {
            node: for_node,
            data_objects,
        } if for_node.read().unwrap_or_else(|e| e.into_inner()).id() == node_id => {
            Some(data_objects.clone())
        }
        _ => None,
    })
    .await;
    let ids: Vec<_> = result.iter().map(dobj_id).collect();
    assert_eq!(ids, vec![d1_id]);

    handle.shutdown();
    Ok(())
}

/// The full neighbor contact sequence: interface up, placeholder node,
/// description exchange, then interest-matched content flowing out over the
/// contact's transport.
#[tokio::test]
async fn neighbor_contact_sequence() -> Result<()> {
    let connector = Arc::new(MemoryConnector::new());

    let neighbor_iface = Interface::new(InterfaceType::Ethernet, vec![0xbb]);
    let far_end = connector.add_endpoint(&neighbor_iface);

    let connector_for_builder = connector.clone();
    let mut running =
        start_kernel(move |b| b.connector(connector_for_builder)).await?;
    let handle = running.handle.clone();
    let storage = handle.config().storage_dir.clone();

    // Content the neighbor will turn out to be interested in.
    let d1 = data_object_with_topics(&storage, &["Weather"], "1700000000.000000");
    let d1_id = d1.id();
    handle
        .data_store()
        .insert_data_object(new_data_object_ref(d1), false);

    // The link layer reports the neighbor's interface.
    handle.post(Event::NeighborInterfaceUp(neighbor_iface.clone().up()));

    // A placeholder contact appears, still undefined.
    let placeholder_id = wait_for(&mut running.events, |event| match event {
        Event::NodeContactNew(node) => {
            let node = node.read().unwrap_or_else(|e| e.into_inner());
            assert_eq!(node.node_type(), NodeType::Undefined);
            assert!(node.has_interface(&neighbor_iface));
            Some(node.id())
        }
        _ => None,
    })
    .await;

    // This node's description goes out to the placeholder before anything
    // else.
    wait_for(&mut running.events, |event| match event {
        Event::DataObjectSend {
            data_object,
            targets,
        } => {
            let is_description = data_object
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .is_node_description();
            assert!(is_description, "description must precede content");
            let target = targets[0].read().unwrap_or_else(|e| e.into_inner());
            assert_eq!(target.id(), placeholder_id);
            Some(())
        }
        _ => None,
    })
    .await;

    // The neighbor's own description arrives over the contact.
    let mut neighbor = Node::new(NodeType::Peer).with_name("bob");
    let _ = neighbor.add_interest(Attribute::new("Topic", "Weather"));
    neighbor.add_interface(neighbor_iface.clone());
    neighbor.set_create_time("1700000100.000000".parse()?);
    let neighbor_id = neighbor.id();
    let mut description = neighbor.to_data_object(&storage)?;
    description.set_remote_interface(neighbor_iface.clone().up());
    handle.post(Event::DataObjectIncoming(new_data_object_ref(description)));

    // The placeholder is promoted with the freshest description.
    wait_for(&mut running.events, |event| match event {
        Event::NodeUpdated { node, .. } => {
            let node = node.read().unwrap_or_else(|e| e.into_inner());
            assert_eq!(node.node_type(), NodeType::Peer);
            assert_eq!(node.id(), neighbor_id);
            Some(())
        }
        _ => None,
    })
    .await;

    // Forwarding resolves the neighbor's interests and queues the match.
    wait_for(&mut running.events, |event| match event {
        Event::DataObjectSend {
            data_object,
            targets,
        } if dobj_id(data_object) == d1_id => {
            let target = targets[0].read().unwrap_or_else(|e| e.into_inner());
            assert_eq!(target.id(), neighbor_id);
            Some(())
        }
        _ => None,
    })
    .await;

    // The content really leaves over the contact's transport; reassemble
    // the byte stream on the far end until the interest match shows up.
    wait_for(&mut running.events, |event| match event {
        Event::DataObjectSendSuccessful { data_object, .. } if dobj_id(data_object) == d1_id => {
            Some(())
        }
        _ => None,
    })
    .await;

    let received = read_data_objects(far_end, &storage).await?;
    assert!(
        received.iter().any(|d| d.id() == d1_id),
        "interest match must arrive on the wire"
    );
    assert!(
        received.iter().any(|d| d.is_node_description()),
        "description must arrive on the wire"
    );

    handle.shutdown();
    Ok(())
}

/// Drains complete data objects from the far end of an in-memory contact.
async fn read_data_objects(
    mut far_end: tokio::io::DuplexStream,
    storage: &std::path::Path,
) -> Result<Vec<DataObject>> {
    use tokio::io::AsyncReadExt;

    let mut received = Vec::new();
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = [0u8; 4096];
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;

    'read: loop {
        let mut ingest = DataObject::ingest(storage, None, None);
        while !ingest.is_complete() {
            if pending.is_empty() {
                let n = tokio::select! {
                    n = far_end.read(&mut buf) => n?,
                    _ = tokio::time::sleep_until(deadline) => break 'read,
                };
                if n == 0 {
                    break 'read;
                }
                pending.extend_from_slice(&buf[..n]);
            }
            let put = ingest.put_data(&pending)?;
            let _ = pending.drain(..put.consumed);
        }
        received.push(ingest.into_data_object()?);
        if received.len() >= 3 {
            break;
        }
    }
    Ok(received)
}

/// Node ids survive the description round trip, so a node rebuilt from its
/// own description is the same node.
#[tokio::test]
async fn node_identity_is_stable_across_descriptions() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut node = Node::new(NodeType::Peer).with_name("carol").with_id(NodeId::new([7u8; 20]));
    let _ = node.add_interest(Attribute::new("Topic", "News"));
    node.set_create_time("1700000000.000000".parse()?);

    let description = node.to_data_object(tmp.path())?;
    let wire = description.to_wire();
    let parsed = DataObject::from_raw(&wire, tmp.path())?;
    let rebuilt = Node::from_data_object(&parsed)?;

    assert_eq!(rebuilt.id(), node.id());
    assert_eq!(parsed.id(), description.id());
    Ok(())
}
