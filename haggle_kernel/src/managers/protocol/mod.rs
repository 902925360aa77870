// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Per-contact transport state machines.
//!
//! Every peer contact is served by its own task. The client flavor owns a
//! send queue and walks Idle → Connecting → Connected → Sending → Done (or
//! Error); sends on one contact complete strictly in queue order, so two
//! data objects never interleave on a session. The server flavor sits in
//! Listening, accepts transports, and feeds inbound bytes through streaming
//! ingest until whole data objects fall out.

mod transport;

pub use transport::{MemoryConnector, ProtocolTransport, TcpConnector, TransportConnector};

use crate::{
    error::{Error, Result},
    event::Event,
    kernel::KernelHandle,
    store::{self, new_data_object_ref, DataObjectRef, NodeRef},
};
use haggle_protocol::{Address, DataObject, Interface, InterfaceType};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use transport::TRANSPORT_CHUNK_SIZE;

/// Where a protocol task currently stands; logged on every transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ProtocolState {
    Idle,
    Connecting,
    Connected,
    Sending,
    Receiving,
    Listening,
    Done,
    Error,
}

struct SendItem {
    data_object: DataObjectRef,
    node: NodeRef,
}

struct ClientHandle {
    tx: mpsc::UnboundedSender<SendItem>,
    cancel: watch::Sender<bool>,
}

pub(crate) struct ProtocolManager {
    kernel: KernelHandle,
    connector: Arc<dyn TransportConnector>,
    clients: HashMap<(InterfaceType, Vec<u8>), ClientHandle>,
    /// Global cancel observed by the listener and all receiver tasks.
    shutdown: watch::Sender<bool>,
    listener: Option<JoinHandle<()>>,
}

impl ProtocolManager {
    pub(crate) fn new(kernel: KernelHandle, connector: Arc<dyn TransportConnector>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            kernel,
            connector,
            clients: HashMap::new(),
            shutdown,
            listener: None,
        }
    }

    pub(crate) async fn handle_event(&mut self, event: &Event) {
        match event {
            Event::LocalInterfaceUp(iface) => {
                if let Some(addr) = iface.socket_address() {
                    self.spawn_listener(iface.clone(), addr);
                }
            }
            Event::DataObjectSend {
                data_object,
                targets,
            } => {
                for node in targets {
                    self.send_to(data_object.clone(), node.clone());
                }
            }
            Event::NeighborInterfaceDown(iface) => {
                if let Some(client) = self.clients.remove(&iface.key()) {
                    debug!("aborting protocol for {iface}, interface went down");
                    let _ = client.cancel.send(true);
                }
            }
            Event::PrepareShutdown => {
                self.kernel.post(Event::ShutdownReady("ProtocolManager"));
            }
            Event::Shutdown => {
                let _ = self.shutdown.send(true);
                for (_, client) in self.clients.drain() {
                    let _ = client.cancel.send(true);
                }
                if let Some(listener) = self.listener.take() {
                    listener.abort();
                }
            }
            _ => {}
        }
    }

    /// Registers an already connected inbound transport (an accepted socket
    /// or an in-memory pipe) and serves it with a receiver task.
    pub(crate) fn add_incoming_transport(
        &self,
        transport: Box<dyn ProtocolTransport>,
        local: Option<Interface>,
        remote: Interface,
    ) {
        let _join = spawn_receiver(
            self.kernel.clone(),
            transport,
            local,
            remote,
            self.shutdown.subscribe(),
        );
    }

    fn send_to(&mut self, data_object: DataObjectRef, node: NodeRef) {
        let remote = {
            let n = store::read(&node);
            n.interfaces()
                .iter()
                .find(|i| i.is_up())
                .or_else(|| n.interfaces().first())
                .cloned()
        };

        let Some(remote) = remote else {
            warn!(
                "no interface to reach node {}, failing send",
                store::read(&node).id()
            );
            self.kernel.post(Event::DataObjectSendFailure {
                data_object,
                node,
            });
            return;
        };

        let item = SendItem { data_object, node };
        let key = remote.key();
        let client = self
            .clients
            .entry(key)
            .or_insert_with(|| spawn_client(self.kernel.clone(), self.connector.clone(), remote));

        if let Err(mpsc::error::SendError(item)) = client.tx.send(item) {
            // The task already exited; anything still queued was failed by
            // the task itself, only this item needs reporting.
            self.kernel.post(Event::DataObjectSendFailure {
                data_object: item.data_object,
                node: item.node,
            });
        }
    }

    fn spawn_listener(&mut self, local: Interface, addr: SocketAddr) {
        if self.listener.is_some() {
            return;
        }
        let kernel = self.kernel.clone();
        let mut cancel = self.shutdown.subscribe();
        let join = tokio::spawn(async move {
            let listener = match TcpListener::bind(addr).await {
                Ok(listener) => listener,
                Err(err) => {
                    error!("could not bind protocol listener on {addr}: {err}");
                    return;
                }
            };
            info!("protocol listener in state {:?} on {addr}", ProtocolState::Listening);

            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let remote = interface_for_peer(&local, peer);
                            debug!("accepted contact from {peer}");
                            let _join = spawn_receiver(
                                kernel.clone(),
                                Box::new(stream),
                                Some(local.clone()),
                                remote,
                                cancel.clone(),
                            );
                        }
                        Err(err) => {
                            warn!("accept failed: {err}");
                        }
                    },
                    _ = wait_cancelled(&mut cancel) => break,
                }
            }
        });
        self.listener = Some(join);
    }
}

/// Synthesizes the provenance interface for an accepted peer socket.
fn interface_for_peer(local: &Interface, peer: SocketAddr) -> Interface {
    let mut identifier = match peer.ip() {
        std::net::IpAddr::V4(ip) => ip.octets().to_vec(),
        std::net::IpAddr::V6(ip) => ip.octets().to_vec(),
    };
    identifier.extend_from_slice(&peer.port().to_be_bytes());
    Interface::new(local.iface_type(), identifier)
        .with_address(Address::Socket(peer))
        .up()
}

fn spawn_client(
    kernel: KernelHandle,
    connector: Arc<dyn TransportConnector>,
    remote: Interface,
) -> ClientHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let _join = tokio::spawn(client_task(kernel, connector, remote, rx, cancel_rx));
    ClientHandle {
        tx,
        cancel: cancel_tx,
    }
}

async fn client_task(
    kernel: KernelHandle,
    connector: Arc<dyn TransportConnector>,
    remote: Interface,
    mut rx: mpsc::UnboundedReceiver<SendItem>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut transport: Option<Box<dyn ProtocolTransport>> = None;
    let mut state = ProtocolState::Idle;
    trace!("protocol client for {remote} in state {state:?}");

    loop {
        let item = tokio::select! {
            item = rx.recv() => match item {
                Some(item) => item,
                None => {
                    state = ProtocolState::Done;
                    break;
                }
            },
            _ = wait_cancelled(&mut cancel) => {
                state = ProtocolState::Error;
                break;
            }
        };

        match send_with_retries(&kernel, &*connector, &remote, &mut transport, &item, &mut cancel)
            .await
        {
            Ok(()) => {
                kernel.post(Event::DataObjectSendSuccessful {
                    data_object: item.data_object,
                    node: item.node,
                });
            }
            Err(err) => {
                warn!("send to {remote} failed: {err}");
                kernel.post(Event::DataObjectSendFailure {
                    data_object: item.data_object,
                    node: item.node,
                });
                if matches!(err, Error::Cancelled) {
                    state = ProtocolState::Error;
                    break;
                }
            }
        }
    }

    // Whatever is still queued can no longer be sent on this contact.
    while let Ok(item) = rx.try_recv() {
        kernel.post(Event::DataObjectSendFailure {
            data_object: item.data_object,
            node: item.node,
        });
    }
    if let Some(mut transport) = transport.take() {
        let _ = transport.close().await;
    }
    trace!("protocol client for {remote} in state {state:?}");
}

async fn send_with_retries(
    kernel: &KernelHandle,
    connector: &dyn TransportConnector,
    remote: &Interface,
    transport: &mut Option<Box<dyn ProtocolTransport>>,
    item: &SendItem,
    cancel: &mut watch::Receiver<bool>,
) -> Result<()> {
    let config = kernel.config();
    let mut last_err = None;

    for attempt in 0..=config.max_send_retries {
        if *cancel.borrow() {
            return Err(Error::Cancelled);
        }
        if attempt > 0 {
            trace!("send retry {attempt} to {remote}");
        }

        if transport.is_none() {
            trace!("protocol client for {remote} in state {:?}", ProtocolState::Connecting);
            match connector.connect(remote).await {
                Ok(connected) => {
                    trace!("protocol client for {remote} in state {:?}", ProtocolState::Connected);
                    *transport = Some(connected);
                }
                Err(err) => {
                    last_err = Some(Error::from(err));
                    continue;
                }
            }
        }

        let stream = transport.as_mut().expect("connected above");
        trace!("protocol client for {remote} in state {:?}", ProtocolState::Sending);
        match tokio::time::timeout(config.send_timeout, stream_object(stream, &item.data_object))
            .await
        {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(err)) => {
                // The session is suspect after a mid-stream error.
                *transport = None;
                last_err = Some(err);
            }
            Err(_) => {
                *transport = None;
                last_err = Some(Error::SendTimeout {
                    data_object: store::read(&item.data_object).id().to_string(),
                    node: store::read(&item.node).id().to_string(),
                });
            }
        }
    }

    Err(last_err.unwrap_or(Error::Cancelled))
}

/// Writes the metadata header followed by the payload stream.
async fn stream_object(
    transport: &mut Box<dyn ProtocolTransport>,
    data_object: &DataObjectRef,
) -> Result<()> {
    // Work on a clone so no lock is held across writes.
    let snapshot = store::read(data_object).clone();
    let mut retriever = snapshot.retriever()?;

    let mut buf = [0u8; TRANSPORT_CHUNK_SIZE];
    loop {
        let n = retriever.retrieve(&mut buf, false)?;
        if n == 0 {
            return Ok(());
        }
        transport.send_all(&buf[..n]).await?;
    }
}

/// Serves one inbound transport: streaming ingest, one data object after
/// another, until the peer closes or the engine shuts down.
fn spawn_receiver(
    kernel: KernelHandle,
    mut transport: Box<dyn ProtocolTransport>,
    local: Option<Interface>,
    remote: Interface,
    mut cancel: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let storage_dir = kernel.config().storage_dir.clone();
        let mut pending: Vec<u8> = Vec::new();
        let mut buf = vec![0u8; TRANSPORT_CHUNK_SIZE];
        trace!("protocol receiver for {remote} in state {:?}", ProtocolState::Receiving);

        'contact: loop {
            let mut ingest =
                DataObject::ingest(&storage_dir, local.clone(), Some(remote.clone()));
            let mut fed_any = false;

            while !ingest.is_complete() {
                if pending.is_empty() {
                    let n = tokio::select! {
                        read = transport.recv(&mut buf) => match read {
                            Ok(n) => n,
                            Err(err) => {
                                warn!("receive from {remote} failed: {err}");
                                break 'contact;
                            }
                        },
                        _ = wait_cancelled(&mut cancel) => break 'contact,
                    };
                    if n == 0 {
                        if fed_any {
                            warn!("contact {remote} closed mid data object");
                        }
                        break 'contact;
                    }
                    pending.extend_from_slice(&buf[..n]);
                }

                match ingest.put_data(&pending) {
                    Ok(put) => {
                        fed_any = true;
                        let _ = pending.drain(..put.consumed);
                    }
                    Err(err) => {
                        // Fatal to the ingest; drop the contact, nothing
                        // surfaces to the peer beyond the reset.
                        warn!("ingest from {remote} failed: {err}");
                        break 'contact;
                    }
                }
            }

            match ingest.into_data_object() {
                Ok(dobj) => {
                    debug!("received data object {} from {remote}", dobj.id());
                    let dobj = new_data_object_ref(dobj);
                    kernel.post(Event::DataObjectIncoming(dobj.clone()));
                    kernel.post(Event::DataObjectReceived(dobj));
                }
                Err(err) => {
                    warn!("could not finish ingest from {remote}: {err}");
                    break 'contact;
                }
            }
        }

        let _ = transport.close().await;
        trace!("protocol receiver for {remote} in state {:?}", ProtocolState::Done);
    })
}

async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    while !*cancel.borrow() {
        if cancel.changed().await.is_err() {
            // Sender gone means we will never be cancelled; park forever so
            // the select arms driving real work keep running.
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haggle_protocol::Attribute;

    #[tokio::test]
    async fn receiver_reassembles_back_to_back_objects() -> eyre::Result<()> {
        let (kernel, mut events, _guards) = crate::kernel::test_handle();
        let dir = tempfile::tempdir()?;

        let mut first = DataObject::new(dir.path());
        let _ = first.add_attribute(Attribute::new("Topic", "Weather"));
        first.set_create_time("1700000000.000000".parse()?);

        let payload_path = dir.path().join("p.bin");
        std::fs::write(&payload_path, b"0123456789")?;
        let mut second = DataObject::new(dir.path());
        let _ = second.add_attribute(Attribute::new("Topic", "Sports"));
        second.set_create_time("1700000001.000000".parse()?);
        second.set_file(&payload_path)?;

        let mut wire = first.to_wire();
        wire.extend_from_slice(&second.to_wire());
        wire.extend_from_slice(b"0123456789");

        let (mut ours, theirs) = tokio::io::duplex(1024);
        let remote = Interface::new(InterfaceType::Ethernet, vec![0xbb]).up();
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let join = spawn_receiver(kernel, Box::new(theirs), None, remote, cancel_rx);

        use tokio::io::AsyncWriteExt;
        ours.write_all(&wire).await?;
        ours.shutdown().await?;
        drop(ours);

        let mut incoming = Vec::new();
        while let Ok(Some((event, _))) =
            tokio::time::timeout(std::time::Duration::from_secs(5), events.recv()).await
        {
            if let Event::DataObjectIncoming(dobj) = event {
                incoming.push(store::read(&dobj).id());
                if incoming.len() == 2 {
                    break;
                }
            }
        }
        let _ = join.await;

        assert_eq!(incoming, vec![first.id(), second.id()]);
        Ok(())
    }

    #[tokio::test]
    async fn memory_connector_round_trip() -> eyre::Result<()> {
        let connector = MemoryConnector::new();
        let remote = Interface::new(InterfaceType::Ethernet, vec![0xcc]);
        let mut far_end = connector.add_endpoint(&remote);

        let mut transport = connector.connect(&remote).await?;
        transport.send_all(b"hello").await?;

        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 5];
        far_end.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"hello");

        assert!(connector.connect(&remote).await.is_err());
        Ok(())
    }
}
