// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The kernel: one task, one event heap, a fixed set of managers.
//!
//! There are no hidden globals; a [`Kernel`] is built explicitly and hands
//! out cloneable [`KernelHandle`]s that managers and workers use to post
//! events, talk to the data store, and read the shared stores. The run loop
//! sleeps until the next due event or the next cross-task post, dispatches
//! each due event to every manager in fixed order, and coordinates the
//! prepare-shutdown / shutdown handshake.

use crate::{
    config::KernelConfig,
    datastore::{self, DataStoreHandle},
    error::Result,
    event::{
        Event, EventQueue, EventSender, FilterEventId, KernelEventsChannel, FILTER_EVENT_ID_BASE,
    },
    managers::{
        connectivity::{ConnectivityManager, DiscovererFactory},
        data_manager::DataManager,
        forwarder::{ForwarderModule, ForwarderRank},
        forwarding::ForwardingManager,
        node_manager::NodeManager,
        protocol::{ProtocolManager, ProtocolTransport, TcpConnector, TransportConnector},
        MANAGER_COUNT,
    },
    store::{self, new_node_ref, InterfaceStore, NodeRef, NodeStore},
};
use haggle_protocol::{Bloomfilter, Interface, Node, NodeType};
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

struct HandleInner {
    config: KernelConfig,
    events: EventSender,
    events_channel: KernelEventsChannel,
    data_store: DataStoreHandle,
    node_store: Arc<NodeStore>,
    interface_store: Arc<InterfaceStore>,
    this_node: NodeRef,
    next_filter_event: AtomicU32,
}

/// Cloneable access to the engine, injected into managers at construction
/// and handed to workers.
#[derive(Clone)]
pub struct KernelHandle {
    inner: Arc<HandleInner>,
}

impl KernelHandle {
    pub fn config(&self) -> &KernelConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &EventSender {
        &self.inner.events
    }

    pub fn post(&self, event: Event) {
        self.inner.events.post(event);
    }

    pub fn post_delayed(&self, event: Event, delay: Duration) {
        self.inner.events.post_delayed(event, delay);
    }

    pub fn data_store(&self) -> &DataStoreHandle {
        &self.inner.data_store
    }

    pub fn node_store(&self) -> &NodeStore {
        &self.inner.node_store
    }

    pub fn interface_store(&self) -> &InterfaceStore {
        &self.inner.interface_store
    }

    /// The local node's shared record.
    pub fn this_node(&self) -> NodeRef {
        self.inner.this_node.clone()
    }

    /// Observe every dispatched event.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events_channel.subscribe()
    }

    /// Hands out a fresh filter event id from the reserved range.
    pub fn allocate_filter_event(&self) -> FilterEventId {
        self.inner.next_filter_event.fetch_add(1, Ordering::Relaxed)
    }

    /// Starts the shutdown handshake.
    pub fn shutdown(&self) {
        self.post(Event::PrepareShutdown);
    }

    pub(crate) fn events_channel(&self) -> &KernelEventsChannel {
        &self.inner.events_channel
    }
}

/// Builds a [`Kernel`] with its managers and workers.
pub struct KernelBuilder {
    config: KernelConfig,
    forwarder: Option<ForwarderModule>,
    discoverer_factory: Option<Arc<dyn DiscovererFactory>>,
    connector: Option<Arc<dyn TransportConnector>>,
    local_interfaces: Vec<Interface>,
}

impl KernelBuilder {
    pub fn new(config: KernelConfig) -> Self {
        Self {
            config,
            forwarder: None,
            discoverer_factory: None,
            connector: None,
            local_interfaces: Vec::new(),
        }
    }

    /// Overrides the default RANK forwarder.
    pub fn forwarder(mut self, module: ForwarderModule) -> Self {
        self.forwarder = Some(module);
        self
    }

    pub fn discoverer_factory(mut self, factory: Arc<dyn DiscovererFactory>) -> Self {
        self.discoverer_factory = Some(factory);
        self
    }

    /// Overrides the default TCP connector.
    pub fn connector(mut self, connector: Arc<dyn TransportConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// A local interface announced at startup; this node's identity derives
    /// from the set of these.
    pub fn local_interface(mut self, iface: Interface) -> Self {
        self.local_interfaces.push(iface);
        self
    }

    pub fn build(self) -> Result<Kernel> {
        std::fs::create_dir_all(&self.config.storage_dir)?;

        let (events, rx) = EventSender::new();
        let events_channel = KernelEventsChannel::default();
        let node_store = Arc::new(NodeStore::new());
        let interface_store = Arc::new(InterfaceStore::new());

        let mut this_node = Node::new(NodeType::Peer).with_name(&self.config.node_name);
        this_node.set_max_matches(self.config.max_matches);
        this_node.set_matching_threshold(self.config.matching_threshold);
        this_node.set_bloomfilter(Bloomfilter::new(
            self.config.bloomfilter_error_rate,
            self.config.bloomfilter_capacity,
        ));
        for iface in &self.local_interfaces {
            let mut iface = iface.clone();
            iface.set_up(true);
            this_node.add_interface(iface);
        }
        if !self.local_interfaces.is_empty() {
            this_node.calc_id_from_interfaces();
        }
        let this_node = new_node_ref(this_node);
        info!(
            "this node is {} ({})",
            store::read(&this_node).id(),
            self.config.node_name
        );

        let (data_store, datastore_join) = datastore::spawn(
            &self.config.datastore_path(),
            self.config.storage_dir.clone(),
            events.clone(),
            node_store.clone(),
        )?;

        let handle = KernelHandle {
            inner: Arc::new(HandleInner {
                config: self.config,
                events,
                events_channel,
                data_store,
                node_store,
                interface_store,
                this_node,
                next_filter_event: AtomicU32::new(FILTER_EVENT_ID_BASE),
            }),
        };

        let forwarder = self.forwarder.unwrap_or_else(|| {
            let this_id = store::read(&handle.this_node()).id();
            ForwarderModule::Direct(Box::new(ForwarderRank::new(
                handle.events().clone(),
                this_id,
            )))
        });
        let connector: Arc<dyn TransportConnector> = self
            .connector
            .unwrap_or_else(|| Arc::new(TcpConnector));

        Ok(Kernel {
            connectivity: ConnectivityManager::new(handle.clone(), self.discoverer_factory),
            protocol: ProtocolManager::new(handle.clone(), connector),
            node_manager: NodeManager::new(handle.clone()),
            forwarding: ForwardingManager::new(handle.clone(), forwarder),
            data_manager: DataManager::new(handle.clone()),
            handle,
            queue: EventQueue::new(),
            rx,
            datastore_join: Some(datastore_join),
            ready: HashSet::new(),
            local_interfaces: self.local_interfaces,
        })
    }
}

/// The engine. [`Kernel::run`] consumes it; everything else goes through a
/// [`KernelHandle`].
pub struct Kernel {
    handle: KernelHandle,
    queue: EventQueue,
    rx: mpsc::UnboundedReceiver<(Event, Duration)>,
    connectivity: ConnectivityManager,
    protocol: ProtocolManager,
    node_manager: NodeManager,
    forwarding: ForwardingManager,
    data_manager: DataManager,
    datastore_join: Option<std::thread::JoinHandle<()>>,
    ready: HashSet<&'static str>,
    local_interfaces: Vec<Interface>,
}

impl Kernel {
    pub fn handle(&self) -> KernelHandle {
        self.handle.clone()
    }

    /// Registers an already connected inbound transport with the protocol
    /// manager (an accepted socket, or an in-memory pipe in tests).
    pub fn add_incoming_transport(
        &self,
        transport: Box<dyn ProtocolTransport>,
        local: Option<Interface>,
        remote: Interface,
    ) {
        self.protocol.add_incoming_transport(transport, local, remote);
    }

    /// Runs until shutdown completes.
    pub async fn run(mut self) {
        self.queue.push(Event::PrepareStartup, Duration::ZERO);
        self.queue.push(Event::Startup, Duration::ZERO);
        let local_interfaces = std::mem::take(&mut self.local_interfaces);
        for iface in local_interfaces {
            self.queue.push(Event::LocalInterfaceUp(iface), Duration::ZERO);
        }

        info!("kernel running");
        'kernel: loop {
            // Merge everything workers posted since the last pass.
            while let Ok((event, delay)) = self.rx.try_recv() {
                self.queue.push(event, delay);
            }

            if let Some(event) = self.queue.pop_due(Instant::now()) {
                if self.dispatch(event).await.is_break() {
                    break 'kernel;
                }
                continue;
            }

            // Nothing due: sleep until the next deadline or the next post.
            match self.queue.next_deadline() {
                Some(deadline) => tokio::select! {
                    posted = self.rx.recv() => match posted {
                        Some((event, delay)) => self.queue.push(event, delay),
                        None => break 'kernel,
                    },
                    _ = tokio::time::sleep_until(deadline) => {}
                },
                None => match self.rx.recv().await {
                    Some((event, delay)) => self.queue.push(event, delay),
                    None => break 'kernel,
                },
            }
        }

        // Drain the data store worker last; managers already flushed their
        // state into it during the shutdown handshake.
        self.handle.data_store().stop();
        if let Some(join) = self.datastore_join.take() {
            let _ = tokio::task::spawn_blocking(move || join.join()).await;
        }
        info!("kernel exited");
    }

    async fn dispatch(&mut self, event: Event) -> ControlFlow<()> {
        trace!("dispatching {} ({} queued)", event.name(), self.queue.len());
        self.handle.events_channel().broadcast(&event);

        self.connectivity.handle_event(&event).await;
        self.protocol.handle_event(&event).await;
        self.node_manager.handle_event(&event).await;
        self.forwarding.handle_event(&event).await;
        self.data_manager.handle_event(&event).await;

        match event {
            Event::ShutdownReady(name) => {
                let _ = self.ready.insert(name);
                if self.ready.len() >= MANAGER_COUNT {
                    debug!("all managers ready, shutting down");
                    self.handle.post(Event::Shutdown);
                }
            }
            Event::Shutdown => return ControlFlow::Break(()),
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

#[cfg(test)]
pub(crate) fn test_handle() -> (
    KernelHandle,
    mpsc::UnboundedReceiver<(Event, Duration)>,
    TestHandleGuards,
) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = KernelConfig::new(tmp.path());

    let (events, rx) = EventSender::new();
    let node_store = Arc::new(NodeStore::new());
    let interface_store = Arc::new(InterfaceStore::new());
    let this_node = new_node_ref(Node::new(NodeType::Peer).with_name("test-node"));

    let (data_store, join) = datastore::spawn(
        &config.datastore_path(),
        config.storage_dir.clone(),
        events.clone(),
        node_store.clone(),
    )
    .expect("data store");

    let handle = KernelHandle {
        inner: Arc::new(HandleInner {
            config,
            events,
            events_channel: KernelEventsChannel::default(),
            data_store,
            node_store,
            interface_store,
            this_node,
            next_filter_event: AtomicU32::new(FILTER_EVENT_ID_BASE),
        }),
    };

    let guards = TestHandleGuards {
        _tmp: tmp,
        handle: handle.clone(),
        join: Some(join),
    };
    (handle, rx, guards)
}

/// Keeps the scratch dir and the data store worker alive for a test's
/// duration, then drains the worker.
#[cfg(test)]
pub(crate) struct TestHandleGuards {
    _tmp: tempfile::TempDir,
    handle: KernelHandle,
    join: Option<std::thread::JoinHandle<()>>,
}

#[cfg(test)]
impl Drop for TestHandleGuards {
    fn drop(&mut self) {
        self.handle.data_store().stop();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}
