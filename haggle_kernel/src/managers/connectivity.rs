// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Link-agnostic peer discovery.
//!
//! Concrete scanners (Bluetooth inquiry, subnet probing, mdns, ...) are
//! external collaborators: per local interface, the injected factory hands
//! the manager a [`Discoverer`] which runs as its own cancelable task. The
//! manager supplies everything a scanner needs: a learned cache of which
//! remote interfaces speak our protocol, interface reporting with a TTL
//! lifetime policy, and aging that turns expired interfaces into
//! `NeighborInterfaceDown` events.

use crate::{
    event::Event,
    kernel::KernelHandle,
    store::{self, LifetimePolicy},
};
use async_trait::async_trait;
use haggle_protocol::{Interface, InterfaceType};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// What the learned cache knows about a remote interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HaggleStatus {
    /// Confirmed to run our service.
    Haggle,
    /// Probed and found not to.
    NotHaggle,
    /// Never probed; the discoverer should run its link-specific probe.
    Unknown,
}

type StatusCache = Arc<RwLock<HashMap<(InterfaceType, Vec<u8>), HaggleStatus>>>;

/// A link-specific scanner bound to one local interface.
#[async_trait]
pub trait Discoverer: Send + 'static {
    /// Runs discovery until [`DiscovererContext::cancelled`] resolves.
    async fn run(self: Box<Self>, ctx: DiscovererContext);
}

/// Supplies a discoverer per local interface; interfaces without one are
/// simply not scanned.
pub trait DiscovererFactory: Send + Sync + 'static {
    fn discoverer_for(&self, local: &Interface) -> Option<Box<dyn Discoverer>>;
}

/// The manager-side contract a discoverer runs against.
pub struct DiscovererContext {
    local: Interface,
    cache: StatusCache,
    kernel: KernelHandle,
    cancel: watch::Receiver<bool>,
}

impl DiscovererContext {
    pub fn local_interface(&self) -> &Interface {
        &self.local
    }

    /// Consults the learned cache; on `Unknown` the discoverer performs its
    /// link-specific probe and records the outcome.
    pub fn known_interface_status(&self, iface_type: InterfaceType, identifier: &[u8]) -> HaggleStatus {
        self.cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(iface_type, identifier.to_vec()))
            .copied()
            .unwrap_or(HaggleStatus::Unknown)
    }

    pub fn set_interface_status(
        &self,
        iface_type: InterfaceType,
        identifier: &[u8],
        status: HaggleStatus,
    ) {
        let _ = self
            .cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((iface_type, identifier.to_vec()), status);
    }

    /// Reports a confirmed peer interface. A fresh interface raises
    /// `NeighborInterfaceUp`; a known one just has its lifetime refreshed.
    pub fn report_interface(&self, iface: Interface, policy: LifetimePolicy) {
        let (iface_ref, is_new) = self
            .kernel
            .interface_store()
            .add_or_refresh(iface, policy);
        if is_new {
            let snapshot = store::read(&iface_ref).clone();
            debug!("neighbor interface {snapshot} came up via {}", self.local);
            self.kernel.post(Event::NeighborInterfaceUp(snapshot));
        }
    }

    /// One scan cycle finished; `seen` is what the scan observed. Interfaces
    /// whose TTL ran out are reported down.
    pub fn age_interfaces(&self, seen: &[Interface]) {
        for expired in self.kernel.interface_store().age(seen) {
            let snapshot = store::read(&expired).clone();
            debug!("neighbor interface {snapshot} expired");
            self.kernel.post(Event::NeighborInterfaceDown(snapshot));
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves when the manager cancels this discoverer.
    pub async fn cancelled(&mut self) {
        while !*self.cancel.borrow() {
            if self.cancel.changed().await.is_err() {
                return;
            }
        }
    }
}

pub(crate) struct ConnectivityManager {
    kernel: KernelHandle,
    factory: Option<Arc<dyn DiscovererFactory>>,
    cache: StatusCache,
    running: HashMap<(InterfaceType, Vec<u8>), (watch::Sender<bool>, JoinHandle<()>)>,
}

impl ConnectivityManager {
    pub(crate) fn new(kernel: KernelHandle, factory: Option<Arc<dyn DiscovererFactory>>) -> Self {
        Self {
            kernel,
            factory,
            cache: Arc::new(RwLock::new(HashMap::new())),
            running: HashMap::new(),
        }
    }

    pub(crate) async fn handle_event(&mut self, event: &Event) {
        match event {
            Event::LocalInterfaceUp(iface) => self.interface_up(iface),
            Event::LocalInterfaceDown(iface) => self.interface_down(iface),
            Event::PrepareShutdown => {
                for (_, (cancel, _)) in self.running.drain() {
                    let _ = cancel.send(true);
                }
                self.kernel
                    .post(Event::ShutdownReady("ConnectivityManager"));
            }
            _ => {}
        }
    }

    fn interface_up(&mut self, iface: &Interface) {
        let (_, _) = self
            .kernel
            .interface_store()
            .add_or_refresh(iface.clone(), LifetimePolicy::Permanent);

        let Some(factory) = &self.factory else {
            return;
        };
        let Some(discoverer) = factory.discoverer_for(iface) else {
            debug!("no discoverer for local interface {iface}");
            return;
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let ctx = DiscovererContext {
            local: iface.clone(),
            cache: self.cache.clone(),
            kernel: self.kernel.clone(),
            cancel: cancel_rx,
        };
        info!("starting discovery on local interface {iface}");
        let join = tokio::spawn(discoverer.run(ctx));
        if let Some((old_cancel, _)) = self.running.insert(iface.key(), (cancel_tx, join)) {
            let _ = old_cancel.send(true);
        }
    }

    fn interface_down(&mut self, iface: &Interface) {
        if let Some((cancel, _)) = self.running.remove(&iface.key()) {
            info!("stopping discovery on local interface {iface}");
            let _ = cancel.send(true);
        }
        let _ = self.kernel.interface_store().remove(iface);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_resolves_after_cancel() {
        let (tx, rx) = watch::channel(false);
        let (kernel, _rx_events, _guards) = crate::kernel::test_handle();
        let mut ctx = DiscovererContext {
            local: Interface::new(InterfaceType::Ethernet, vec![1]),
            cache: Arc::new(RwLock::new(HashMap::new())),
            kernel,
            cancel: rx,
        };

        assert!(!ctx.is_cancelled());
        let _ = tx.send(true);
        ctx.cancelled().await;
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn report_and_age_post_interface_events() {
        let (kernel, mut events, _guards) = crate::kernel::test_handle();
        let ctx = DiscovererContext {
            local: Interface::new(InterfaceType::Ethernet, vec![0xee]).local(),
            cache: Arc::new(RwLock::new(HashMap::new())),
            kernel,
            cancel: watch::channel(false).1,
        };

        let remote = Interface::new(InterfaceType::Ethernet, vec![0xbb]);
        ctx.report_interface(remote.clone(), LifetimePolicy::Ttl(1));
        let (event, _) = events.recv().await.expect("event");
        assert!(matches!(event, Event::NeighborInterfaceUp(_)));

        // Reporting again refreshes without a second up event.
        ctx.report_interface(remote.clone(), LifetimePolicy::Ttl(1));
        ctx.age_interfaces(&[]);
        let (event, _) = events.recv().await.expect("event");
        assert!(matches!(event, Event::NeighborInterfaceDown(_)));
    }

    #[test]
    fn unknown_status_until_learned() {
        let (kernel, _events, _guards) = crate::kernel::test_handle();
        let ctx = DiscovererContext {
            local: Interface::new(InterfaceType::Ethernet, vec![1]),
            cache: Arc::new(RwLock::new(HashMap::new())),
            kernel,
            cancel: watch::channel(false).1,
        };

        assert_eq!(
            ctx.known_interface_status(InterfaceType::Ethernet, &[9]),
            HaggleStatus::Unknown
        );
        ctx.set_interface_status(InterfaceType::Ethernet, &[9], HaggleStatus::Haggle);
        assert_eq!(
            ctx.known_interface_status(InterfaceType::Ethernet, &[9]),
            HaggleStatus::Haggle
        );
    }
}
