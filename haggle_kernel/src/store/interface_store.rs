// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use super::{new_interface_ref, read, write, InterfaceRef};
use haggle_protocol::{Interface, InterfaceType};
use std::sync::RwLock;

/// How long a reported interface stays alive in the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifetimePolicy {
    /// Stays until explicitly removed (local interfaces).
    Permanent,
    /// Counter decremented on every scan that misses the interface; the
    /// interface expires when it reaches zero.
    Ttl(u32),
}

struct StoredInterface {
    iface: InterfaceRef,
    policy: LifetimePolicy,
    ttl_left: u32,
}

/// All interfaces the engine currently knows, keyed by (type, identifier).
#[derive(Default)]
pub struct InterfaceStore {
    inner: RwLock<Vec<StoredInterface>>,
}

impl InterfaceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a confirmed interface or refreshes its lifetime. Returns the
    /// shared handle and whether the interface is new to the store.
    pub fn add_or_refresh(
        &self,
        mut iface: Interface,
        policy: LifetimePolicy,
    ) -> (InterfaceRef, bool) {
        let mut inner = write(&self.inner);
        if let Some(stored) = inner
            .iter_mut()
            .find(|s| read(&s.iface).is_same(&iface))
        {
            stored.policy = policy;
            stored.ttl_left = match policy {
                LifetimePolicy::Permanent => 0,
                LifetimePolicy::Ttl(ttl) => ttl,
            };
            // Refresh addresses and up state from the newer sighting.
            let mut existing = write(&stored.iface);
            for addr in iface.addresses() {
                existing.add_address(addr.clone());
            }
            existing.set_up(true);
            return (stored.iface.clone(), false);
        }

        iface.set_up(true);
        let iface = new_interface_ref(iface);
        inner.push(StoredInterface {
            iface: iface.clone(),
            policy,
            ttl_left: match policy {
                LifetimePolicy::Permanent => 0,
                LifetimePolicy::Ttl(ttl) => ttl,
            },
        });
        (iface, true)
    }

    pub fn retrieve(&self, iface_type: InterfaceType, identifier: &[u8]) -> Option<InterfaceRef> {
        read(&self.inner)
            .iter()
            .find(|s| {
                let stored = read(&s.iface);
                stored.iface_type() == iface_type && stored.identifier() == identifier
            })
            .map(|s| s.iface.clone())
    }

    pub fn stored(&self, iface: &Interface) -> bool {
        self.retrieve(iface.iface_type(), iface.identifier()).is_some()
    }

    pub fn remove(&self, iface: &Interface) -> Option<InterfaceRef> {
        let mut inner = write(&self.inner);
        let idx = inner.iter().position(|s| read(&s.iface).is_same(iface))?;
        let stored = inner.remove(idx);
        write(&stored.iface).set_up(false);
        Some(stored.iface)
    }

    /// One scan cycle passed without the given interfaces being seen:
    /// decrement TTL counters and return the interfaces that just expired.
    /// Expired interfaces are removed and marked down.
    pub fn age(&self, seen: &[Interface]) -> Vec<InterfaceRef> {
        let mut expired = Vec::new();
        let mut inner = write(&self.inner);
        inner.retain_mut(|stored| {
            if !matches!(stored.policy, LifetimePolicy::Ttl(_)) {
                return true;
            }
            if seen.iter().any(|s| read(&stored.iface).is_same(s)) {
                return true;
            }
            stored.ttl_left = stored.ttl_left.saturating_sub(1);
            if stored.ttl_left == 0 {
                write(&stored.iface).set_up(false);
                expired.push(stored.iface.clone());
                return false;
            }
            true
        });
        expired
    }

    pub fn len(&self) -> usize {
        read(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(id: u8) -> Interface {
        Interface::new(InterfaceType::Ethernet, vec![id])
    }

    #[test]
    fn refresh_does_not_duplicate() {
        let store = InterfaceStore::new();
        let (_, fresh) = store.add_or_refresh(iface(1), LifetimePolicy::Ttl(3));
        assert!(fresh);
        let (_, fresh) = store.add_or_refresh(iface(1), LifetimePolicy::Ttl(3));
        assert!(!fresh);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn ttl_expiry_after_missed_scans() {
        let store = InterfaceStore::new();
        let (_, _) = store.add_or_refresh(iface(1), LifetimePolicy::Ttl(2));
        let (_, _) = store.add_or_refresh(iface(2), LifetimePolicy::Permanent);

        assert!(store.age(&[]).is_empty(), "first miss only decrements");
        let expired = store.age(&[]);
        assert_eq!(expired.len(), 1);
        assert!(store.retrieve(InterfaceType::Ethernet, &[1]).is_none());
        // Permanent interfaces never age out.
        assert!(store.retrieve(InterfaceType::Ethernet, &[2]).is_some());
    }

    #[test]
    fn seen_interfaces_do_not_age() {
        let store = InterfaceStore::new();
        let (_, _) = store.add_or_refresh(iface(1), LifetimePolicy::Ttl(1));
        assert!(store.age(&[iface(1)]).is_empty());
        assert!(store.age(&[iface(1)]).is_empty());
        assert_eq!(store.age(&[]).len(), 1);
    }
}
