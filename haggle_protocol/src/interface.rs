// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use std::fmt::{self, Display, Formatter};
use std::net::SocketAddr;
use std::str::FromStr;

/// Link technology an interface belongs to. The identifier space is scoped
/// per type; two interfaces are the same interface iff (type, identifier)
/// agree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InterfaceType {
    Undefined,
    /// A local application endpoint (IPC client).
    Application,
    Bluetooth,
    Ethernet,
    Wifi,
}

impl InterfaceType {
    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => Self::Application,
            2 => Self::Bluetooth,
            3 => Self::Ethernet,
            4 => Self::Wifi,
            _ => Self::Undefined,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::Undefined => 0,
            Self::Application => 1,
            Self::Bluetooth => 2,
            Self::Ethernet => 3,
            Self::Wifi => 4,
        }
    }
}

impl Display for InterfaceType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Undefined => "undefined",
            Self::Application => "application",
            Self::Bluetooth => "bluetooth",
            Self::Ethernet => "ethernet",
            Self::Wifi => "wifi",
        };
        write!(f, "{s}")
    }
}

impl FromStr for InterfaceType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "undefined" => Ok(Self::Undefined),
            "application" => Ok(Self::Application),
            "bluetooth" => Ok(Self::Bluetooth),
            "ethernet" => Ok(Self::Ethernet),
            "wifi" => Ok(Self::Wifi),
            other => Err(crate::Error::MetadataParse(format!(
                "unknown interface type {other:?}"
            ))),
        }
    }
}

/// A reachable address attached to an interface.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Address {
    /// A socket address a transport can connect to.
    Socket(SocketAddr),
    /// A link-layer MAC address.
    Mac([u8; 6]),
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket(addr) => write!(f, "{addr}"),
            Self::Mac(mac) => write!(
                f,
                "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
            ),
        }
    }
}

/// A local or remote network attachment point.
///
/// Interfaces are provenance for data objects (which link they arrived on)
/// and the handle connectivity discovery hands to the rest of the engine.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Interface {
    iface_type: InterfaceType,
    identifier: Vec<u8>,
    name: String,
    addresses: Vec<Address>,
    local: bool,
    up: bool,
}

impl Interface {
    pub fn new(iface_type: InterfaceType, identifier: impl Into<Vec<u8>>) -> Self {
        Self {
            iface_type,
            identifier: identifier.into(),
            name: String::new(),
            addresses: Vec::new(),
            local: false,
            up: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_address(mut self, address: Address) -> Self {
        self.add_address(address);
        self
    }

    pub fn local(mut self) -> Self {
        self.local = true;
        self
    }

    pub fn up(mut self) -> Self {
        self.up = true;
        self
    }

    pub fn iface_type(&self) -> InterfaceType {
        self.iface_type
    }

    pub fn identifier(&self) -> &[u8] {
        &self.identifier
    }

    pub fn identifier_str(&self) -> String {
        hex::encode(&self.identifier)
    }

    /// Interface identity: the (type, identifier) pair.
    pub fn key(&self) -> (InterfaceType, Vec<u8>) {
        (self.iface_type, self.identifier.clone())
    }

    pub fn is_same(&self, other: &Interface) -> bool {
        self.iface_type == other.iface_type && self.identifier == other.identifier
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addresses(&self) -> &[Address] {
        &self.addresses
    }

    pub fn add_address(&mut self, address: Address) {
        if !self.addresses.contains(&address) {
            self.addresses.push(address);
        }
    }

    /// First socket address, the thing a stream transport dials.
    pub fn socket_address(&self) -> Option<SocketAddr> {
        self.addresses.iter().find_map(|a| match a {
            Address::Socket(addr) => Some(*addr),
            Address::Mac(_) => None,
        })
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn is_up(&self) -> bool {
        self.up
    }

    pub fn set_up(&mut self, up: bool) {
        self.up = up;
    }
}

impl Display for Interface {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.iface_type, self.identifier_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_type_plus_identifier() {
        let a = Interface::new(InterfaceType::Ethernet, vec![1, 2, 3]);
        let b = Interface::new(InterfaceType::Ethernet, vec![1, 2, 3]).with_name("eth0");
        let c = Interface::new(InterfaceType::Wifi, vec![1, 2, 3]);
        assert!(a.is_same(&b));
        assert!(!a.is_same(&c));
    }

    #[test]
    fn socket_address_lookup() {
        let addr: SocketAddr = "10.0.0.1:9697".parse().expect("addr");
        let iface = Interface::new(InterfaceType::Ethernet, vec![9])
            .with_address(Address::Mac([0, 1, 2, 3, 4, 5]))
            .with_address(Address::Socket(addr));
        assert_eq!(iface.socket_address(), Some(addr));
    }
}
