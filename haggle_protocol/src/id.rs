// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::error::Error;
use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

/// Length in bytes of data object and node identifiers (SHA-1 digests).
pub const ID_LEN: usize = 20;

macro_rules! sha1_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name([u8; ID_LEN]);

        impl $name {
            pub fn new(bytes: [u8; ID_LEN]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; ID_LEN] {
                &self.0
            }

            /// Random identifier, used for placeholder nodes and in tests.
            pub fn random() -> Self {
                Self(rand::random())
            }

            pub fn is_zero(&self) -> bool {
                self.0 == [0u8; ID_LEN]
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl Debug for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                // The first four bytes are plenty to tell ids apart in logs.
                write!(f, "{}({}..)", stringify!($name), hex::encode(&self.0[..4]))
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Error> {
                let bytes = hex::decode(s).map_err(|_| Error::InvalidId(s.to_string()))?;
                let bytes: [u8; ID_LEN] =
                    bytes.try_into().map_err(|_| Error::InvalidId(s.to_string()))?;
                Ok(Self(bytes))
            }
        }

        impl From<[u8; ID_LEN]> for $name {
            fn from(bytes: [u8; ID_LEN]) -> Self {
                Self(bytes)
            }
        }

        impl TryFrom<&[u8]> for $name {
            type Error = Error;

            fn try_from(bytes: &[u8]) -> Result<Self, Error> {
                let bytes: [u8; ID_LEN] = bytes
                    .try_into()
                    .map_err(|_| Error::InvalidId(hex::encode(bytes)))?;
                Ok(Self(bytes))
            }
        }
    };
}

sha1_id!(
    /// Content-derived identity of a data object. A pure function of the
    /// object's attributes, creation time and payload fingerprint.
    DataObjectId
);

sha1_id!(
    /// Identity of a node, derived from the node's identifying data.
    NodeId
);

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    #[test]
    fn hex_round_trip() -> Result<()> {
        let id = DataObjectId::random();
        let parsed: DataObjectId = id.to_string().parse()?;
        assert_eq!(id, parsed);
        assert_eq!(id.to_string().len(), 40);
        Ok(())
    }

    #[test]
    fn rejects_bad_hex() {
        assert!("zz".parse::<NodeId>().is_err());
        assert!("abcd".parse::<NodeId>().is_err());
    }
}
