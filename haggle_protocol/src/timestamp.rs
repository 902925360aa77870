// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::error::Error;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

const MICROS_PER_SEC: i64 = 1_000_000;

/// Wall-clock timestamp with microsecond resolution.
///
/// The canonical string form is `seconds.microseconds` with the fraction
/// zero-padded to six digits (`"1700000000.000000"`). That exact string is
/// what enters the data object id hash and what goes on the wire as the
/// `create_time` parameter, so formatting must stay byte-stable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    micros: i64,
}

impl Timestamp {
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Self { micros }
    }

    pub fn from_secs(secs: i64) -> Self {
        Self {
            micros: secs * MICROS_PER_SEC,
        }
    }

    pub fn from_millis(millis: i64) -> Self {
        Self {
            micros: millis * 1000,
        }
    }

    pub fn as_millis(&self) -> i64 {
        self.micros / 1000
    }

    pub fn as_secs(&self) -> i64 {
        self.micros / MICROS_PER_SEC
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:06}",
            self.micros / MICROS_PER_SEC,
            self.micros % MICROS_PER_SEC
        )
    }
}

impl FromStr for Timestamp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let bad = || Error::InvalidTimestamp(s.to_string());
        let (secs, frac) = match s.split_once('.') {
            Some((secs, frac)) => (secs, frac),
            None => (s, "0"),
        };
        let secs: i64 = secs.parse().map_err(|_| bad())?;
        if frac.is_empty() || frac.len() > 6 || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(bad());
        }
        // "5" means 500000 microseconds, not 5.
        let micros: i64 = frac.parse::<i64>().map_err(|_| bad())?
            * 10i64.pow(6 - frac.len() as u32);
        Ok(Self {
            micros: secs * MICROS_PER_SEC + micros,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    #[test]
    fn string_form_is_stable() -> Result<()> {
        let t: Timestamp = "1700000000.000000".parse()?;
        assert_eq!(t.to_string(), "1700000000.000000");
        assert_eq!(t.as_secs(), 1_700_000_000);

        let t: Timestamp = "12.5".parse()?;
        assert_eq!(t.to_string(), "12.500000");
        Ok(())
    }

    #[test]
    fn ordering_follows_time() -> Result<()> {
        let a: Timestamp = "100.000001".parse()?;
        let b: Timestamp = "100.000002".parse()?;
        let c: Timestamp = "101.000000".parse()?;
        assert!(a < b && b < c);
        Ok(())
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["", "abc", "1.", "1.1234567", "1.2e3"] {
            assert!(bad.parse::<Timestamp>().is_err(), "{bad:?} should not parse");
        }
    }
}
