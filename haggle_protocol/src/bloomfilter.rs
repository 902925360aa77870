// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Per-node duplicate suppression.
//!
//! Every node carries a bloom filter of the data object ids it has already
//! seen; queries exclude anything the filter reports. The wire form is the
//! struct `(k, m, n, salts[k], bins)` with every integer big-endian,
//! base64-encoded when carried inside a node description. The counting
//! variant (16-bit bins) additionally supports removal and is used where a
//! node must be able to forget.

use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::Rng;
use sha1::{Digest, Sha1};
use std::fmt::{self, Debug, Formatter};

/// Default false-positive target for node filters.
pub const DEFAULT_BLOOMFILTER_ERROR_RATE: f64 = 0.01;

/// Default capacity (number of ids at the error-rate target).
pub const DEFAULT_BLOOMFILTER_CAPACITY: u32 = 2000;

const HEADER_LEN: usize = 12; // k, m, n as u32

#[derive(Clone, PartialEq, Eq)]
enum Bins {
    /// One bit per bin.
    Bits(Vec<u8>),
    /// One 16-bit counter per bin.
    Counters(Vec<u16>),
}

/// A bloom filter with `k` salted SHA-1 derived hash functions over `m`
/// bins.
#[derive(Clone, PartialEq, Eq)]
pub struct Bloomfilter {
    k: u32,
    m: u32,
    n: u32,
    salts: Vec<u32>,
    bins: Bins,
}

impl Default for Bloomfilter {
    fn default() -> Self {
        Self::new(DEFAULT_BLOOMFILTER_ERROR_RATE, DEFAULT_BLOOMFILTER_CAPACITY)
    }
}

impl Bloomfilter {
    /// A non-counting filter sized so the false-positive rate at `capacity`
    /// inserted keys stays at or under `error_rate`.
    pub fn new(error_rate: f64, capacity: u32) -> Self {
        let (m, k) = dimension(error_rate, capacity);
        Self {
            k,
            m,
            n: 0,
            salts: random_salts(k),
            bins: Bins::Bits(vec![0u8; (m as usize) / 8]),
        }
    }

    /// A counting filter with the same sizing rule; supports [`Self::remove`].
    pub fn new_counting(error_rate: f64, capacity: u32) -> Self {
        let (m, k) = dimension(error_rate, capacity);
        Self {
            k,
            m,
            n: 0,
            salts: random_salts(k),
            bins: Bins::Counters(vec![0u16; m as usize]),
        }
    }

    pub fn is_counting(&self) -> bool {
        matches!(self.bins, Bins::Counters(_))
    }

    /// Number of inserted keys.
    pub fn len(&self) -> u32 {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    pub fn add(&mut self, key: &[u8]) {
        for i in 0..self.k {
            let bin = self.bin_for(self.salts[i as usize], key);
            match &mut self.bins {
                Bins::Bits(bytes) => bytes[bin / 8] |= 1 << (bin % 8),
                Bins::Counters(counters) => {
                    counters[bin] = counters[bin].saturating_add(1);
                }
            }
        }
        self.n = self.n.saturating_add(1);
    }

    /// True iff all `k` bins for the key are non-zero. May report false
    /// positives, never false negatives.
    pub fn check(&self, key: &[u8]) -> bool {
        (0..self.k).all(|i| {
            let bin = self.bin_for(self.salts[i as usize], key);
            match &self.bins {
                Bins::Bits(bytes) => bytes[bin / 8] & (1 << (bin % 8)) != 0,
                Bins::Counters(counters) => counters[bin] != 0,
            }
        })
    }

    /// Removes a key from a counting filter; returns whether the key was
    /// (apparently) present. Errors on a non-counting filter.
    pub fn remove(&mut self, key: &[u8]) -> Result<bool> {
        if !self.is_counting() {
            return Err(Error::BloomfilterNotCounting);
        }
        if !self.check(key) {
            return Ok(false);
        }
        for i in 0..self.k {
            let bin = self.bin_for(self.salts[i as usize], key);
            if let Bins::Counters(counters) = &mut self.bins {
                counters[bin] = counters[bin].saturating_sub(1);
            }
        }
        self.n = self.n.saturating_sub(1);
        Ok(true)
    }

    fn bin_for(&self, salt: u32, key: &[u8]) -> usize {
        let mut hasher = Sha1::new();
        hasher.update(salt.to_be_bytes());
        hasher.update(key);
        let digest = hasher.finalize();
        let word = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        (word % self.m) as usize
    }

    /// Serializes to the wire struct, all integers big-endian.
    pub fn to_bytes(&self) -> Vec<u8> {
        let bins_len = match &self.bins {
            Bins::Bits(bytes) => bytes.len(),
            Bins::Counters(counters) => counters.len() * 2,
        };
        let mut out = Vec::with_capacity(HEADER_LEN + self.salts.len() * 4 + bins_len);
        out.extend_from_slice(&self.k.to_be_bytes());
        out.extend_from_slice(&self.m.to_be_bytes());
        out.extend_from_slice(&self.n.to_be_bytes());
        for salt in &self.salts {
            out.extend_from_slice(&salt.to_be_bytes());
        }
        match &self.bins {
            Bins::Bits(bytes) => out.extend_from_slice(bytes),
            Bins::Counters(counters) => {
                for c in counters {
                    out.extend_from_slice(&c.to_be_bytes());
                }
            }
        }
        out
    }

    /// Parses the wire struct; any size mismatch is rejected.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        let err = |msg: &str| Error::BloomfilterParse(msg.to_string());

        if raw.len() < HEADER_LEN {
            return Err(err("short header"));
        }
        let k = u32::from_be_bytes(raw[0..4].try_into().expect("4 bytes"));
        let m = u32::from_be_bytes(raw[4..8].try_into().expect("4 bytes"));
        let n = u32::from_be_bytes(raw[8..12].try_into().expect("4 bytes"));
        if k == 0 || m == 0 {
            return Err(err("zero dimensions"));
        }

        let salts_len = k as usize * 4;
        let body = &raw[HEADER_LEN..];
        if body.len() < salts_len {
            return Err(err("truncated salts"));
        }
        let salts: Vec<u32> = body[..salts_len]
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes(c.try_into().expect("4 bytes")))
            .collect();

        let bins_raw = &body[salts_len..];
        let bins = if bins_raw.len() == m as usize / 8 && m % 8 == 0 {
            Bins::Bits(bins_raw.to_vec())
        } else if bins_raw.len() == m as usize * 2 {
            Bins::Counters(
                bins_raw
                    .chunks_exact(2)
                    .map(|c| u16::from_be_bytes(c.try_into().expect("2 bytes")))
                    .collect(),
            )
        } else {
            return Err(err("bin area does not match dimensions"));
        };

        Ok(Self { k, m, n, salts, bins })
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.to_bytes())
    }

    pub fn from_base64(b64: &str) -> Result<Self> {
        let raw = STANDARD
            .decode(b64)
            .map_err(|e| Error::BloomfilterParse(format!("bad base64: {e}")))?;
        Self::from_bytes(&raw)
    }
}

impl Debug for Bloomfilter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bloomfilter(k={} m={} n={}{})",
            self.k,
            self.m,
            self.n,
            if self.is_counting() { " counting" } else { "" }
        )
    }
}

/// Picks (m, k) minimizing false positives for the target rate at capacity.
/// `m` is rounded up to a byte boundary so bit filters pack exactly.
fn dimension(error_rate: f64, capacity: u32) -> (u32, u32) {
    let error_rate = error_rate.clamp(1e-9, 0.5);
    let capacity = capacity.max(1) as f64;
    let ln2 = std::f64::consts::LN_2;

    let m = (-capacity * error_rate.ln() / (ln2 * ln2)).ceil();
    let m = ((m as u32 + 7) / 8) * 8;
    let k = ((m as f64 / capacity) * ln2).round().max(1.0) as u32;
    (m, k)
}

fn random_salts(k: u32) -> Vec<u32> {
    let mut rng = rand::thread_rng();
    (0..k).map(|_| rng.gen()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    #[test]
    fn added_keys_are_found() {
        let mut bf = Bloomfilter::default();
        bf.add(b"one");
        bf.add(b"two");
        assert!(bf.check(b"one"));
        assert!(bf.check(b"two"));
        assert_eq!(bf.len(), 2);
    }

    #[test]
    fn base64_round_trip_is_identity() -> Result<()> {
        let mut bf = Bloomfilter::new(0.01, 100);
        for i in 0..50u32 {
            bf.add(&i.to_be_bytes());
        }
        let restored = Bloomfilter::from_base64(&bf.to_base64())?;
        assert_eq!(restored, bf);

        let mut counting = Bloomfilter::new_counting(0.01, 100);
        counting.add(b"x");
        let restored = Bloomfilter::from_base64(&counting.to_base64())?;
        assert_eq!(restored, counting);
        assert!(restored.is_counting());
        Ok(())
    }

    #[test]
    fn wire_integers_are_big_endian() {
        let bf = Bloomfilter::new(0.01, 100);
        let bytes = bf.to_bytes();
        // k is small; in big-endian its first three bytes are zero.
        assert_eq!(&bytes[0..3], &[0, 0, 0]);
        assert!(bytes[3] > 0);
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let mut bytes = Bloomfilter::new(0.01, 100).to_bytes();
        let _ = bytes.pop();
        assert!(Bloomfilter::from_bytes(&bytes).is_err());
        assert!(Bloomfilter::from_bytes(&[0u8; 5]).is_err());
        bytes.clear();
        assert!(Bloomfilter::from_bytes(&bytes).is_err());
    }

    #[test]
    fn counting_filter_forgets() -> Result<()> {
        let mut bf = Bloomfilter::new_counting(0.01, 100);
        bf.add(b"key");
        bf.add(b"key");
        assert!(bf.check(b"key"));

        assert!(bf.remove(b"key")?);
        assert!(bf.check(b"key"), "still present once");
        assert!(bf.remove(b"key")?);
        assert!(!bf.check(b"key"));
        assert!(!bf.remove(b"key")?);
        Ok(())
    }

    #[test]
    fn remove_needs_a_counting_filter() {
        let mut bf = Bloomfilter::default();
        bf.add(b"key");
        assert!(matches!(
            bf.remove(b"key"),
            Err(Error::BloomfilterNotCounting)
        ));
    }

    #[test]
    fn false_positive_rate_stays_near_target() {
        let mut bf = Bloomfilter::new(0.01, 500);
        for i in 0..500u32 {
            bf.add(format!("member-{i}").as_bytes());
        }

        let false_positives = (0..10_000u32)
            .filter(|i| bf.check(format!("other-{i}").as_bytes()))
            .count();
        // Target is 1%; allow slack for hash variance.
        assert!(
            false_positives < 250,
            "false positive rate too high: {false_positives}/10000"
        );
    }
}
