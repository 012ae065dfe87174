//! Reserve private subnets and issue unique addresses from them.
//!
//! A [Registry] hands out non-overlapping `172.<n>.0.0/16` ranges (one per test network). Each
//! [Subnet] issues addresses from a cursor that only moves forward: no address is ever issued
//! twice and there is no free operation. The first host address (`x.y.0.1`) is the gateway and
//! is never issued.

use std::{
    net::Ipv4Addr,
    sync::{Arc, Mutex},
};
use thiserror::Error;

/// First octet of every reserved range.
const FIRST_OCTET: u8 = 172;

/// Second octet preceding the first reserved range (reservations pre-increment).
const INITIAL_SECOND_OCTET: u8 = 17;

/// Last second octet inside the `172.16.0.0/12` private block.
const FINAL_SECOND_OCTET: u8 = 31;

/// Prefix length of every reserved range.
const PREFIX: u8 = 16;

/// Errors that can occur when reserving subnets or allocating addresses.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("insufficient addresses: requested {requested}, remaining {remaining}")]
    AddressExhausted { requested: usize, remaining: usize },
    #[error("no subnet ranges remaining")]
    SubnetsExhausted,
}

/// Process-wide reservation of subnet ranges.
///
/// Clones share the same counter, so concurrently running suites that use clones of one
/// [Registry] never receive overlapping ranges.
#[derive(Clone, Debug)]
pub struct Registry {
    last: Arc<Mutex<u8>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Create a registry whose first reservation is `172.18.0.0/16`.
    pub fn new() -> Self {
        Self {
            last: Arc::new(Mutex::new(INITIAL_SECOND_OCTET)),
        }
    }

    /// Reserve the next unused range.
    pub fn reserve(&self) -> Result<Subnet, Error> {
        let mut last = self.last.lock().unwrap();
        if *last >= FINAL_SECOND_OCTET {
            return Err(Error::SubnetsExhausted);
        }
        *last += 1;
        Ok(Subnet::new(Ipv4Addr::new(FIRST_OCTET, *last, 0, 0), PREFIX))
    }
}

/// A reserved IPv4 range with a forward-only allocation cursor.
///
/// Clones share the cursor.
#[derive(Clone, Debug)]
pub struct Subnet {
    base: u32,
    prefix: u8,
    cursor: Arc<Mutex<u32>>,
}

impl Subnet {
    /// Create a subnet rooted at `base` with the given prefix length.
    ///
    /// # Panics
    ///
    /// Panics if `prefix` is zero or leaves fewer than two host addresses.
    pub fn new(base: Ipv4Addr, prefix: u8) -> Self {
        assert!((1..=30).contains(&prefix), "invalid prefix: {prefix}");
        let mask = u32::MAX << (32 - prefix as u32);
        let base = u32::from(base) & mask;
        Self {
            base,
            prefix,
            cursor: Arc::new(Mutex::new(base + 1)),
        }
    }

    /// Network address of the range.
    pub fn base(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.base)
    }

    /// Prefix length of the range.
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Gateway address (never issued).
    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.base + 1)
    }

    /// The range in CIDR notation.
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.base(), self.prefix)
    }

    /// Returns true if `ip` lies inside the range.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) >> (32 - self.prefix as u32) == self.base >> (32 - self.prefix as u32)
    }

    /// Last address that may be issued (the one before broadcast).
    fn last(&self) -> u32 {
        let size = 1u64 << (32 - self.prefix as u32);
        (self.base as u64 + size - 2) as u32
    }

    /// Number of addresses that can still be issued.
    pub fn remaining(&self) -> usize {
        let cursor = *self.cursor.lock().unwrap();
        (self.last() - cursor) as usize
    }

    /// Issue the next `n` unused addresses.
    ///
    /// Allocation is all-or-nothing: if fewer than `n` addresses remain, nothing is issued.
    pub fn allocate(&self, n: usize) -> Result<Vec<Ipv4Addr>, Error> {
        let mut cursor = self.cursor.lock().unwrap();
        let remaining = (self.last() - *cursor) as usize;
        if n > remaining {
            return Err(Error::AddressExhausted {
                requested: n,
                remaining,
            });
        }
        let ips = (1..=n as u32)
            .map(|offset| Ipv4Addr::from(*cursor + offset))
            .collect();
        *cursor += n as u32;
        Ok(ips)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_first_reservation() {
        let registry = Registry::new();
        let subnet = registry.reserve().unwrap();
        assert_eq!(subnet.cidr(), "172.18.0.0/16");
        assert_eq!(subnet.gateway(), Ipv4Addr::new(172, 18, 0, 1));
        let second = registry.clone().reserve().unwrap();
        assert_eq!(second.cidr(), "172.19.0.0/16");
    }

    #[test]
    fn test_reservations_exhausted() {
        let registry = Registry::new();
        let mut seen = HashSet::new();
        for _ in 18..=31 {
            let subnet = registry.reserve().unwrap();
            assert!(seen.insert(subnet.cidr()));
        }
        assert_eq!(registry.reserve().unwrap_err(), Error::SubnetsExhausted);
    }

    #[test]
    fn test_allocate_distinct() {
        let subnet = Registry::new().reserve().unwrap();
        let first = subnet.allocate(4).unwrap();
        assert_eq!(first[0], Ipv4Addr::new(172, 18, 0, 2));
        let second = subnet.clone().allocate(300).unwrap();
        let all: HashSet<_> = first.iter().chain(second.iter()).collect();
        assert_eq!(all.len(), 304);
        assert!(!all.contains(&subnet.gateway()));
        assert!(all.iter().all(|ip| subnet.contains(**ip)));
        assert_eq!(second[299], Ipv4Addr::new(172, 18, 1, 49));
    }

    #[test]
    fn test_allocate_exhausted() {
        let subnet = Subnet::new(Ipv4Addr::new(10, 0, 0, 0), 29);
        // 8 addresses: network, gateway, 5 hosts, broadcast
        assert_eq!(subnet.remaining(), 5);
        subnet.allocate(3).unwrap();
        let err = subnet.allocate(3).unwrap_err();
        assert_eq!(
            err,
            Error::AddressExhausted {
                requested: 3,
                remaining: 2
            }
        );
        assert_eq!(subnet.remaining(), 2);
        let rest = subnet.allocate(2).unwrap();
        assert_eq!(rest, vec![Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 6)]);
        assert!(subnet.allocate(1).is_err());
        assert!(subnet.allocate(0).unwrap().is_empty());
    }
}
