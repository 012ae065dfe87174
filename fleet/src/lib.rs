//! Provision and monitor fleets of blockchain node containers.
//!
//! A [controller::Fleet] owns the containers of one test cluster: it reserves addresses from a
//! [subnet::Subnet], writes a shared [genesis] file, provisions one [node::Node] per validator
//! (optionally paired with a [vault::Vault]), wires the peer topology and executes BFT membership
//! changes. The [monitor] and [fanout] modules turn "did the cluster make progress" into a typed
//! verdict with bounded waiting.
//!
//! Containers and JSON-RPC endpoints are reached through the [container::Runtime] and
//! [client::Dialer] capabilities. [container::Docker] and [client::http::Dialer] drive real
//! infrastructure, [mocks::Cluster] simulates both for deterministic tests.
//!
//! # Status
//!
//! `commonware-fleet` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

#![doc(
    html_logo_url = "https://commonware.xyz/imgs/rustdoc_logo.svg",
    html_favicon_url = "https://commonware.xyz/favicon.ico"
)]

use alloy_primitives::Address;
use commonware_runtime::Clock;
use futures::future::{self, Either};
use std::{
    future::Future,
    time::{Duration, SystemTime},
};
use thiserror::Error;

pub mod client;
pub mod config;
pub mod container;
pub mod controller;
pub mod fanout;
pub mod genesis;
pub mod identity;
pub mod mocks;
pub mod monitor;
pub mod network;
pub mod node;
pub mod proposer;
pub mod subnet;
pub mod vault;

pub use controller::Fleet;
pub use node::Node;

/// Errors that can occur while provisioning or observing a fleet.
#[derive(Error, Debug)]
pub enum Error {
    #[error("subnet: {0}")]
    Subnet(#[from] subnet::Error),
    #[error("container: {0}")]
    Container(#[from] container::Error),
    #[error("client: {0}")]
    Client(#[from] client::Error),
    #[error("genesis: {0}")]
    Genesis(#[from] genesis::Error),
    #[error("identity: {0}")]
    Identity(#[from] identity::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("{node}: cannot {operation} while {state:?}")]
    InvalidState {
        node: String,
        operation: &'static str,
        state: node::State,
    },
    #[error("{node}: {operation}: {source}")]
    Runtime {
        node: String,
        operation: &'static str,
        #[source]
        source: container::Error,
    },
    #[error("{node}: {operation}: {source}")]
    Rpc {
        node: String,
        operation: &'static str,
        #[source]
        source: client::Error,
    },
    #[error("{node}: not found")]
    NotFound { node: String },
    #[error("{node}: init exited with code {code}")]
    InitFailed { node: String, code: i64 },
    #[error("{vault}: key generation exited with code {code}")]
    KeyGenerationFailed { vault: String, code: i64 },
    #[error("{node}: not ready after {attempts} health checks")]
    StartupFailed { node: String, attempts: usize },
    #[error("{node}: no block produced before deadline")]
    NoBlockProduced { node: String },
    #[error("{node}: no block ever produced")]
    NoBlockEverProduced { node: String },
    #[error("{node}: stalled after block {last}")]
    StalledAfterProgress { node: String, last: u64 },
    #[error("{node}: head subscription closed")]
    SubscriptionClosed { node: String },
    #[error("{node}: produced {produced} blocks (allowed {allowed})")]
    UnexpectedProgress {
        node: String,
        produced: u64,
        allowed: u64,
    },
    #[error("{node}: {operation} timed out")]
    Timeout {
        node: String,
        operation: &'static str,
    },
    #[error("{node}: propose {candidate} failed: {source}")]
    ProposeFailed {
        node: String,
        candidate: Address,
        #[source]
        source: client::Error,
    },
    #[error("unknown candidate: {0}")]
    UnknownCandidate(String),
    #[error("validator set did not settle without {candidates} candidates")]
    SettleTimeout { candidates: usize },
}

/// Upper bound on the time a wait may take.
///
/// Every wait in this crate takes a [Deadline]. [Deadline::Unbounded] is reserved for the
/// outermost boundary of a scenario (where the caller supplies its own cancellation).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Deadline {
    /// Give up once the duration has elapsed.
    After(Duration),
    /// Never give up.
    Unbounded,
}

impl Deadline {
    /// Resolve the deadline into an absolute time, relative to `now`.
    pub fn at(&self, now: SystemTime) -> Option<SystemTime> {
        match self {
            Deadline::After(duration) => Some(now + *duration),
            Deadline::Unbounded => None,
        }
    }
}

impl From<Duration> for Deadline {
    fn from(duration: Duration) -> Self {
        Deadline::After(duration)
    }
}

/// Returns true if `now` is beyond the resolved deadline.
pub(crate) fn expired(deadline: Option<SystemTime>, now: SystemTime) -> bool {
    deadline.is_some_and(|at| now >= at)
}

/// Resolves at the resolved deadline (never, if unbounded).
pub(crate) fn timeout<E: Clock>(
    context: &E,
    deadline: Option<SystemTime>,
) -> impl Future<Output = ()> + Send + '_ {
    match deadline {
        Some(at) => Either::Left(context.sleep_until(at)),
        None => Either::Right(future::pending()),
    }
}
