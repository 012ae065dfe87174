//! Deterministic, in-memory stand-ins for the container runtime and node RPC.
//!
//! A [Cluster] simulates one shared chain: every running container whose account label is in the
//! validator set (and which is mining) counts towards quorum, and [Cluster::produce] seals a block
//! whenever a BFT quorum is online. Proposers rotate round robin over the sorted validator set and
//! membership votes are applied once a majority of validators agrees. Nothing in the mock consumes
//! simulated time, so waits against it are driven entirely by the caller's runtime.

use crate::{
    client::{self, Header},
    container::{self, Id, NetworkSpec, Spec},
    genesis,
    identity::{self, Identity},
    node, proposer,
};
use alloy_primitives::{keccak256, Address, U256};
use commonware_runtime::{Clock, Handle, Spawner};
use futures::channel::mpsc;
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    net::Ipv4Addr,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tracing::debug;

mod client_impl;
mod runtime;

pub use client_impl::{Client, Dialer};
pub use runtime::Runtime;

/// Buffered heads per subscriber before new heads are dropped.
const SUBSCRIPTION_BUFFER: usize = 1024;

/// A membership vote recorded by [Cluster].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Proposal {
    pub voter: Address,
    pub candidate: Address,
    pub authorize: bool,
}

struct Container {
    spec: Spec,
    running: bool,
    ip: Option<Ipv4Addr>,
    address: Option<Address>,
    identity: Option<Identity>,
    mining: bool,
    peers: BTreeMap<Ipv4Addr, String>,
}

struct Chain {
    headers: Vec<Header>,
    proposers: Vec<Address>,
    validators: Vec<Vec<Address>>,
    votes: BTreeMap<Address, BTreeMap<Address, bool>>,
}

impl Chain {
    fn new(mut validators: Vec<Address>) -> Self {
        validators.sort();
        let genesis = Header {
            hash: keccak256(0u64.to_be_bytes()),
            difficulty: U256::from(1),
            gas_limit: genesis::Config::default().gas_limit,
            mix_hash: genesis::SPORT_DIGEST,
            extra_data: genesis::extra_data(&validators),
            ..Header::default()
        };
        Self {
            headers: vec![genesis],
            proposers: vec![Address::ZERO],
            validators: vec![validators],
            votes: BTreeMap::new(),
        }
    }

    fn head(&self) -> &Header {
        &self.headers[self.headers.len() - 1]
    }

    fn last_proposer(&self) -> Address {
        self.proposers[self.proposers.len() - 1]
    }

    fn current(&self) -> &[Address] {
        &self.validators[self.validators.len() - 1]
    }

    fn set_at(&self, number: Option<u64>) -> Option<&[Address]> {
        match number {
            None => Some(self.current()),
            Some(number) => self.validators.get(number as usize).map(Vec::as_slice),
        }
    }
}

#[derive(Default)]
struct State {
    next_id: u64,
    next_ip: u8,
    containers: BTreeMap<Id, Container>,
    networks: BTreeMap<String, NetworkSpec>,
    occupied: BTreeSet<String>,
    images: BTreeSet<String>,
    pulls: usize,

    chain: Option<Chain>,
    balances: BTreeMap<Address, U256>,
    proposals: Vec<Proposal>,
    subscribers: Vec<(Id, mpsc::Sender<Result<Header, client::Error>>)>,

    fail_init: bool,
    refuse_rpc: bool,
}

impl State {
    fn seed(&mut self, path: &Path) -> Result<(), genesis::Error> {
        if self.chain.is_some() {
            return Ok(());
        }
        self.chain = Some(Chain::new(genesis::fullnodes(path)?));
        for (account, balance) in genesis::allocations(path)? {
            self.balances.insert(account, balance);
        }
        Ok(())
    }

    fn online(&self) -> BTreeSet<Address> {
        self.containers
            .values()
            .filter(|container| container.running && container.mining)
            .filter_map(|container| container.address)
            .collect()
    }

    fn produce(&mut self) -> Option<Header> {
        let online = self.online();
        let chain = self.chain.as_mut()?;
        let validators = chain.current().to_vec();
        let live: Vec<_> = validators
            .iter()
            .filter(|validator| online.contains(*validator))
            .collect();
        if validators.is_empty() || live.len() < proposer::quorum(validators.len()) {
            return None;
        }

        // Next proposer after the previous one, skipping validators that are offline
        let head = chain.head().clone();
        let last = chain.last_proposer();
        let start = validators
            .iter()
            .position(|validator| *validator == last)
            .map(|index| index + 1)
            .unwrap_or(0);
        let sealer = (0..validators.len())
            .map(|offset| validators[(start + offset) % validators.len()])
            .find(|validator| online.contains(validator))?;
        let signer = self
            .containers
            .values()
            .filter(|container| container.running && container.address == Some(sealer))
            .find_map(|container| container.identity.clone());

        // Apply every vote a majority of the current set agrees on
        let mut next = validators.clone();
        let mut decided = Vec::new();
        for (candidate, ballots) in &chain.votes {
            let tally = |authorize: bool| {
                ballots
                    .iter()
                    .filter(|(voter, vote)| validators.contains(*voter) && **vote == authorize)
                    .count()
            };
            if tally(true) * 2 > validators.len() {
                if !next.contains(candidate) {
                    next.push(*candidate);
                }
                decided.push(*candidate);
            } else if tally(false) * 2 > validators.len() {
                next.retain(|validator| validator != candidate);
                decided.push(*candidate);
            }
        }
        for candidate in decided {
            chain.votes.remove(&candidate);
        }
        next.sort();

        // Every block shares one coinbase; only the seal identifies the proposer
        let number = head.number + 1;
        let mut header = Header {
            number,
            parent_hash: head.hash,
            timestamp: head.timestamp + 1,
            miner: node::DEFAULT_ETHERBASE,
            difficulty: U256::from(1),
            gas_limit: head.gas_limit,
            mix_hash: genesis::SPORT_DIGEST,
            extra_data: genesis::Extra {
                fullnodes: validators.clone(),
                ..genesis::Extra::default()
            }
            .encode(),
            ..Header::default()
        };
        match signer {
            Some(identity) => {
                if let Err(err) = header.seal(&identity) {
                    debug!(number, ?err, "failed to seal block");
                }
            }
            None => debug!(number, proposer = %sealer, "no key to seal block"),
        }
        header.hash = keccak256(number.to_be_bytes());
        chain.headers.push(header.clone());
        chain.proposers.push(sealer);
        chain.validators.push(next);

        let containers = &self.containers;
        self.subscribers.retain_mut(|(id, subscriber)| {
            if !containers.get(id).is_some_and(|container| container.running) {
                return false;
            }
            match subscriber.try_send(Ok(header.clone())) {
                Ok(()) => true,
                Err(err) => !err.is_disconnected(),
            }
        });
        Some(header)
    }

    fn close_subscriptions(&mut self, id: &str) {
        self.subscribers.retain(|(subscriber, _)| subscriber != id);
    }
}

/// An in-memory container runtime and chain shared by every [Runtime], [Dialer] and [Client]
/// created from it.
#[derive(Clone, Default)]
pub struct Cluster {
    state: Arc<Mutex<State>>,
}

impl Cluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// A [container::Runtime] backed by the cluster.
    pub fn runtime(&self) -> Runtime {
        Runtime::new(self.clone())
    }

    /// A [client::Dialer] resolving endpoints to the cluster's running containers.
    pub fn dialer(&self) -> Dialer {
        Dialer::new(self.clone())
    }

    /// Make every subsequent `init` exit with code 1.
    pub fn fail_init(&self, fail: bool) {
        self.lock().fail_init = fail;
    }

    /// Make every RPC call fail as if the server were unreachable.
    pub fn refuse_rpc(&self, refuse: bool) {
        self.lock().refuse_rpc = refuse;
    }

    /// Credit `account` with `amount`.
    pub fn fund(&self, account: Address, amount: U256) {
        let mut state = self.lock();
        let balance = state.balances.entry(account).or_default();
        *balance += amount;
    }

    /// Treat `cidr` as taken by some other network.
    pub fn occupy(&self, cidr: &str) {
        self.lock().occupied.insert(cidr.to_string());
    }

    /// Make `image` available without pulling it.
    pub fn add_image(&self, image: &str) {
        self.lock().images.insert(image.to_string());
    }

    /// Initialize the chain from a genesis file (no-op once initialized).
    pub fn seed(&self, path: &Path) -> Result<(), genesis::Error> {
        self.lock().seed(path)
    }

    /// Number of running containers.
    pub fn running(&self) -> usize {
        self.lock()
            .containers
            .values()
            .filter(|container| container.running)
            .count()
    }

    /// Number of images pulled.
    pub fn pulls(&self) -> usize {
        self.lock().pulls
    }

    /// Names of the networks currently defined.
    pub fn networks(&self) -> Vec<String> {
        self.lock().networks.keys().cloned().collect()
    }

    /// Latest block number (0 before the chain is seeded).
    pub fn height(&self) -> u64 {
        self.lock()
            .chain
            .as_ref()
            .map(|chain| chain.head().number)
            .unwrap_or(0)
    }

    /// Current validator set, sorted.
    pub fn validators(&self) -> Vec<Address> {
        self.lock()
            .chain
            .as_ref()
            .map(|chain| chain.current().to_vec())
            .unwrap_or_default()
    }

    /// Proposers of every block after genesis, in order.
    pub fn proposers(&self) -> Vec<Address> {
        self.lock()
            .chain
            .as_ref()
            .map(|chain| chain.proposers[1..].to_vec())
            .unwrap_or_default()
    }

    /// Every membership vote cast so far.
    pub fn proposals(&self) -> Vec<Proposal> {
        self.lock().proposals.clone()
    }

    /// Seal one block if a quorum of validators is online, returning its number.
    pub fn produce(&self) -> Option<u64> {
        let header = self.lock().produce()?;
        debug!(number = header.number, proposer = ?header.proposer().ok(), "sealed block");
        Some(header.number)
    }

    /// Stop every container (closing every subscription).
    pub fn stop_all(&self) {
        let mut state = self.lock();
        for container in state.containers.values_mut() {
            container.running = false;
        }
        state.subscribers.clear();
    }

    /// Attempt to seal a block every `interval`.
    pub fn spawn_producer<E: Clock + Spawner>(&self, context: E, interval: Duration) -> Handle<()> {
        let cluster = self.clone();
        context.spawn(move |context| async move {
            loop {
                context.sleep(interval).await;
                cluster.produce();
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }
}

/// Read the node key mounted into a container, if any.
fn node_identity(spec: &Spec) -> Option<Identity> {
    spec.binds.iter().find_map(|bind| {
        let secret = fs::read_to_string(bind.source.join(identity::NODEKEY_PATH)).ok()?;
        Identity::from_hex(secret.trim()).ok()
    })
}

fn not_found(id: &str) -> container::Error {
    container::Error::NotFound(id.to_string())
}
