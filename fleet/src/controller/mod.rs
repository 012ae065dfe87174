//! Provision, wire and reconfigure the nodes of one test cluster.
//!
//! A [Fleet] generates one validator identity and one funded account per initial fullnode, writes
//! the shared genesis file, then provisions (and initializes) every node. Starting the fleet
//! brings up every fullnode and wires either a full mesh or a ring. Membership changes are driven
//! through the BFT engine's voting RPCs: [Fleet::add_fullnodes] completes every proposal before
//! wiring the enlarged mesh, and [Fleet::remove_fullnodes] waits for a quorum of the remaining
//! validators to drop the candidates before stopping them.

use crate::{
    client::{Client, Dialer},
    container::{self, Runtime},
    genesis, expired,
    identity::Identity,
    monitor,
    node::{self, Node},
    proposer,
    subnet::Subnet,
    vault::Pairing,
    Deadline, Error,
};
use alloy_primitives::Address;
use commonware_runtime::{Clock, Metrics as RuntimeMetrics, Spawner};
use rand::{rngs::StdRng, Rng, RngCore, SeedableRng};
use std::{
    fs, io,
    net::Ipv4Addr,
    ops::Range,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info, warn};
use uuid::Builder;

mod metrics;
pub use metrics::{Verdict, VerdictLabel};

/// Image of nodes built with fault injection.
pub const DEFAULT_FAULTY_IMAGE: &str = "quay.io/smilo/go-smilo:regression_test";

/// Configuration for a [Fleet].
#[derive(Clone, Debug)]
pub struct Config {
    /// Template every node is derived from (`name`, `workdir`, `network`, `ip` and `accounts`
    /// are assigned per node).
    pub node: node::Config,

    /// Number of well-behaved fullnodes.
    pub fullnodes: usize,

    /// Number of additional fullnodes running the faulty image.
    pub faulty: usize,

    pub faulty_image: String,

    /// Misbehavior of faulty nodes.
    pub fault_mode: u64,

    pub genesis: genesis::Config,

    /// Vault pairings, applied to the initial fullnodes in order.
    pub pairings: Vec<Pairing>,

    /// Keystore files unlocked by each initial fullnode, applied in order.
    pub keystores: Vec<Vec<PathBuf>>,

    /// Host directory below which genesis and node working directories are created.
    pub workdir: PathBuf,

    /// Network the nodes are attached to.
    pub network: Option<String>,

    pub monitor: monitor::Config,

    /// Poll interval of the settle wait of [Fleet::remove_fullnodes].
    pub settle_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: node::Config::default(),
            fullnodes: 4,
            faulty: 0,
            faulty_image: DEFAULT_FAULTY_IMAGE.into(),
            fault_mode: 1,
            genesis: genesis::Config::default(),
            pairings: Vec::new(),
            keystores: Vec::new(),
            workdir: std::env::temp_dir(),
            network: None,
            monitor: monitor::Config::default(),
            settle_interval: Duration::from_secs(1),
        }
    }
}

impl Config {
    fn validate(&self) -> Result<(), Error> {
        let total = self.fullnodes + self.faulty;
        if total == 0 {
            return Err(Error::InvalidConfig("fleet has no fullnodes".into()));
        }
        if !self.pairings.is_empty() && self.pairings.len() < total {
            return Err(Error::InvalidConfig(format!(
                "{} vault pairings for {total} fullnodes",
                self.pairings.len()
            )));
        }
        if !self.keystores.is_empty() && self.keystores.len() < total {
            return Err(Error::InvalidConfig(format!(
                "keystores for {} of {total} fullnodes",
                self.keystores.len()
            )));
        }
        if self.faulty > 0 && self.faulty_image.is_empty() {
            return Err(Error::InvalidConfig("faulty image is empty".into()));
        }
        if self.settle_interval.is_zero() {
            return Err(Error::InvalidConfig("settle interval must be positive".into()));
        }
        Ok(())
    }
}

/// The nodes of one test cluster.
pub struct Fleet<E, R, D>
where
    E: Clock + Spawner + RuntimeMetrics + RngCore,
    R: Runtime,
    D: Dialer,
{
    context: E,
    runtime: R,
    dialer: D,
    rng: StdRng,
    subnet: Subnet,
    cfg: Config,
    metrics: metrics::Metrics,

    accounts: Vec<Identity>,
    genesis: Option<PathBuf>,
    fullnodes: Vec<Node<E, R, D>>,
    pending: Vec<Node<E, R, D>>,
    nodes: Vec<Node<E, R, D>>,
    created: usize,
}

impl<E, R, D> Fleet<E, R, D>
where
    E: Clock + Spawner + RuntimeMetrics + RngCore,
    R: Runtime,
    D: Dialer,
{
    /// Generate accounts and genesis, then provision and initialize every initial fullnode.
    ///
    /// Addresses are allocated from `subnet`. Nothing is started. On failure every directory
    /// written so far is removed.
    pub async fn new(
        mut context: E,
        runtime: R,
        dialer: D,
        subnet: Subnet,
        cfg: Config,
    ) -> Result<Self, Error> {
        cfg.validate()?;
        let metrics = metrics::Metrics::init(context.with_label("fleet"));
        let mut seed = [0u8; 32];
        context.fill_bytes(&mut seed);
        let mut fleet = Self {
            context,
            rng: StdRng::from_seed(seed),
            runtime,
            dialer,
            subnet,
            cfg,
            metrics,
            accounts: Vec::new(),
            genesis: None,
            fullnodes: Vec::new(),
            pending: Vec::new(),
            nodes: Vec::new(),
            created: 0,
        };
        if let Err(err) = fleet.provision_fullnodes().await {
            fleet.finalize();
            return Err(err);
        }
        Ok(fleet)
    }

    async fn provision_fullnodes(&mut self) -> Result<(), Error> {
        container::ensure_image(&self.runtime, &self.cfg.node.image).await?;
        if self.cfg.faulty > 0 {
            container::ensure_image(&self.runtime, &self.cfg.faulty_image).await?;
        }

        let total = self.cfg.fullnodes + self.cfg.faulty;
        let identities: Vec<_> = (0..total)
            .map(|_| Identity::generate(&mut self.rng))
            .collect();
        self.accounts = (0..total)
            .map(|_| Identity::generate(&mut self.rng))
            .collect();
        let validators: Vec<_> = identities.iter().map(Identity::address).collect();
        let genesis = self.ensure_genesis(&validators)?;

        let ips = self.subnet.allocate(total)?;
        for (index, (identity, ip)) in identities.into_iter().zip(ips).enumerate() {
            let faulty = index >= self.cfg.fullnodes;
            let accounts = vec![self.accounts[index].address()];
            let pairing = self.cfg.pairings.get(index).cloned();
            let template = node::Config {
                keystores: self.cfg.keystores.get(index).cloned().unwrap_or_default(),
                ..self.cfg.node.clone()
            };
            let node = self.provision(identity, ip, faulty, accounts, pairing, Some(&template))?;
            self.fullnodes.push(node);
            self.fullnodes[index].init(&genesis).await?;
        }
        info!(
            fullnodes = self.cfg.fullnodes,
            faulty = self.cfg.faulty,
            genesis = %genesis.display(),
            "fleet provisioned"
        );
        Ok(())
    }

    /// Write the genesis file for `validators`, unless one was already written.
    ///
    /// Returns the path of the (first) genesis file.
    pub fn ensure_genesis(&mut self, validators: &[Address]) -> Result<PathBuf, Error> {
        if let Some(path) = &self.genesis {
            return Ok(path.clone());
        }
        let mut funded = validators.to_vec();
        funded.extend(self.accounts.iter().map(Identity::address));
        let id = self.scratch_id();
        let dir = self.cfg.workdir.join(format!("genesis-{id}"));
        let path = match genesis::create(&dir, &self.cfg.genesis, validators, &funded) {
            Ok(path) => path,
            Err(err) => {
                remove_dir(&dir);
                return Err(err.into());
            }
        };
        self.genesis = Some(path.clone());
        Ok(path)
    }

    fn scratch_id(&mut self) -> String {
        Builder::from_random_bytes(self.rng.gen())
            .into_uuid()
            .to_string()
    }

    fn provision(
        &mut self,
        identity: Identity,
        ip: Ipv4Addr,
        faulty: bool,
        accounts: Vec<Address>,
        pairing: Option<Pairing>,
        template: Option<&node::Config>,
    ) -> Result<Node<E, R, D>, Error> {
        let index = self.created;
        self.created += 1;
        let mut cfg = template.unwrap_or(&self.cfg.node).clone();
        let id = self.scratch_id();
        cfg.name = format!("node-{index}");
        cfg.workdir = self.cfg.workdir.join(format!("node-{id}"));
        cfg.network = self.cfg.network.clone();
        cfg.ip = Some(ip);
        cfg.accounts = accounts;
        if faulty {
            cfg.image = self.cfg.faulty_image.clone();
            cfg.fault_mode = Some(self.cfg.fault_mode);
        }
        if let Some(pairing) = pairing {
            cfg.env.extend(pairing.env);
            cfg.binds.extend(pairing.binds);
        }
        Node::new(
            self.context.with_label(&format!("node_{index}")),
            self.runtime.clone(),
            self.dialer.clone(),
            identity,
            cfg,
        )
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Validators, in membership order.
    pub fn fullnodes(&self) -> &[Node<E, R, D>] {
        &self.fullnodes
    }

    pub fn fullnodes_mut(&mut self) -> &mut [Node<E, R, D>] {
        &mut self.fullnodes
    }

    /// Non-validating nodes created with [Fleet::create_nodes].
    pub fn nodes(&self) -> &[Node<E, R, D>] {
        &self.nodes
    }

    pub fn nodes_mut(&mut self) -> &mut [Node<E, R, D>] {
        &mut self.nodes
    }

    /// Path of the genesis file shared by every node.
    pub fn genesis(&self) -> Option<&Path> {
        self.genesis.as_deref()
    }

    /// Funded accounts, in fullnode order.
    pub fn accounts(&self) -> Vec<Address> {
        self.accounts.iter().map(Identity::address).collect()
    }

    /// Start every fullnode, then wire a full mesh (`strong`) or a ring.
    pub async fn start(&mut self, strong: bool) -> Result<(), Error> {
        for node in &mut self.fullnodes {
            node.start().await?;
            self.metrics.nodes_started.inc();
        }
        self.connect_all(strong).await
    }

    /// Ask every fullnode to connect to every other one (`strong`) or to its successor.
    async fn connect_all(&self, strong: bool) -> Result<(), Error> {
        let enodes = self
            .fullnodes
            .iter()
            .map(|node| {
                node.enode().ok_or_else(|| Error::InvalidState {
                    node: node.name().to_string(),
                    operation: "connect",
                    state: node.state(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let n = self.fullnodes.len();
        for (index, node) in self.fullnodes.iter().enumerate() {
            let peers: Vec<usize> = if strong {
                (0..n).filter(|peer| *peer != index).collect()
            } else {
                let next = (index + 1) % n;
                if next == index {
                    Vec::new()
                } else {
                    vec![next]
                }
            };
            for peer in peers {
                node.add_peer(&enodes[peer]).await?;
            }
        }
        debug!(fullnodes = n, strong, "peers wired");
        Ok(())
    }

    /// Stop every fullnode that was started (and every running non-validating node).
    ///
    /// Nodes left behind by a failed [Fleet::add_fullnodes] are stopped as well. With `force`
    /// set stop failures are logged and teardown continues.
    pub async fn stop(&mut self, force: bool) -> Result<(), Error> {
        let running = self
            .nodes
            .iter_mut()
            .filter(|node| node.state() == node::State::Running);
        let created = self
            .fullnodes
            .iter_mut()
            .chain(self.pending.iter_mut())
            .filter(|node| node.container_id().is_some());
        for node in created.chain(running) {
            match node.stop().await {
                Ok(()) => {
                    self.metrics.nodes_stopped.inc();
                }
                Err(err) if force => warn!(node = node.name(), ?err, "stop failed"),
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Provision and start `k` fullnodes, vote them into the validator set, then wire the
    /// enlarged mesh.
    ///
    /// Every existing fullnode proposes every new address. The first failure aborts (proposals
    /// already cast are not withdrawn). Nodes provisioned by a failed call are not validators,
    /// but [Fleet::stop] and [Fleet::finalize] still tear them down.
    pub async fn add_fullnodes(&mut self, k: usize) -> Result<(), Error> {
        let genesis = self
            .genesis
            .clone()
            .ok_or_else(|| Error::InvalidConfig("fleet has no genesis".into()))?;
        if !self.pending.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "{} fullnodes left over from a failed add",
                self.pending.len()
            )));
        }
        let ips = self.subnet.allocate(k)?;
        for ip in ips {
            let identity = Identity::generate(&mut self.rng);
            let node = self.provision(identity, ip, false, Vec::new(), None, None)?;
            self.pending.push(node);
            let index = self.pending.len() - 1;
            self.pending[index].init(&genesis).await?;
            self.pending[index].start().await?;
            self.metrics.nodes_started.inc();
        }

        for candidate in &self.pending {
            for node in &self.fullnodes {
                self.propose(node, candidate.address(), true).await?;
            }
        }
        info!(
            added = self.pending.len(),
            fullnodes = self.fullnodes.len() + self.pending.len(),
            "fullnodes proposed"
        );
        self.fullnodes.append(&mut self.pending);
        self.connect_all(true).await
    }

    async fn propose(
        &self,
        node: &Node<E, R, D>,
        candidate: Address,
        authorize: bool,
    ) -> Result<(), Error> {
        let client = node.client().await?;
        client
            .propose(candidate, authorize)
            .await
            .map_err(|source| Error::ProposeFailed {
                node: node.name().to_string(),
                candidate,
                source,
            })?;
        self.metrics.proposals.inc();
        Ok(())
    }

    /// Vote the fullnodes running in `candidates` (container ids) out of the validator set and
    /// stop them.
    ///
    /// After voting, the validator set is polled on the remaining fullnodes until a BFT quorum of
    /// them no longer lists any candidate, bounded by `deadline`.
    pub async fn remove_fullnodes(
        &mut self,
        candidates: &[&str],
        deadline: Deadline,
    ) -> Result<(), Error> {
        let mut removed = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let index = self
                .fullnodes
                .iter()
                .position(|node| node.container_id() == Some(*candidate))
                .ok_or_else(|| Error::UnknownCandidate(candidate.to_string()))?;
            if !removed.contains(&index) {
                removed.push(index);
            }
        }
        let addresses: Vec<_> = removed
            .iter()
            .map(|index| self.fullnodes[*index].address())
            .collect();

        for node in &self.fullnodes {
            for candidate in &addresses {
                self.propose(node, *candidate, false).await?;
            }
        }

        let remaining: Vec<_> = (0..self.fullnodes.len())
            .filter(|index| !removed.contains(index))
            .collect();
        self.settle(&remaining, &addresses, deadline).await?;

        // Truncate membership, then stop the candidates
        let mut kept = Vec::with_capacity(remaining.len());
        let mut stopping = Vec::with_capacity(removed.len());
        for (index, node) in self.fullnodes.drain(..).enumerate() {
            if removed.contains(&index) {
                stopping.push(node);
            } else {
                kept.push(node);
            }
        }
        self.fullnodes = kept;
        for mut node in stopping {
            node.stop().await?;
            self.metrics.nodes_stopped.inc();
        }
        info!(
            removed = addresses.len(),
            fullnodes = self.fullnodes.len(),
            "fullnodes removed"
        );
        Ok(())
    }

    /// Wait until a quorum of `remaining` reports a validator set without any of `candidates`.
    async fn settle(
        &self,
        remaining: &[usize],
        candidates: &[Address],
        deadline: Deadline,
    ) -> Result<(), Error> {
        let required = proposer::quorum(remaining.len());
        let deadline = deadline.at(self.context.current());
        loop {
            let mut settled = 0;
            for index in remaining {
                let node = &self.fullnodes[*index];
                match self.validators(node).await {
                    Ok(set) if !set.iter().any(|address| candidates.contains(address)) => {
                        settled += 1;
                    }
                    Ok(_) => {}
                    Err(err) => debug!(node = node.name(), ?err, "validator set unavailable"),
                }
            }
            if settled >= required {
                debug!(settled, required, "validator set settled");
                return Ok(());
            }
            if expired(deadline, self.context.current()) {
                return Err(Error::SettleTimeout {
                    candidates: candidates.len(),
                });
            }
            self.context.sleep(self.cfg.settle_interval).await;
        }
    }

    async fn validators(&self, node: &Node<E, R, D>) -> Result<Vec<Address>, Error> {
        let client = node.client().await?;
        client.fullnodes(None).await.map_err(|source| Error::Rpc {
            node: node.name().to_string(),
            operation: "fullnodes",
            source,
        })
    }

    /// Monitor `nodes` for `timeout`.
    ///
    /// Returns the first liveness error, or `Ok` when the timeout elapses with every node making
    /// progress.
    pub async fn ensure_consensus_working(
        &self,
        nodes: &[Node<E, R, D>],
        timeout: Duration,
    ) -> Result<(), Error> {
        let mut targets = Vec::with_capacity(nodes.len());
        for node in nodes {
            targets.push((node.name().to_string(), node.client().await?));
        }
        let result = monitor::ensure_progress(
            self.context.with_label("liveness"),
            targets,
            self.cfg.monitor,
            timeout,
        )
        .await;
        self.metrics.verdict(&result);
        result
    }

    /// Provision `n` non-validating nodes from `template` against the fleet's genesis.
    ///
    /// Returns the indices of the new nodes in [Fleet::nodes]. Nothing is started.
    pub async fn create_nodes(
        &mut self,
        n: usize,
        template: &node::Config,
    ) -> Result<Range<usize>, Error> {
        let genesis = self
            .genesis
            .clone()
            .ok_or_else(|| Error::InvalidConfig("fleet has no genesis".into()))?;
        let ips = self.subnet.allocate(n)?;
        let first = self.nodes.len();
        for ip in ips {
            let identity = Identity::generate(&mut self.rng);
            let mut node = self.provision(identity, ip, false, Vec::new(), None, Some(template))?;
            node.init(&genesis).await?;
            self.nodes.push(node);
        }
        Ok(first..self.nodes.len())
    }

    /// Remove the genesis directory and the working directory of every node.
    pub fn finalize(&mut self) {
        let mut dirs: Vec<PathBuf> = self
            .fullnodes
            .iter()
            .chain(self.pending.iter())
            .chain(self.nodes.iter())
            .map(|node| node.config().workdir.clone())
            .collect();
        if let Some(dir) = self.genesis.take().and_then(|path| path.parent().map(Path::to_path_buf))
        {
            dirs.push(dir);
        }
        for dir in dirs {
            remove_dir(&dir);
        }
    }
}

fn remove_dir(dir: &Path) {
    match fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(dir = %dir.display(), ?err, "failed to remove"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::Cluster;
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Runner};
    use std::collections::BTreeSet;

    fn config(dir: &Path, fullnodes: usize) -> Config {
        Config {
            fullnodes,
            workdir: dir.to_path_buf(),
            network: Some("testnet".into()),
            ..Config::default()
        }
    }

    #[test_traced]
    fn test_provision() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let dir = tempfile::tempdir().unwrap();
            let cluster = Cluster::new();
            let subnet = Subnet::new(Ipv4Addr::new(172, 18, 0, 0), 16);
            let cfg = Config {
                faulty: 1,
                ..config(dir.path(), 3)
            };
            let mut fleet = Fleet::new(
                context,
                cluster.runtime(),
                cluster.dialer(),
                subnet.clone(),
                cfg,
            )
            .await
            .unwrap();
            assert_eq!(fleet.fullnodes().len(), 4);
            assert_eq!(subnet.remaining(), 65533 - 4);
            assert_eq!(cluster.pulls(), 2);

            // Every fullnode is a genesis validator and every account is funded
            let genesis = fleet.genesis().unwrap().to_path_buf();
            let validators: BTreeSet<_> = genesis::fullnodes(&genesis).unwrap().into_iter().collect();
            let expected: BTreeSet<_> = fleet.fullnodes().iter().map(Node::address).collect();
            assert_eq!(validators, expected);
            let funded: BTreeSet<_> = genesis::allocations(&genesis)
                .unwrap()
                .into_iter()
                .map(|(account, _)| account)
                .collect();
            assert!(fleet.accounts().iter().all(|account| funded.contains(account)));
            assert_eq!(funded.len(), 8);

            // Node i owns account i, faulty nodes run the faulty image
            for (node, account) in fleet.fullnodes().iter().zip(fleet.accounts()) {
                assert_eq!(node.accounts(), &[account]);
            }
            let faulty = &fleet.fullnodes()[3];
            assert_eq!(faulty.config().image, DEFAULT_FAULTY_IMAGE);
            assert_eq!(faulty.config().fault_mode, Some(1));
            assert_eq!(fleet.fullnodes()[0].config().fault_mode, None);

            // Genesis is computed once
            let again = fleet.ensure_genesis(&[Address::repeat_byte(1)]).unwrap();
            assert_eq!(again, genesis);
            assert_eq!(genesis::fullnodes(&genesis).unwrap().len(), 4);

            fleet.finalize();
            assert!(!genesis.exists());
        });
    }

    #[test]
    fn test_invalid_config() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let dir = tempfile::tempdir().unwrap();
            let cluster = Cluster::new();
            let subnet = Subnet::new(Ipv4Addr::new(172, 18, 0, 0), 16);
            let result = Fleet::new(
                context.clone(),
                cluster.runtime(),
                cluster.dialer(),
                subnet.clone(),
                config(dir.path(), 0),
            )
            .await;
            assert!(matches!(result, Err(Error::InvalidConfig(_))));

            let cfg = Config {
                pairings: vec![Pairing {
                    env: Vec::new(),
                    binds: Vec::new(),
                }],
                ..config(dir.path(), 2)
            };
            let result = Fleet::new(context, cluster.runtime(), cluster.dialer(), subnet, cfg).await;
            assert!(matches!(result, Err(Error::InvalidConfig(_))));
        });
    }

    #[test_traced]
    fn test_address_exhaustion() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let dir = tempfile::tempdir().unwrap();
            let cluster = Cluster::new();
            let subnet = Subnet::new(Ipv4Addr::new(10, 0, 0, 0), 29);
            let result = Fleet::new(
                context,
                cluster.runtime(),
                cluster.dialer(),
                subnet.clone(),
                config(dir.path(), 6),
            )
            .await;
            assert!(matches!(
                result,
                Err(Error::Subnet(crate::subnet::Error::AddressExhausted {
                    requested: 6,
                    remaining: 5
                }))
            ));
            assert_eq!(subnet.remaining(), 5);
            assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
        });
    }

    #[test_traced]
    fn test_init_failure_leaves_no_dirs() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let dir = tempfile::tempdir().unwrap();
            let cluster = Cluster::new();
            cluster.fail_init(true);
            let subnet = Subnet::new(Ipv4Addr::new(172, 18, 0, 0), 16);
            let result = Fleet::new(
                context,
                cluster.runtime(),
                cluster.dialer(),
                subnet,
                config(dir.path(), 4),
            )
            .await;
            assert!(matches!(result, Err(Error::InitFailed { code: 1, .. })));
            assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
        });
    }

    #[test_traced]
    fn test_failed_add_is_torn_down() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let dir = tempfile::tempdir().unwrap();
            let cluster = Cluster::new();
            let subnet = Subnet::new(Ipv4Addr::new(172, 18, 0, 0), 16);
            let mut cfg = config(dir.path(), 4);
            cfg.node.health_attempts = 3;
            let mut fleet = Fleet::new(context, cluster.runtime(), cluster.dialer(), subnet, cfg)
                .await
                .unwrap();
            fleet.start(true).await.unwrap();
            assert_eq!(cluster.running(), 4);

            // The new node never answers its health check
            cluster.refuse_rpc(true);
            let result = fleet.add_fullnodes(1).await;
            assert!(matches!(
                result,
                Err(Error::StartupFailed { attempts: 3, .. })
            ));
            assert_eq!(fleet.fullnodes().len(), 4);
            assert_eq!(cluster.running(), 5);
            assert!(matches!(
                fleet.add_fullnodes(1).await,
                Err(Error::InvalidConfig(_))
            ));

            // Teardown still reaches the leftover node
            fleet.stop(true).await.unwrap();
            assert_eq!(cluster.running(), 0);
            fleet.finalize();
            assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
        });
    }

    #[test_traced]
    fn test_keystores_per_fullnode() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let dir = tempfile::tempdir().unwrap();
            let cluster = Cluster::new();
            let subnet = Subnet::new(Ipv4Addr::new(172, 18, 0, 0), 16);
            let keys = tempfile::tempdir().unwrap();
            let keystores: Vec<Vec<PathBuf>> = (0..2)
                .map(|index| {
                    let path = keys.path().join(format!("key-{index}.json"));
                    fs::write(&path, "{}").unwrap();
                    vec![path]
                })
                .collect();
            let cfg = Config {
                keystores: keystores.clone(),
                ..config(dir.path(), 2)
            };
            let fleet = Fleet::new(context, cluster.runtime(), cluster.dialer(), subnet, cfg)
                .await
                .unwrap();
            for (index, (node, keystore)) in fleet.fullnodes().iter().zip(keystores).enumerate() {
                assert_eq!(node.config().keystores, keystore);
                assert!(node
                    .config()
                    .workdir
                    .join(node::KEYSTORE_DIR)
                    .join(format!("key-{index}.json"))
                    .exists());
            }

            // Keystores must cover every fullnode when given
            let cfg = Config {
                keystores: vec![Vec::new()],
                ..config(dir.path(), 2)
            };
            let result = Fleet::new(
                fleet.context.clone(),
                cluster.runtime(),
                cluster.dialer(),
                Subnet::new(Ipv4Addr::new(172, 19, 0, 0), 16),
                cfg,
            )
            .await;
            assert!(matches!(result, Err(Error::InvalidConfig(_))));
        });
    }

    #[test_traced]
    fn test_pairings() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let dir = tempfile::tempdir().unwrap();
            let cluster = Cluster::new();
            let subnet = Subnet::new(Ipv4Addr::new(172, 18, 0, 0), 16);
            let pairings: Vec<_> = (0..2)
                .map(|index| Pairing {
                    env: vec![(
                        crate::vault::PRIVATE_CONFIG.to_string(),
                        format!("/ctdata/{index}.conf"),
                    )],
                    binds: vec![container::Bind::new(dir.path().join(index.to_string()), "/ctdata")],
                })
                .collect();
            let cfg = Config {
                pairings: pairings.clone(),
                ..config(dir.path(), 2)
            };
            let fleet = Fleet::new(context, cluster.runtime(), cluster.dialer(), subnet, cfg)
                .await
                .unwrap();
            for (node, pairing) in fleet.fullnodes().iter().zip(pairings) {
                assert_eq!(node.config().env, pairing.env);
                assert_eq!(node.config().binds, pairing.binds);
            }
        });
    }
}
