//! One containerized blockchain node.
//!
//! A [Node] moves through [State::Uninitialized] → [State::Initialized] → [State::Running] →
//! [State::Stopped]. Initialization imports the fleet's genesis in a throwaway container, start
//! creates the long-lived container and blocks until the RPC server answers, and stop tears the
//! container down and reclaims the node's working directory.
//!
//! Every wait a scenario performs against a single node lives in [wait].

use crate::{
    client::{Dialer, Endpoint, Scheme},
    container::{self, Bind, Port, Runtime, Spec, ADDRESS_LABEL, NAME_LABEL, ROLE_LABEL},
    genesis,
    identity::Identity,
    Error,
};
use alloy_primitives::{address, Address};
use commonware_runtime::Clock;
use std::{
    collections::BTreeMap,
    fs, io,
    net::Ipv4Addr,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info, warn};

pub mod wait;

/// Image of the node binary.
pub const DEFAULT_IMAGE: &str = "quay.io/smilo/go-smilo:latest";

/// Account credited with mined blocks unless configured otherwise.
pub const DEFAULT_ETHERBASE: Address = address!("1a9afb711302c5f83b5902843d1c007a1a137632");

/// Name of the password file inside the data directory.
pub const PASSWORD_FILE: &str = "password.txt";

/// Name of the keystore directory inside the data directory.
pub const KEYSTORE_DIR: &str = "keystore";

/// APIs exposed over RPC.
const DEFAULT_APIS: &[&str] = &[
    "admin", "db", "debug", "eth", "miner", "net", "personal", "shh", "txpool", "web3",
    "smilobft", "sport",
];

/// Lifecycle of a [Node].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Uninitialized,
    Initialized,
    Running,
    Stopped,
}

/// Configuration for a [Node].
#[derive(Clone, Debug)]
pub struct Config {
    /// Name used for the container hostname, labels and logs.
    pub name: String,

    pub image: String,

    /// Host directory mounted as the node's data directory.
    pub workdir: PathBuf,

    /// Data directory inside the container.
    pub datadir: PathBuf,

    /// Network to attach the container to.
    pub network: Option<String>,

    /// Static address on `network`. When absent the address is read back after start.
    pub ip: Option<Ipv4Addr>,

    pub p2p_port: u16,
    pub rpc_port: u16,

    /// Publish the RPC port on this host port and dial it through `127.0.0.1`.
    ///
    /// When absent the RPC server is dialed directly on the container address.
    pub host_rpc_port: Option<u16>,

    pub network_id: u64,
    pub rpc_apis: Vec<String>,
    pub etherbase: Address,

    /// Start sealing blocks as soon as the node starts.
    pub mine: bool,

    /// Misbehavior the node binary should exhibit (`--sport.faultymode`).
    pub fault_mode: Option<u64>,

    /// Funded accounts owned by this node.
    pub accounts: Vec<Address>,

    /// Encrypted key files copied into the node's keystore and unlocked at start.
    pub keystores: Vec<PathBuf>,

    /// Content of the password file used to unlock `keystores`.
    pub password: String,

    /// Extra environment (e.g. the vault pairing).
    pub env: Vec<(String, String)>,

    /// Extra volumes (e.g. the vault working directory).
    pub binds: Vec<Bind>,

    /// Arguments appended to the generated command line.
    pub extra_args: Vec<String>,

    /// Number of RPC health checks performed after start.
    pub health_attempts: usize,

    /// Delay between health checks.
    pub health_interval: Duration,

    /// Time a stopping container is given before it is killed.
    pub stop_grace: Duration,

    /// Poll interval of block waits.
    pub block_interval: Duration,

    /// Poll interval of peer waits.
    pub peer_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "node".into(),
            image: DEFAULT_IMAGE.into(),
            workdir: std::env::temp_dir().join("node"),
            datadir: PathBuf::from("/data"),
            network: None,
            ip: None,
            p2p_port: 30303,
            rpc_port: 8545,
            host_rpc_port: None,
            network_id: 2017,
            rpc_apis: DEFAULT_APIS.iter().map(|api| api.to_string()).collect(),
            etherbase: DEFAULT_ETHERBASE,
            mine: true,
            fault_mode: None,
            accounts: Vec::new(),
            keystores: Vec::new(),
            password: String::new(),
            env: Vec::new(),
            binds: Vec::new(),
            extra_args: Vec::new(),
            health_attempts: 60,
            health_interval: Duration::from_secs(2),
            stop_grace: Duration::from_secs(30),
            block_interval: Duration::from_millis(500),
            peer_interval: Duration::from_secs(1),
        }
    }
}

impl Config {
    fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            return Err(Error::InvalidConfig("node name is empty".into()));
        }
        if self.image.is_empty() {
            return Err(Error::InvalidConfig(format!("{}: image is empty", self.name)));
        }
        if self.health_attempts == 0 {
            return Err(Error::InvalidConfig(format!(
                "{}: health_attempts must be positive",
                self.name
            )));
        }
        if self.rpc_port == 0 || self.p2p_port == 0 {
            return Err(Error::InvalidConfig(format!("{}: ports must be set", self.name)));
        }
        if self.keystores.iter().any(|path| path.file_name().is_none()) {
            return Err(Error::InvalidConfig(format!(
                "{}: keystore path without a file name",
                self.name
            )));
        }
        if self.ip.is_some() && self.network.is_none() {
            return Err(Error::InvalidConfig(format!(
                "{}: a static address requires a network",
                self.name
            )));
        }
        Ok(())
    }
}

/// A node container managed through `R` and reached through `D`.
pub struct Node<E: Clock, R: Runtime, D: Dialer> {
    context: E,
    runtime: R,
    dialer: D,

    identity: Identity,
    cfg: Config,

    state: State,
    container: Option<container::Id>,
    ip: Option<Ipv4Addr>,
}

impl<E: Clock, R: Runtime, D: Dialer> Node<E, R, D> {
    /// Create an uninitialized node.
    pub fn new(
        context: E,
        runtime: R,
        dialer: D,
        identity: Identity,
        cfg: Config,
    ) -> Result<Self, Error> {
        cfg.validate()?;
        let ip = cfg.ip;
        Ok(Self {
            context,
            runtime,
            dialer,
            identity,
            cfg,
            state: State::Uninitialized,
            container: None,
            ip,
        })
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Account address of the node (its validator address).
    pub fn address(&self) -> Address {
        self.identity.address()
    }

    /// Funded accounts owned by the node.
    pub fn accounts(&self) -> &[Address] {
        &self.cfg.accounts
    }

    /// Container hosting the node, once started.
    pub fn container_id(&self) -> Option<&str> {
        self.container.as_deref()
    }

    /// Address of the node on the fleet network, once known.
    pub fn ip(&self) -> Option<Ipv4Addr> {
        self.ip
    }

    /// Enode URL peers use to reach the node, once its address is known.
    pub fn enode(&self) -> Option<String> {
        self.ip.map(|ip| self.identity.enode(ip, self.cfg.p2p_port))
    }

    /// RPC endpoint of the node, once its address is known.
    pub fn endpoint(&self) -> Option<Endpoint> {
        match self.cfg.host_rpc_port {
            Some(port) => Some(Endpoint {
                scheme: Scheme::Http,
                host: Ipv4Addr::LOCALHOST.to_string(),
                port,
            }),
            None => self.ip.map(|ip| Endpoint {
                scheme: Scheme::Http,
                host: ip.to_string(),
                port: self.cfg.rpc_port,
            }),
        }
    }

    /// Dial the node's RPC endpoint.
    pub async fn client(&self) -> Result<D::Client, Error> {
        let endpoint = self.endpoint().ok_or_else(|| self.invalid("dial"))?;
        self.dialer
            .dial(&endpoint)
            .await
            .map_err(|source| self.rpc("dial", source))
    }

    fn invalid(&self, operation: &'static str) -> Error {
        Error::InvalidState {
            node: self.cfg.name.clone(),
            operation,
            state: self.state,
        }
    }

    fn rpc(&self, operation: &'static str, source: crate::client::Error) -> Error {
        Error::Rpc {
            node: self.cfg.name.clone(),
            operation,
            source,
        }
    }

    fn runtime_error(&self, operation: &'static str, source: container::Error) -> Error {
        Error::Runtime {
            node: self.cfg.name.clone(),
            operation,
            source,
        }
    }

    fn labels(&self, role: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (ADDRESS_LABEL.to_string(), format!("{:#x}", self.address())),
            (NAME_LABEL.to_string(), self.cfg.name.clone()),
            (ROLE_LABEL.to_string(), role.to_string()),
        ])
    }

    fn datadir_bind(&self) -> Bind {
        Bind::new(&self.cfg.workdir, &self.cfg.datadir)
    }

    /// Command line of the long-lived container.
    pub fn flags(&self) -> Vec<String> {
        let datadir = self.cfg.datadir.display().to_string();
        let mut flags = vec![
            "--datadir".to_string(),
            datadir.clone(),
            "--port".to_string(),
            self.cfg.p2p_port.to_string(),
            "--nodekey".to_string(),
            self.cfg.datadir.join(crate::identity::NODEKEY_PATH).display().to_string(),
            "--networkid".to_string(),
            self.cfg.network_id.to_string(),
            "--rpc".to_string(),
            "--rpcaddr".to_string(),
            "0.0.0.0".to_string(),
            "--rpcport".to_string(),
            self.cfg.rpc_port.to_string(),
            "--rpcapi".to_string(),
            self.cfg.rpc_apis.join(","),
            "--rpccorsdomain".to_string(),
            "*".to_string(),
            "--nat".to_string(),
            "any".to_string(),
            "--nodiscover".to_string(),
            "--syncmode".to_string(),
            "full".to_string(),
        ];
        if self.cfg.mine {
            flags.push("--mine".to_string());
            flags.push("--etherbase".to_string());
            flags.push(format!("{:#x}", self.cfg.etherbase));
        }
        if !self.cfg.keystores.is_empty() {
            let unlock = (0..self.cfg.keystores.len())
                .map(|index| index.to_string())
                .collect::<Vec<_>>()
                .join(",");
            flags.push("--unlock".to_string());
            flags.push(unlock);
            flags.push("--password".to_string());
            flags.push(format!("{datadir}/{PASSWORD_FILE}"));
        }
        if let Some(mode) = self.cfg.fault_mode {
            flags.push(format!("--sport.faultymode={mode}"));
        }
        flags.extend(self.cfg.extra_args.iter().cloned());
        flags
    }

    /// Prepare the working directory and import `genesis`.
    ///
    /// On failure the working directory is removed and the node stays uninitialized.
    pub async fn init(&mut self, genesis: &Path) -> Result<(), Error> {
        if self.state != State::Uninitialized {
            return Err(self.invalid("init"));
        }
        if let Err(err) = self.import(genesis).await {
            self.reclaim();
            return Err(err);
        }
        self.state = State::Initialized;
        debug!(node = self.cfg.name.as_str(), "initialized");
        Ok(())
    }

    async fn import(&self, genesis: &Path) -> Result<(), Error> {
        let keystore = self.cfg.workdir.join(KEYSTORE_DIR);
        fs::create_dir_all(&keystore)?;
        for source in &self.cfg.keystores {
            if let Some(name) = source.file_name() {
                fs::copy(source, keystore.join(name))?;
            }
        }
        fs::write(self.cfg.workdir.join(PASSWORD_FILE), &self.cfg.password)?;
        self.identity.save_nodekey(&self.cfg.workdir)?;

        let target = Path::new("/").join(genesis::FILE_NAME);
        let spec = Spec {
            image: self.cfg.image.clone(),
            cmd: vec![
                "init".to_string(),
                "--datadir".to_string(),
                self.cfg.datadir.display().to_string(),
                target.display().to_string(),
            ],
            binds: vec![Bind::new(genesis, target), self.datadir_bind()],
            labels: self.labels("init"),
            ..Spec::default()
        };
        let code = self
            .runtime
            .run(&spec, &[])
            .await
            .map_err(|source| self.runtime_error("init", source))?;
        if code != 0 {
            return Err(Error::InitFailed {
                node: self.cfg.name.clone(),
                code,
            });
        }
        Ok(())
    }

    /// Create and start the container, then wait for the RPC server to answer.
    pub async fn start(&mut self) -> Result<(), Error> {
        if self.state != State::Initialized {
            return Err(self.invalid("start"));
        }
        let mut binds = self.cfg.binds.clone();
        binds.push(self.datadir_bind());
        let ports = self
            .cfg
            .host_rpc_port
            .map(|host| Port {
                container: self.cfg.rpc_port,
                host,
            })
            .into_iter()
            .collect();
        let spec = Spec {
            image: self.cfg.image.clone(),
            cmd: self.flags(),
            hostname: Some(self.cfg.name.clone()),
            env: self.cfg.env.clone(),
            binds,
            ports,
            network: self.cfg.network.clone(),
            ip: self.cfg.ip,
            labels: self.labels("node"),
        };
        let id = self
            .runtime
            .create(&spec)
            .await
            .map_err(|source| self.runtime_error("create", source))?;
        self.container = Some(id.clone());
        self.runtime
            .start(&id)
            .await
            .map_err(|source| self.runtime_error("start", source))?;

        if self.ip.is_none() {
            if let Some(network) = &self.cfg.network {
                self.ip = self
                    .runtime
                    .inspect_ip(&id, network)
                    .await
                    .map_err(|source| self.runtime_error("inspect", source))?;
            }
        }

        self.health_check().await?;
        self.state = State::Running;
        info!(
            node = self.cfg.name.as_str(),
            container = id.as_str(),
            address = %self.address(),
            "started"
        );
        Ok(())
    }

    /// Poll block 0 until the RPC server answers or the attempts are exhausted.
    async fn health_check(&self) -> Result<(), Error> {
        for attempt in 0..self.cfg.health_attempts {
            if attempt > 0 {
                self.context.sleep(self.cfg.health_interval).await;
            }
            let Ok(client) = self.client().await else {
                continue;
            };
            match crate::client::Client::header_by_number(&client, Some(0)).await {
                Ok(Some(_)) => return Ok(()),
                Ok(None) => debug!(node = self.cfg.name.as_str(), attempt, "genesis missing"),
                Err(err) => debug!(node = self.cfg.name.as_str(), attempt, ?err, "not ready"),
            }
        }
        Err(Error::StartupFailed {
            node: self.cfg.name.clone(),
            attempts: self.cfg.health_attempts,
        })
    }

    /// Stop and remove the container and reclaim the working directory.
    ///
    /// A graceful stop failure is only logged. Stopping a node whose container is already gone
    /// returns [Error::NotFound].
    pub async fn stop(&mut self) -> Result<(), Error> {
        let Some(id) = self.container.clone() else {
            return Err(Error::NotFound {
                node: self.cfg.name.clone(),
            });
        };
        if let Err(err) = self.runtime.stop(&id, self.cfg.stop_grace).await {
            warn!(node = self.cfg.name.as_str(), ?err, "graceful stop failed");
        }
        let removed = self.runtime.remove(&id, true).await;
        self.reclaim();
        self.state = State::Stopped;
        match removed {
            Ok(()) => {
                info!(node = self.cfg.name.as_str(), container = id.as_str(), "stopped");
                Ok(())
            }
            Err(container::Error::NotFound(_)) => Err(Error::NotFound {
                node: self.cfg.name.clone(),
            }),
            Err(source) => Err(self.runtime_error("remove", source)),
        }
    }

    fn reclaim(&self) {
        match fs::remove_dir_all(&self.cfg.workdir) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(node = self.cfg.name.as_str(), ?err, "failed to reclaim workdir"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{client::Client as _, mocks::Cluster};
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Runner};
    use rand::{rngs::StdRng, SeedableRng};

    fn config(name: &str, workdir: &Path, ip: Ipv4Addr) -> Config {
        Config {
            name: name.into(),
            workdir: workdir.join(name),
            network: Some("testnet".into()),
            ip: Some(ip),
            ..Config::default()
        }
    }

    #[test_traced]
    fn test_lifecycle() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let dir = tempfile::tempdir().unwrap();
            let identity = Identity::generate(&mut StdRng::seed_from_u64(0));
            let genesis = genesis::create(
                dir.path(),
                &genesis::Config::default(),
                &[identity.address()],
                &[],
            )
            .unwrap();

            let cluster = Cluster::new();
            let cfg = config("node-0", dir.path(), Ipv4Addr::new(172, 18, 0, 2));
            let workdir = cfg.workdir.clone();
            let mut node = Node::new(
                context.clone(),
                cluster.runtime(),
                cluster.dialer(),
                identity,
                cfg,
            )
            .unwrap();
            assert!(matches!(node.start().await, Err(Error::InvalidState { .. })));

            node.init(&genesis).await.unwrap();
            assert_eq!(node.state(), State::Initialized);
            assert!(workdir.join(crate::identity::NODEKEY_PATH).exists());
            assert!(matches!(node.init(&genesis).await, Err(Error::InvalidState { .. })));

            node.start().await.unwrap();
            assert_eq!(node.state(), State::Running);
            assert_eq!(cluster.running(), 1);
            assert_eq!(
                node.enode().unwrap(),
                format!("enode://{}@172.18.0.2:30303?discport=0", node.identity().id())
            );
            let client = node.client().await.unwrap();
            assert_eq!(client.fullnodes(None).await.unwrap(), vec![node.address()]);

            node.stop().await.unwrap();
            assert_eq!(node.state(), State::Stopped);
            assert_eq!(cluster.running(), 0);
            assert!(!workdir.exists());

            // The container is gone
            assert!(matches!(node.stop().await, Err(Error::NotFound { .. })));
        });
    }

    #[test_traced]
    fn test_init_failure() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let dir = tempfile::tempdir().unwrap();
            let cluster = Cluster::new();
            cluster.fail_init(true);
            let identity = Identity::generate(&mut StdRng::seed_from_u64(0));
            let genesis =
                genesis::create(dir.path(), &genesis::Config::default(), &[], &[]).unwrap();
            let mut node = Node::new(
                context,
                cluster.runtime(),
                cluster.dialer(),
                identity,
                config("node-0", dir.path(), Ipv4Addr::new(172, 18, 0, 2)),
            )
            .unwrap();
            assert!(matches!(
                node.init(&genesis).await,
                Err(Error::InitFailed { code: 1, .. })
            ));
            assert_eq!(node.state(), State::Uninitialized);
            assert!(!dir.path().join("node-0").exists());
        });
    }

    #[test_traced]
    fn test_startup_failure() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let dir = tempfile::tempdir().unwrap();
            let cluster = Cluster::new();
            cluster.refuse_rpc(true);
            let identity = Identity::generate(&mut StdRng::seed_from_u64(0));
            let genesis = genesis::create(
                dir.path(),
                &genesis::Config::default(),
                &[identity.address()],
                &[],
            )
            .unwrap();
            let cfg = Config {
                health_attempts: 5,
                ..config("node-0", dir.path(), Ipv4Addr::new(172, 18, 0, 2))
            };
            let mut node = Node::new(
                context.clone(),
                cluster.runtime(),
                cluster.dialer(),
                identity,
                cfg,
            )
            .unwrap();
            node.init(&genesis).await.unwrap();
            let started = context.current();
            assert!(matches!(
                node.start().await,
                Err(Error::StartupFailed { attempts: 5, .. })
            ));
            // 4 pauses between 5 attempts
            assert_eq!(
                context.current().duration_since(started).unwrap(),
                Duration::from_secs(8)
            );

            // The container can still be reclaimed
            node.stop().await.unwrap();
            assert_eq!(cluster.running(), 0);
        });
    }

    #[test]
    fn test_invalid_config() {
        let context = deterministic::Runner::default();
        context.start(|context| async move {
            let cluster = Cluster::new();
            let identity = Identity::generate(&mut StdRng::seed_from_u64(0));
            let cfg = Config {
                ip: Some(Ipv4Addr::new(172, 18, 0, 2)),
                ..Config::default()
            };
            assert!(matches!(
                Node::new(context, cluster.runtime(), cluster.dialer(), identity, cfg),
                Err(Error::InvalidConfig(_))
            ));
        });
    }

    #[test]
    fn test_flags() {
        let context = deterministic::Runner::default();
        context.start(|context| async move {
            let cluster = Cluster::new();
            let identity = Identity::generate(&mut StdRng::seed_from_u64(0));
            let cfg = Config {
                accounts: vec![Address::repeat_byte(1), Address::repeat_byte(2)],
                fault_mode: Some(1),
                extra_args: vec!["--verbosity".into(), "4".into()],
                ..Config::default()
            };
            let node = Node::new(
                context,
                cluster.runtime(),
                cluster.dialer(),
                identity.clone(),
                cfg.clone(),
            )
            .unwrap();
            let flags = node.flags();
            let joined = flags.join(" ");
            assert!(joined.starts_with("--datadir /data --port 30303 --nodekey /data/geth/nodekey"));
            assert!(joined.contains("--etherbase 0x1a9afb711302c5f83b5902843d1c007a1a137632"));
            assert!(joined.contains("--sport.faultymode=1"));
            assert!(joined.ends_with("--verbosity 4"));

            // Accounts without keystores are never unlocked
            assert!(!flags.iter().any(|flag| flag == "--unlock" || flag == "--password"));

            let cfg = Config {
                keystores: vec![PathBuf::from("/keys/a.json"), PathBuf::from("/keys/b.json")],
                ..cfg
            };
            let node = Node::new(
                node.context.clone(),
                cluster.runtime(),
                cluster.dialer(),
                identity,
                cfg,
            )
            .unwrap();
            assert!(node
                .flags()
                .join(" ")
                .contains("--unlock 0,1 --password /data/password.txt"));
        });
    }

    #[test_traced]
    fn test_keystores_copied() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let dir = tempfile::tempdir().unwrap();
            let keys = dir.path().join("keys");
            fs::create_dir_all(&keys).unwrap();
            let keystore = keys.join("UTC--2020-01-01T00-00-00Z--account");
            fs::write(&keystore, r#"{"version":3}"#).unwrap();

            let identity = Identity::generate(&mut StdRng::seed_from_u64(0));
            let genesis = genesis::create(
                dir.path(),
                &genesis::Config::default(),
                &[identity.address()],
                &[],
            )
            .unwrap();
            let cluster = Cluster::new();
            let cfg = Config {
                keystores: vec![keystore.clone()],
                password: "secret".into(),
                ..config("node-0", dir.path(), Ipv4Addr::new(172, 18, 0, 2))
            };
            let workdir = cfg.workdir.clone();
            let mut node =
                Node::new(context, cluster.runtime(), cluster.dialer(), identity, cfg).unwrap();
            node.init(&genesis).await.unwrap();
            let copied = workdir
                .join(KEYSTORE_DIR)
                .join("UTC--2020-01-01T00-00-00Z--account");
            assert_eq!(fs::read_to_string(copied).unwrap(), r#"{"version":3}"#);
            assert_eq!(
                fs::read_to_string(workdir.join(PASSWORD_FILE)).unwrap(),
                "secret"
            );

            // A missing keystore fails init and leaves nothing behind
            let identity = Identity::generate(&mut StdRng::seed_from_u64(1));
            let cfg = Config {
                keystores: vec![keys.join("missing")],
                ..config("node-1", dir.path(), Ipv4Addr::new(172, 18, 0, 3))
            };
            let mut node = Node::new(
                node.context.clone(),
                cluster.runtime(),
                cluster.dialer(),
                identity,
                cfg,
            )
            .unwrap();
            assert!(matches!(node.init(&genesis).await, Err(Error::Io(_))));
            assert!(!dir.path().join("node-1").exists());
        });
    }
}
