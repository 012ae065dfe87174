//! Privacy-manager sidecars paired 1:1 with nodes.
//!
//! Each [Vault] runs in its own container with a static address on the fleet network. Its key
//! pair is generated up front by a throwaway container (which reads an empty password from
//! stdin). A node is paired with its vault by pointing `PRIVATE_CONFIG` at the vault's config
//! file and mounting the vault's working directory (see [Pairing]).

use crate::{
    container::{self, Bind, Runtime, Spec, NAME_LABEL, ROLE_LABEL},
    subnet::Subnet,
    Error,
};
use rand::RngCore;
use std::{
    collections::BTreeMap,
    fs, io,
    net::Ipv4Addr,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{info, warn};
use uuid::Builder;

/// Image of the vault binary.
pub const DEFAULT_IMAGE: &str = "quay.io/smilo/smilo-blackbox:latest";

/// Environment variable pointing a node at its vault's config file.
pub const PRIVATE_CONFIG: &str = "PRIVATE_CONFIG";

/// Configuration for a [Vault].
#[derive(Clone, Debug)]
pub struct Config {
    pub name: String,
    pub image: String,

    /// Working directory inside the container.
    pub workdir: PathBuf,

    /// Host directory mounted as `workdir`.
    pub local_workdir: PathBuf,

    /// Base name of the key pair, config file and socket.
    pub key_name: String,

    pub network: Option<String>,
    pub ip: Ipv4Addr,
    pub port: u16,

    /// URLs of every other vault of the fleet.
    pub others: Vec<String>,

    /// Time a stopping container is given before it is killed.
    pub stop_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "vault".into(),
            image: DEFAULT_IMAGE.into(),
            workdir: PathBuf::from("/ctdata"),
            local_workdir: std::env::temp_dir().join("vault"),
            key_name: "node".into(),
            network: None,
            ip: Ipv4Addr::LOCALHOST,
            port: 9000,
            others: Vec::new(),
            stop_grace: Duration::from_secs(10),
        }
    }
}

/// Environment and volumes that pair a node with a [Vault].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pairing {
    pub env: Vec<(String, String)>,
    pub binds: Vec<Bind>,
}

/// A vault container.
pub struct Vault<R: Runtime> {
    runtime: R,
    cfg: Config,
    container: Option<container::Id>,
}

impl<R: Runtime> Vault<R> {
    pub fn new(runtime: R, cfg: Config) -> Result<Self, Error> {
        if cfg.key_name.is_empty() {
            return Err(Error::InvalidConfig(format!("{}: key name is empty", cfg.name)));
        }
        if cfg.port == 0 {
            return Err(Error::InvalidConfig(format!("{}: port must be set", cfg.name)));
        }
        Ok(Self {
            runtime,
            cfg,
            container: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    fn key_path(&self, extension: &str) -> PathBuf {
        self.cfg
            .workdir
            .join(format!("{}.{extension}", self.cfg.key_name))
    }

    fn local_key_path(&self, extension: &str) -> PathBuf {
        self.cfg
            .local_workdir
            .join(format!("{}.{extension}", self.cfg.key_name))
    }

    /// URL other vaults reach this vault on.
    pub fn host(&self) -> String {
        format!("http://{}:{}/", self.cfg.ip, self.cfg.port)
    }

    /// Path of the config file, as seen from inside a container.
    pub fn config_path(&self) -> PathBuf {
        self.key_path("conf")
    }

    /// Host directory holding the key pair and config file.
    pub fn local_workdir(&self) -> &Path {
        &self.cfg.local_workdir
    }

    /// Volumes that expose the working directory to a paired node.
    pub fn binds(&self) -> Vec<Bind> {
        vec![Bind::new(&self.cfg.local_workdir, &self.cfg.workdir)]
    }

    /// Environment and volumes that pair a node with this vault.
    pub fn pairing(&self) -> Pairing {
        Pairing {
            env: vec![(
                PRIVATE_CONFIG.to_string(),
                self.config_path().display().to_string(),
            )],
            binds: self.binds(),
        }
    }

    /// Generated public keys.
    pub fn public_keys(&self) -> Result<Vec<String>, Error> {
        let key = fs::read_to_string(self.local_key_path("pub"))?;
        Ok(vec![key.trim().to_string()])
    }

    fn labels(&self, role: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (NAME_LABEL.to_string(), self.cfg.name.clone()),
            (ROLE_LABEL.to_string(), role.to_string()),
        ])
    }

    /// Command line of the long-lived container.
    pub fn flags(&self) -> Vec<String> {
        let mut flags = vec![
            format!("--storage={}", self.cfg.workdir.display()),
            format!("--privatekeys={}", self.key_path("key").display()),
            format!("--publickeys={}", self.key_path("pub").display()),
            format!("--socket={}", self.key_path("ipc").display()),
            format!("--port={}", self.cfg.port),
            format!("--hostname={}", self.host()),
        ];
        if !self.cfg.others.is_empty() {
            flags.push(format!("--othernodes={}", self.cfg.others.join(",")));
        }
        flags
    }

    /// Write the config file and generate the key pair.
    pub async fn generate_key(&self) -> Result<(), Error> {
        fs::create_dir_all(&self.cfg.local_workdir)?;
        let config = format!(
            "socket=\"{}\"\npublickeys=[\"{}\"]\n",
            self.key_path("ipc").display(),
            self.key_path("pub").display()
        );
        fs::write(self.local_key_path("conf"), config)?;

        let spec = Spec {
            image: self.cfg.image.clone(),
            cmd: vec![format!(
                "--generate-keys={}",
                self.cfg.workdir.join(&self.cfg.key_name).display()
            )],
            binds: self.binds(),
            labels: self.labels("keygen"),
            ..Spec::default()
        };

        // The key generator reads its (empty) password from stdin
        let code = self
            .runtime
            .run(&spec, b"")
            .await
            .map_err(|source| self.runtime_error("generate_key", source))?;
        if code != 0 {
            return Err(Error::KeyGenerationFailed {
                vault: self.cfg.name.clone(),
                code,
            });
        }
        Ok(())
    }

    /// Create and start the container.
    pub async fn start(&mut self) -> Result<(), Error> {
        if self.container.is_some() {
            return Err(Error::InvalidConfig(format!("{}: already started", self.cfg.name)));
        }
        let spec = Spec {
            image: self.cfg.image.clone(),
            cmd: self.flags(),
            binds: self.binds(),
            network: self.cfg.network.clone(),
            ip: self.cfg.network.as_ref().map(|_| self.cfg.ip),
            labels: self.labels("vault"),
            ..Spec::default()
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
        info!(vault = self.cfg.name.as_str(), host = %self.host(), "started");
        Ok(())
    }

    /// Stop and remove the container, then reclaim the working directory.
    ///
    /// Unlike nodes, a failed graceful stop is returned (and nothing is reclaimed).
    pub async fn stop(&mut self) -> Result<(), Error> {
        let Some(id) = self.container.clone() else {
            return Err(Error::NotFound {
                node: self.cfg.name.clone(),
            });
        };
        self.runtime
            .stop(&id, self.cfg.stop_grace)
            .await
            .map_err(|source| self.runtime_error("stop", source))?;
        self.reclaim();
        self.runtime
            .remove(&id, true)
            .await
            .map_err(|source| self.runtime_error("remove", source))?;
        self.container = None;
        info!(vault = self.cfg.name.as_str(), "stopped");
        Ok(())
    }

    fn reclaim(&self) {
        match fs::remove_dir_all(&self.cfg.local_workdir) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(vault = self.cfg.name.as_str(), ?err, "failed to reclaim workdir"),
        }
    }

    fn runtime_error(&self, operation: &'static str, source: container::Error) -> Error {
        Error::Runtime {
            node: self.cfg.name.clone(),
            operation,
            source,
        }
    }
}

/// Configuration for a [Network] of vaults.
#[derive(Clone, Debug)]
pub struct NetworkConfig {
    /// Number of vaults (one per fullnode).
    pub count: usize,

    /// Template every vault is derived from (`name`, `ip`, `port`, `others` and `local_workdir`
    /// are assigned per vault).
    pub template: Config,

    /// Port of the first vault; vault `i` listens on `base_port + i`.
    pub base_port: u16,

    /// Host directory below which each vault's working directory is created.
    pub scratch: PathBuf,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            count: 0,
            template: Config::default(),
            base_port: 9000,
            scratch: std::env::temp_dir(),
        }
    }
}

/// The vaults of one fleet, each configured with the URL of every other one.
pub struct Network<R: Runtime> {
    vaults: Vec<Vault<R>>,
}

impl<R: Runtime> Network<R> {
    /// Allocate addresses from `subnet`, configure every vault and generate its keys.
    pub async fn new<G: RngCore>(
        rng: &mut G,
        runtime: R,
        subnet: &Subnet,
        network: Option<String>,
        cfg: NetworkConfig,
    ) -> Result<Self, Error> {
        if cfg.base_port as usize + cfg.count > u16::MAX as usize + 1 {
            return Err(Error::InvalidConfig(format!(
                "{} vaults do not fit above port {}",
                cfg.count, cfg.base_port
            )));
        }
        container::ensure_image(&runtime, &cfg.template.image).await?;

        let ips = subnet.allocate(cfg.count)?;
        let hosts: Vec<_> = ips
            .iter()
            .enumerate()
            .map(|(index, ip)| (*ip, cfg.base_port + index as u16))
            .collect();
        let url = |(ip, port): &(Ipv4Addr, u16)| format!("http://{ip}:{port}/");

        let mut vaults = Vec::with_capacity(cfg.count);
        for (index, host) in hosts.iter().enumerate() {
            let others = hosts
                .iter()
                .enumerate()
                .filter(|(other, _)| *other != index)
                .map(|(_, host)| url(host))
                .collect();
            let mut id = [0u8; 16];
            rng.fill_bytes(&mut id);
            let vault_cfg = Config {
                name: format!("vault-{index}"),
                local_workdir: cfg
                    .scratch
                    .join(Builder::from_random_bytes(id).into_uuid().to_string()),
                network: network.clone(),
                ip: host.0,
                port: host.1,
                others,
                ..cfg.template.clone()
            };
            let vault = Vault::new(runtime.clone(), vault_cfg)?;
            vault.generate_key().await?;
            vaults.push(vault);
        }
        Ok(Self { vaults })
    }

    pub fn len(&self) -> usize {
        self.vaults.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vaults.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Vault<R>> {
        self.vaults.get(index)
    }

    /// Pairing for the node at `index`.
    pub fn pairing(&self, index: usize) -> Option<Pairing> {
        self.vaults.get(index).map(Vault::pairing)
    }

    /// Pairings for every vault, in order.
    pub fn pairings(&self) -> Vec<Pairing> {
        self.vaults.iter().map(Vault::pairing).collect()
    }

    /// Start every vault, stopping at the first failure.
    pub async fn start(&mut self) -> Result<(), Error> {
        for vault in &mut self.vaults {
            vault.start().await?;
        }
        Ok(())
    }

    /// Stop every vault, stopping at the first failure.
    pub async fn stop(&mut self) -> Result<(), Error> {
        for vault in &mut self.vaults {
            vault.stop().await?;
        }
        Ok(())
    }

    /// Reclaim every working directory (including those of vaults that never started).
    pub fn finalize(&self) {
        for vault in &self.vaults {
            vault.reclaim();
        }
    }
}
