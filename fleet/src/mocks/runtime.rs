use super::{node_identity, not_found, Cluster, Container};
use crate::{
    container::{self, Error, Id, NetworkSpec, Spec, ADDRESS_LABEL},
    genesis,
};
use alloy_primitives::Address;
use std::{
    collections::BTreeMap,
    fs,
    net::Ipv4Addr,
    path::{Path, PathBuf},
    time::Duration,
};

/// Flag of the vault key-generation command.
const GENERATE_KEYS: &str = "--generate-keys=";

/// A [container::Runtime] over a [Cluster].
#[derive(Clone)]
pub struct Runtime {
    cluster: Cluster,
}

impl Runtime {
    pub(super) fn new(cluster: Cluster) -> Self {
        Self { cluster }
    }
}

/// Map a path inside a container to the host path it is bound to.
fn host_path(spec: &Spec, path: &Path) -> Option<PathBuf> {
    spec.binds.iter().find_map(|bind| {
        let rest = path.strip_prefix(&bind.target).ok()?;
        if rest.as_os_str().is_empty() {
            return Some(bind.source.clone());
        }
        Some(bind.source.join(rest))
    })
}

fn fail(command: &str, stderr: impl Into<String>) -> Error {
    Error::Failed {
        command: command.to_string(),
        status: Some(1),
        stderr: stderr.into(),
    }
}

impl container::Runtime for Runtime {
    async fn image_exists(&self, image: &str) -> Result<bool, Error> {
        Ok(self.cluster.lock().images.contains(image))
    }

    async fn pull_image(&self, image: &str) -> Result<(), Error> {
        let mut state = self.cluster.lock();
        state.images.insert(image.to_string());
        state.pulls += 1;
        Ok(())
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<Id, Error> {
        let mut state = self.cluster.lock();
        if state.networks.contains_key(&spec.name) {
            return Err(Error::Conflict(format!("network {} already exists", spec.name)));
        }
        if state.occupied.contains(&spec.cidr)
            || state.networks.values().any(|network| network.cidr == spec.cidr)
        {
            return Err(Error::Conflict(format!("pool overlaps: {}", spec.cidr)));
        }
        state.networks.insert(spec.name.clone(), spec.clone());
        Ok(spec.name.clone())
    }

    async fn remove_network(&self, name: &str) -> Result<(), Error> {
        self.cluster
            .lock()
            .networks
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found(name))
    }

    async fn run(&self, spec: &Spec, _stdin: &[u8]) -> Result<i64, Error> {
        let mut state = self.cluster.lock();
        if spec.cmd.first().is_some_and(|cmd| cmd == "init") {
            if state.fail_init {
                return Ok(1);
            }
            let target = Path::new("/").join(genesis::FILE_NAME);
            let Some(path) = host_path(spec, &target) else {
                return Ok(1);
            };
            state
                .seed(&path)
                .map_err(|err| fail("init", err.to_string()))?;
            return Ok(0);
        }
        if let Some(key) = spec.cmd.iter().find_map(|arg| arg.strip_prefix(GENERATE_KEYS)) {
            let Some(key) = host_path(spec, Path::new(key)) else {
                return Ok(1);
            };
            let name = key.display().to_string();
            fs::write(format!("{name}.pub"), format!("{name}-public"))?;
            fs::write(format!("{name}.key"), format!("{name}-private"))?;
            return Ok(0);
        }
        Ok(0)
    }

    async fn create(&self, spec: &Spec) -> Result<Id, Error> {
        let mut state = self.cluster.lock();
        state.next_id += 1;
        let id = format!("{:012x}", state.next_id);
        let address = spec
            .labels
            .get(ADDRESS_LABEL)
            .and_then(|address| address.parse::<Address>().ok());
        let container = Container {
            spec: spec.clone(),
            running: false,
            ip: spec.ip,
            address,
            identity: node_identity(spec),
            mining: spec.cmd.iter().any(|arg| arg == "--mine"),
            peers: BTreeMap::new(),
        };
        state.containers.insert(id.clone(), container);
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), Error> {
        let mut state = self.cluster.lock();
        state.next_ip = state.next_ip.wrapping_add(1);
        let dynamic = Ipv4Addr::new(172, 31, 0, state.next_ip);
        let container = state.containers.get_mut(id).ok_or_else(|| not_found(id))?;
        if container.ip.is_none() && container.spec.network.is_some() {
            container.ip = Some(dynamic);
        }
        container.running = true;
        Ok(())
    }

    async fn stop(&self, id: &str, _grace: Duration) -> Result<(), Error> {
        let mut state = self.cluster.lock();
        let container = state.containers.get_mut(id).ok_or_else(|| not_found(id))?;
        container.running = false;
        container.peers.clear();
        state.close_subscriptions(id);
        Ok(())
    }

    async fn remove(&self, id: &str, force: bool) -> Result<(), Error> {
        let mut state = self.cluster.lock();
        let running = state
            .containers
            .get(id)
            .map(|container| container.running)
            .ok_or_else(|| not_found(id))?;
        if running && !force {
            return Err(Error::Conflict(format!("container {id} is running")));
        }
        state.containers.remove(id);
        state.close_subscriptions(id);
        Ok(())
    }

    async fn inspect_ip(&self, id: &str, network: &str) -> Result<Option<Ipv4Addr>, Error> {
        let state = self.cluster.lock();
        let container = state.containers.get(id).ok_or_else(|| not_found(id))?;
        if container.spec.network.as_deref() != Some(network) {
            return Ok(None);
        }
        Ok(container.ip)
    }
}
