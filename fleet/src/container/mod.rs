//! Container primitives consumed by the fleet.
//!
//! The [Runtime] trait is the only way the fleet touches containers. [Docker] drives the local
//! `docker` CLI and [crate::mocks::Cluster] provides an in-memory implementation.

use std::{
    collections::BTreeMap,
    fmt,
    future::Future,
    net::Ipv4Addr,
    path::PathBuf,
    time::Duration,
};
use thiserror::Error;

mod docker;
pub use docker::Docker;

/// Identifier assigned to a container by the [Runtime].
pub type Id = String;

/// Label carrying the account address of the node running in a container.
pub const ADDRESS_LABEL: &str = "fleet.address";

/// Label carrying the role of a container (`node`, `init`, `vault`).
pub const ROLE_LABEL: &str = "fleet.role";

/// Label carrying the name of a container.
pub const NAME_LABEL: &str = "fleet.name";

/// Errors that can occur when interacting with the container runtime.
#[derive(Error, Debug)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("`{command}` failed ({status:?}): {stderr}")]
    Failed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("unable to decode output: {0}")]
    Decode(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// A host path mounted into a container.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Bind {
    pub source: PathBuf,
    pub target: PathBuf,
}

impl Bind {
    pub fn new(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

impl fmt::Display for Bind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source.display(), self.target.display())
    }
}

/// A container port published on `0.0.0.0` of the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Port {
    pub container: u16,
    pub host: u16,
}

/// Everything required to create a container.
#[derive(Clone, Debug, Default)]
pub struct Spec {
    pub image: String,
    pub cmd: Vec<String>,
    pub hostname: Option<String>,
    pub env: Vec<(String, String)>,
    pub binds: Vec<Bind>,
    pub ports: Vec<Port>,

    /// Network to attach to.
    pub network: Option<String>,

    /// Static address on `network`.
    pub ip: Option<Ipv4Addr>,

    pub labels: BTreeMap<String, String>,
}

/// Everything required to create a bridge network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkSpec {
    pub name: String,
    pub cidr: String,
    pub gateway: Ipv4Addr,
}

/// Interface to create, run and tear down containers and networks.
pub trait Runtime: Clone + Send + Sync + 'static {
    /// Returns true if `image` is available locally.
    fn image_exists(&self, image: &str) -> impl Future<Output = Result<bool, Error>> + Send;

    /// Fetch `image` from its registry.
    fn pull_image(&self, image: &str) -> impl Future<Output = Result<(), Error>> + Send;

    /// Create a network, failing with [Error::Conflict] if the name or range is taken.
    fn create_network(&self, spec: &NetworkSpec)
        -> impl Future<Output = Result<Id, Error>> + Send;

    /// Remove a network.
    fn remove_network(&self, name: &str) -> impl Future<Output = Result<(), Error>> + Send;

    /// Run a throwaway container to completion, writing `stdin` to it, and return its exit code.
    ///
    /// The container is removed whether or not it succeeded.
    fn run(&self, spec: &Spec, stdin: &[u8]) -> impl Future<Output = Result<i64, Error>> + Send;

    /// Create a long-lived container.
    fn create(&self, spec: &Spec) -> impl Future<Output = Result<Id, Error>> + Send;

    /// Start a created container.
    fn start(&self, id: &str) -> impl Future<Output = Result<(), Error>> + Send;

    /// Ask a container to stop, killing it after `grace`.
    fn stop(&self, id: &str, grace: Duration) -> impl Future<Output = Result<(), Error>> + Send;

    /// Remove a container (killing it first if `force` is set).
    fn remove(&self, id: &str, force: bool) -> impl Future<Output = Result<(), Error>> + Send;

    /// Address of a container on `network`, if attached.
    fn inspect_ip(
        &self,
        id: &str,
        network: &str,
    ) -> impl Future<Output = Result<Option<Ipv4Addr>, Error>> + Send;
}

/// Pull `image` unless it is already available.
pub async fn ensure_image<R: Runtime>(runtime: &R, image: &str) -> Result<(), Error> {
    if runtime.image_exists(image).await? {
        return Ok(());
    }
    runtime.pull_image(image).await
}
