//! The container network of one test run.

use crate::{
    container::{self, NetworkSpec, Runtime},
    subnet::{Registry, Subnet},
    Error,
};
use commonware_runtime::Clock;
use std::time::UNIX_EPOCH;
use tracing::{debug, info};

/// Attempts made to create a network before giving up.
pub const MAX_ATTEMPTS: usize = 15;

/// A bridge network backed by a [Subnet] reserved from a [Registry].
pub struct Network<R: Runtime> {
    runtime: R,
    name: String,
    subnet: Subnet,
}

impl<R: Runtime> Network<R> {
    /// Create a network named after the current time.
    ///
    /// When the runtime reports a conflict (name taken or range overlapping a network created
    /// outside this process) a fresh range is reserved and creation is retried.
    pub async fn create<E: Clock>(
        context: &E,
        runtime: R,
        registry: &Registry,
    ) -> Result<Self, Error> {
        let seconds = context
            .current()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();
        let mut last = None;
        for attempt in 0..MAX_ATTEMPTS {
            let subnet = registry.reserve()?;
            let name = if attempt == 0 {
                format!("testnet{seconds}")
            } else {
                format!("testnet{seconds}-{attempt}")
            };
            let spec = NetworkSpec {
                name: name.clone(),
                cidr: subnet.cidr(),
                gateway: subnet.gateway(),
            };
            match runtime.create_network(&spec).await {
                Ok(_) => {
                    info!(network = name.as_str(), cidr = spec.cidr.as_str(), "network created");
                    return Ok(Self {
                        runtime,
                        name,
                        subnet,
                    });
                }
                Err(container::Error::Conflict(reason)) => {
                    debug!(
                        network = name.as_str(),
                        attempt,
                        reason = reason.as_str(),
                        "network conflict"
                    );
                    last = Some(container::Error::Conflict(reason));
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(last
            .map(Error::Container)
            .unwrap_or_else(|| Error::InvalidConfig("no network attempts".into())))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subnet addresses of the network's containers are allocated from.
    pub fn subnet(&self) -> &Subnet {
        &self.subnet
    }

    /// Remove the network.
    pub async fn remove(self) -> Result<(), Error> {
        self.runtime.remove_network(&self.name).await?;
        info!(network = self.name.as_str(), "network removed");
        Ok(())
    }
}
