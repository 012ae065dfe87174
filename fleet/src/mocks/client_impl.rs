use super::{Cluster, Proposal, State, SUBSCRIPTION_BUFFER};
use crate::client::{self, Endpoint, Error, Header, Peer, Subscription};
use alloy_primitives::{Address, U256};
use futures::channel::mpsc;
use std::net::Ipv4Addr;

/// A [client::Dialer] over a [Cluster].
#[derive(Clone)]
pub struct Dialer {
    cluster: Cluster,
}

impl Dialer {
    pub(super) fn new(cluster: Cluster) -> Self {
        Self { cluster }
    }
}

impl client::Dialer for Dialer {
    type Client = Client;

    async fn dial(&self, endpoint: &Endpoint) -> Result<Client, Error> {
        Ok(Client {
            cluster: self.cluster.clone(),
            endpoint: endpoint.clone(),
        })
    }
}

/// A [client::Client] answering from the [Cluster] container behind an endpoint.
///
/// The endpoint is resolved on every call: calls fail with [Error::Transport] while no running
/// container answers on it.
#[derive(Clone)]
pub struct Client {
    cluster: Cluster,
    endpoint: Endpoint,
}

impl Client {
    /// Resolve the endpoint and run `f` against the container behind it.
    fn with<T>(&self, f: impl FnOnce(&mut State, &str) -> Result<T, Error>) -> Result<T, Error> {
        let mut state = self.cluster.lock();
        if state.refuse_rpc {
            return Err(Error::Transport(format!("{}: connection refused", self.endpoint)));
        }
        let host: Ipv4Addr = self
            .endpoint
            .host
            .parse()
            .map_err(|_| Error::Transport(format!("{}: unknown host", self.endpoint)))?;
        let id = state
            .containers
            .iter()
            .find(|(_, container)| {
                if !container.running {
                    return false;
                }
                if host.is_loopback() {
                    container
                        .spec
                        .ports
                        .iter()
                        .any(|port| port.host == self.endpoint.port)
                } else {
                    container.ip == Some(host)
                }
            })
            .map(|(id, _)| id.clone())
            .ok_or_else(|| Error::Transport(format!("{}: connection refused", self.endpoint)))?;
        f(&mut state, &id)
    }
}

fn no_chain() -> Error {
    Error::Rpc {
        code: -32000,
        message: "genesis not initialized".into(),
    }
}

/// Parse the id and address out of an enode URL.
fn parse_enode(enode: &str) -> Option<(String, Ipv4Addr)> {
    let rest = enode.strip_prefix("enode://")?;
    let (id, rest) = rest.split_once('@')?;
    let (ip, _) = rest.split_once(':')?;
    Some((id.to_string(), ip.parse().ok()?))
}

impl client::Client for Client {
    async fn block_number(&self) -> Result<u64, Error> {
        self.with(|state, _| {
            let chain = state.chain.as_ref().ok_or_else(no_chain)?;
            Ok(chain.head().number)
        })
    }

    async fn header_by_number(&self, number: Option<u64>) -> Result<Option<Header>, Error> {
        self.with(|state, _| {
            let chain = state.chain.as_ref().ok_or_else(no_chain)?;
            Ok(match number {
                None => Some(chain.head().clone()),
                Some(number) => chain.headers.get(number as usize).cloned(),
            })
        })
    }

    async fn balance(&self, account: Address) -> Result<U256, Error> {
        self.with(|state, _| Ok(state.balances.get(&account).copied().unwrap_or_default()))
    }

    async fn peers(&self) -> Result<Vec<Peer>, Error> {
        self.with(|state, id| {
            let container = &state.containers[id];
            Ok(container
                .peers
                .iter()
                .map(|(ip, peer)| Peer {
                    id: peer.clone(),
                    name: "mock".into(),
                    remote_address: format!("{ip}:30303"),
                })
                .collect())
        })
    }

    async fn add_peer(&self, enode: &str) -> Result<bool, Error> {
        let (peer, ip) = parse_enode(enode).ok_or_else(|| Error::Rpc {
            code: -32602,
            message: format!("invalid enode: {enode}"),
        })?;
        self.with(|state, id| {
            let (own_ip, own_id) = {
                let container = &state.containers[id];
                (
                    container.ip,
                    container.identity.as_ref().map(|identity| identity.id().to_string()),
                )
            };
            if own_ip == Some(ip) {
                return Ok(false);
            }
            if let Some(container) = state.containers.get_mut(id) {
                container.peers.insert(ip, peer);
            }

            // Connections are bidirectional
            if let (Some(own_ip), Some(remote)) = (
                own_ip,
                state
                    .containers
                    .values_mut()
                    .find(|container| container.running && container.ip == Some(ip)),
            ) {
                let own_id = own_id.unwrap_or_else(|| own_ip.to_string());
                remote.peers.insert(own_ip, own_id);
            }
            Ok(true)
        })
    }

    async fn start_mining(&self) -> Result<(), Error> {
        self.with(|state, id| {
            if let Some(container) = state.containers.get_mut(id) {
                container.mining = true;
            }
            Ok(())
        })
    }

    async fn stop_mining(&self) -> Result<(), Error> {
        self.with(|state, id| {
            if let Some(container) = state.containers.get_mut(id) {
                container.mining = false;
            }
            Ok(())
        })
    }

    async fn propose(&self, candidate: Address, authorize: bool) -> Result<(), Error> {
        self.with(|state, id| {
            let voter = state.containers[id].address.ok_or(Error::Rpc {
                code: -32000,
                message: "no signing account".into(),
            })?;
            let chain = state.chain.as_mut().ok_or_else(no_chain)?;
            chain
                .votes
                .entry(candidate)
                .or_default()
                .insert(voter, authorize);
            state.proposals.push(Proposal {
                voter,
                candidate,
                authorize,
            });
            Ok(())
        })
    }

    async fn fullnodes(&self, number: Option<u64>) -> Result<Vec<Address>, Error> {
        self.with(|state, _| {
            let chain = state.chain.as_ref().ok_or_else(no_chain)?;
            chain
                .set_at(number)
                .map(<[Address]>::to_vec)
                .ok_or_else(|| Error::Rpc {
                    code: -32000,
                    message: "unknown block".into(),
                })
        })
    }

    async fn subscribe_new_heads(&self) -> Result<Subscription, Error> {
        self.with(|state, id| {
            let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
            state.subscribers.push((id.to_string(), sender));
            Ok(receiver)
        })
    }
}
