//! Bounded waits against a single node.

use super::Node;
use crate::{
    client::{Client, Dialer},
    container::Runtime,
    expired, fanout, timeout, Deadline, Error,
};
use alloy_primitives::{Address, U256};
use commonware_macros::select;
use commonware_runtime::Clock;
use futures::StreamExt;
use std::time::{Duration, SystemTime};
use tracing::debug;

impl<E: Clock, R: Runtime, D: Dialer> Node<E, R, D> {
    /// Wait until at least `expected` peers are connected.
    pub async fn wait_for_peers_connected(
        &self,
        expected: usize,
        deadline: Deadline,
    ) -> Result<(), Error> {
        let client = self.client().await?;
        let deadline = deadline.at(self.context.current());
        loop {
            let peers = client
                .peers()
                .await
                .map_err(|source| self.rpc("peers", source))?;
            if peers.len() >= expected {
                return Ok(());
            }
            if expired(deadline, self.context.current()) {
                return Err(Error::Timeout {
                    node: self.cfg.name.clone(),
                    operation: "wait_for_peers_connected",
                });
            }
            self.context.sleep(self.cfg.peer_interval).await;
        }
    }

    /// Wait until `n` blocks have been produced since the first poll.
    pub async fn wait_for_blocks(&self, n: u64, deadline: Deadline) -> Result<(), Error> {
        let client = self.client().await?;
        let deadline = deadline.at(self.context.current());
        let baseline = self.block_number(&client).await?;
        loop {
            let current = self.block_number(&client).await?;
            if current.saturating_sub(baseline) >= n {
                return Ok(());
            }
            if expired(deadline, self.context.current()) {
                return Err(Error::NoBlockProduced {
                    node: self.cfg.name.clone(),
                });
            }
            self.context.sleep(self.cfg.block_interval).await;
        }
    }

    /// Wait until the chain reaches height `height`.
    pub async fn wait_for_block_height(&self, height: u64, deadline: Deadline) -> Result<(), Error> {
        let client = self.client().await?;
        let deadline = deadline.at(self.context.current());
        loop {
            if self.block_number(&client).await? >= height {
                return Ok(());
            }
            if expired(deadline, self.context.current()) {
                return Err(Error::NoBlockProduced {
                    node: self.cfg.name.clone(),
                });
            }
            self.context.sleep(self.cfg.block_interval).await;
        }
    }

    /// Succeed if no more than `n` blocks are produced over `duration`.
    pub async fn wait_for_no_blocks(&self, n: u64, duration: Duration) -> Result<(), Error> {
        let client = self.client().await?;
        let end = self.context.current() + duration;
        let baseline = self.block_number(&client).await?;
        loop {
            self.context.sleep(self.cfg.block_interval).await;
            let produced = self.block_number(&client).await?.saturating_sub(baseline);
            if produced > n {
                return Err(Error::UnexpectedProgress {
                    node: self.cfg.name.clone(),
                    produced,
                    allowed: n,
                });
            }
            if self.context.current() >= end {
                return Ok(());
            }
        }
    }

    /// Wait until every account in `accounts` holds a non-zero balance.
    ///
    /// All accounts are checked concurrently; the first failure (in account order) is returned.
    pub async fn wait_for_balances(
        &self,
        accounts: &[Address],
        deadline: Deadline,
    ) -> Result<(), Error> {
        let client = self.client().await?;
        let deadline = deadline.at(self.context.current());
        let outcomes = fanout::wait_for(accounts, |account| {
            self.wait_for_balance(&client, *account, deadline)
        })
        .await;
        outcomes.into_iter().collect()
    }

    /// Wait until a block sealed by `expected` is observed.
    pub async fn wait_for_proposed(&self, expected: Address, deadline: Deadline) -> Result<(), Error> {
        let client = self.client().await?;
        let deadline = deadline.at(self.context.current());
        let mut heads = client
            .subscribe_new_heads()
            .await
            .map_err(|source| self.rpc("subscribe", source))?;
        loop {
            select! {
                _ = timeout(&self.context, deadline) => {
                    return Err(Error::Timeout {
                        node: self.cfg.name.clone(),
                        operation: "wait_for_proposed",
                    });
                },
                head = heads.next() => {
                    match head {
                        Some(Ok(header)) => match header.proposer() {
                            Ok(proposer) if proposer == expected => {
                                debug!(
                                    node = self.cfg.name.as_str(),
                                    number = header.number,
                                    "proposal observed"
                                );
                                return Ok(());
                            }
                            Ok(_) => {}
                            Err(err) => debug!(
                                node = self.cfg.name.as_str(),
                                number = header.number,
                                ?err,
                                "unsealed head"
                            ),
                        },
                        Some(Err(source)) => return Err(self.rpc("new heads", source)),
                        None => {
                            return Err(Error::SubscriptionClosed {
                                node: self.cfg.name.clone(),
                            })
                        }
                    }
                },
            }
        }
    }

    /// Pause block production without stopping the node.
    pub async fn stop_mining(&self) -> Result<(), Error> {
        let client = self.client().await?;
        client
            .stop_mining()
            .await
            .map_err(|source| self.rpc("stop_mining", source))
    }

    /// Resume block production.
    pub async fn start_mining(&self) -> Result<(), Error> {
        let client = self.client().await?;
        client
            .start_mining()
            .await
            .map_err(|source| self.rpc("start_mining", source))
    }

    /// Ask the node to connect to `enode`.
    pub async fn add_peer(&self, enode: &str) -> Result<(), Error> {
        let client = self.client().await?;
        let added = client
            .add_peer(enode)
            .await
            .map_err(|source| self.rpc("add_peer", source))?;
        if !added {
            debug!(node = self.cfg.name.as_str(), enode, "peer not added");
        }
        Ok(())
    }

    async fn wait_for_balance(
        &self,
        client: &D::Client,
        account: Address,
        deadline: Option<SystemTime>,
    ) -> Result<(), Error> {
        loop {
            let balance = client
                .balance(account)
                .await
                .map_err(|source| self.rpc("balance", source))?;
            if balance > U256::ZERO {
                return Ok(());
            }
            if expired(deadline, self.context.current()) {
                return Err(Error::Timeout {
                    node: self.cfg.name.clone(),
                    operation: "wait_for_balances",
                });
            }
            self.context.sleep(self.cfg.block_interval).await;
        }
    }

    async fn block_number(&self, client: &D::Client) -> Result<u64, Error> {
        client
            .block_number()
            .await
            .map_err(|source| self.rpc("block_number", source))
    }
}
