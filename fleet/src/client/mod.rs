//! JSON-RPC capabilities of a running node.
//!
//! The fleet never speaks a wire protocol directly: it dials an [Endpoint] through a [Dialer] and
//! uses the returned [Client]. [http::Dialer] talks JSON-RPC over HTTP and
//! [crate::mocks::Cluster] answers from a simulated chain.

use crate::{genesis, identity};
use alloy_primitives::{keccak256, Address, Bloom, Bytes, B256, B64, U256};
use futures::channel::mpsc;
use rlp::RlpStream;
use serde::{Deserialize, Serialize};
use std::{fmt, future::Future, str::FromStr};
use thiserror::Error;

pub mod http;

/// Errors that can occur when interacting with a node over RPC.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("transport: {0}")]
    Transport(String),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("decode: {0}")]
    Decode(String),
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(Scheme),
    #[error("subscription closed")]
    SubscriptionClosed,
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Transport used to reach an [Endpoint].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Ws,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Http => write!(f, "http"),
            Scheme::Ws => write!(f, "ws"),
        }
    }
}

/// Address of a node's RPC server.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    /// Parse `<scheme>://<host>:<port>` (a trailing `/` is ignored).
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidEndpoint(raw.to_string());
        let (scheme, rest) = raw.split_once("://").ok_or_else(invalid)?;
        let scheme = match scheme {
            "http" => Scheme::Http,
            "ws" => Scheme::Ws,
            _ => return Err(invalid()),
        };
        let (host, port) = rest
            .trim_end_matches('/')
            .rsplit_once(':')
            .ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse().map_err(|_| invalid())?;
        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
        })
    }
}

/// A block header as reported by `eth_getBlockByNumber`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Header {
    pub parent_hash: B256,
    pub uncles_hash: B256,

    /// Coinbase credited with the block. Under the BFT engine this is a configured etherbase, not
    /// the proposer (see [Header::proposer]).
    pub miner: Address,

    pub state_root: B256,
    pub transactions_root: B256,
    pub receipts_root: B256,
    pub logs_bloom: Bloom,
    pub difficulty: U256,
    pub number: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub timestamp: u64,
    pub extra_data: Bytes,
    pub mix_hash: B256,
    pub nonce: B64,

    pub hash: B256,
}

impl Header {
    /// Hash the proposer signs: the RLP header with seal and committed seals stripped from
    /// `extra_data`.
    pub fn seal_hash(&self) -> Result<B256, genesis::Error> {
        let extra = genesis::Extra::decode(&self.extra_data)?.filtered().encode();
        let difficulty = self.difficulty.to_be_bytes_trimmed_vec();
        let mut stream = RlpStream::new_list(15);
        stream.append(&self.parent_hash.as_slice());
        stream.append(&self.uncles_hash.as_slice());
        stream.append(&self.miner.as_slice());
        stream.append(&self.state_root.as_slice());
        stream.append(&self.transactions_root.as_slice());
        stream.append(&self.receipts_root.as_slice());
        stream.append(&self.logs_bloom.as_slice());
        stream.append(&difficulty.as_slice());
        stream.append(&self.number);
        stream.append(&self.gas_limit);
        stream.append(&self.gas_used);
        stream.append(&self.timestamp);
        stream.append(&&extra[..]);
        stream.append(&self.mix_hash.as_slice());
        stream.append(&self.nonce.as_slice());
        Ok(keccak256(stream.out()))
    }

    /// Address of the validator that sealed the block, recovered from the seal in `extra_data`.
    pub fn proposer(&self) -> Result<Address, Error> {
        let seal = genesis::Extra::decode(&self.extra_data)
            .map_err(|err| Error::Decode(err.to_string()))?
            .seal;
        let hash = self
            .seal_hash()
            .map_err(|err| Error::Decode(err.to_string()))?;
        identity::recover(hash.as_slice(), &seal).map_err(|err| Error::Decode(err.to_string()))
    }

    /// Sign the block as `signer`, replacing any previous seal.
    pub fn seal(&mut self, signer: &identity::Identity) -> Result<(), Error> {
        let hash = self
            .seal_hash()
            .map_err(|err| Error::Decode(err.to_string()))?;
        let signature = signer
            .sign(hash.as_slice())
            .map_err(|err| Error::Decode(err.to_string()))?;
        let mut extra = genesis::Extra::decode(&self.extra_data)
            .map_err(|err| Error::Decode(err.to_string()))?;
        extra.seal = signature.to_vec();
        self.extra_data = extra.encode();
        Ok(())
    }
}

/// A connected peer reported by `admin_peers`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Peer {
    pub id: String,
    pub name: String,
    pub remote_address: String,
}

/// Stream of new heads.
///
/// The stream ending (or yielding an error) means the subscription was lost.
pub type Subscription = mpsc::Receiver<Result<Header, Error>>;

/// RPC interface of a running node.
pub trait Client: Clone + Send + Sync + 'static {
    /// Latest block number.
    fn block_number(&self) -> impl Future<Output = Result<u64, Error>> + Send;

    /// Header at `number` (latest if `None`), if it exists.
    fn header_by_number(
        &self,
        number: Option<u64>,
    ) -> impl Future<Output = Result<Option<Header>, Error>> + Send;

    /// Balance of `account` at the latest block.
    fn balance(&self, account: Address) -> impl Future<Output = Result<U256, Error>> + Send;

    /// Currently connected peers.
    fn peers(&self) -> impl Future<Output = Result<Vec<Peer>, Error>> + Send;

    /// Ask the node to connect to `enode`.
    fn add_peer(&self, enode: &str) -> impl Future<Output = Result<bool, Error>> + Send;

    /// Resume block production.
    fn start_mining(&self) -> impl Future<Output = Result<(), Error>> + Send;

    /// Pause block production without stopping the process.
    fn stop_mining(&self) -> impl Future<Output = Result<(), Error>> + Send;

    /// Vote to add (`authorize`) or remove `candidate` from the validator set.
    fn propose(
        &self,
        candidate: Address,
        authorize: bool,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Validator set at `number` (latest if `None`), sorted by address.
    fn fullnodes(
        &self,
        number: Option<u64>,
    ) -> impl Future<Output = Result<Vec<Address>, Error>> + Send;

    /// Subscribe to new heads.
    fn subscribe_new_heads(&self) -> impl Future<Output = Result<Subscription, Error>> + Send;
}

/// Interface to connect to an [Endpoint].
pub trait Dialer: Clone + Send + Sync + 'static {
    type Client: Client;

    fn dial(&self, endpoint: &Endpoint) -> impl Future<Output = Result<Self::Client, Error>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_parse_endpoint() {
        let endpoint: Endpoint = "http://172.18.0.2:8545/".parse().unwrap();
        assert_eq!(
            endpoint,
            Endpoint {
                scheme: Scheme::Http,
                host: "172.18.0.2".into(),
                port: 8545,
            }
        );
        assert_eq!(endpoint.to_string(), "http://172.18.0.2:8545");
        assert_eq!("ws://node:8546".parse::<Endpoint>().unwrap().scheme, Scheme::Ws);

        for raw in ["172.18.0.2:8545", "tcp://node:1", "http://node", "http://:1", "http://node:x"] {
            assert!(matches!(
                raw.parse::<Endpoint>(),
                Err(Error::InvalidEndpoint(_))
            ));
        }
    }

    fn unsealed(number: u64, fullnodes: &[Address]) -> Header {
        Header {
            number,
            difficulty: U256::from(1),
            gas_limit: 4_700_000,
            timestamp: 1_600_000_000 + number,
            miner: crate::node::DEFAULT_ETHERBASE,
            mix_hash: genesis::SPORT_DIGEST,
            extra_data: genesis::Extra {
                fullnodes: fullnodes.to_vec(),
                ..genesis::Extra::default()
            }
            .encode(),
            ..Header::default()
        }
    }

    #[test]
    fn test_proposer_from_seal() {
        let mut rng = StdRng::seed_from_u64(5);
        let signers: Vec<_> = (0..2).map(|_| Identity::generate(&mut rng)).collect();
        let fullnodes: Vec<_> = signers.iter().map(Identity::address).collect();

        // Blocks share a coinbase but not a proposer
        for (number, signer) in signers.iter().enumerate() {
            let mut header = unsealed(number as u64 + 1, &fullnodes);
            let hash = header.seal_hash().unwrap();
            header.seal(signer).unwrap();
            assert_eq!(header.seal_hash().unwrap(), hash);
            assert_eq!(header.miner, crate::node::DEFAULT_ETHERBASE);
            assert_eq!(header.proposer().unwrap(), signer.address());
        }

        // Altering a signed field changes the recovered signer
        let mut header = unsealed(1, &fullnodes);
        header.seal(&signers[0]).unwrap();
        header.gas_used = 21_000;
        assert_ne!(header.proposer().ok(), Some(signers[0].address()));

        // Unsealed (genesis-style) headers have no proposer
        let genesis = Header {
            extra_data: genesis::extra_data(&fullnodes),
            ..Header::default()
        };
        assert!(matches!(genesis.proposer(), Err(Error::Decode(_))));
        assert!(matches!(Header::default().proposer(), Err(Error::Decode(_))));
    }
}
