//! JSON-RPC over HTTP.
//!
//! Head subscriptions are emulated by polling `eth_blockNumber` and fetching every header that
//! appeared since the previous poll.

use super::{Endpoint, Error, Header, Peer, Scheme, Subscription};
use alloy_primitives::{Address, Bloom, Bytes, B256, B64, U256, U64};
use commonware_runtime::{Clock, Metrics, Spawner};
use futures::{channel::mpsc, SinkExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::debug;

/// Heads buffered before the poller waits on the subscriber.
const HEAD_BUFFER: usize = 64;

/// Configuration for [Dialer].
#[derive(Clone, Debug)]
pub struct Config {
    /// Namespace of the BFT engine's RPC methods (`<namespace>_propose`, ...).
    pub namespace: String,

    /// Interval between polls of an emulated head subscription.
    pub poll_interval: Duration,

    /// Deadline for a single request.
    pub request_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: "smilobft".into(),
            poll_interval: Duration::from_millis(500),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Dials HTTP endpoints.
#[derive(Clone)]
pub struct Dialer<E: Clock + Spawner + Metrics> {
    context: E,
    http: reqwest::Client,
    namespace: Arc<str>,
    poll_interval: Duration,
}

impl<E: Clock + Spawner + Metrics> Dialer<E> {
    pub fn new(context: E, cfg: Config) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .build()
            .map_err(|err| Error::Transport(err.to_string()))?;
        Ok(Self {
            context,
            http,
            namespace: cfg.namespace.into(),
            poll_interval: cfg.poll_interval,
        })
    }
}

impl<E: Clock + Spawner + Metrics> super::Dialer for Dialer<E> {
    type Client = Client<E>;

    async fn dial(&self, endpoint: &Endpoint) -> Result<Self::Client, Error> {
        if endpoint.scheme != Scheme::Http {
            return Err(Error::UnsupportedScheme(endpoint.scheme));
        }
        Ok(Client {
            context: self.context.clone(),
            http: self.http.clone(),
            url: endpoint.to_string(),
            namespace: self.namespace.clone(),
            poll_interval: self.poll_interval,
            ids: Arc::new(AtomicU64::new(1)),
        })
    }
}

/// JSON-RPC client for one endpoint.
#[derive(Clone)]
pub struct Client<E: Clock + Spawner + Metrics> {
    context: E,
    http: reqwest::Client,
    url: String,
    namespace: Arc<str>,
    poll_interval: Duration,
    ids: Arc<AtomicU64>,
}

#[derive(Serialize)]
struct Request<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: Value,
    id: u64,
}

#[derive(Deserialize)]
struct Response {
    result: Option<Value>,
    error: Option<ResponseError>,
}

#[derive(Deserialize)]
struct ResponseError {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcHeader {
    parent_hash: B256,
    sha3_uncles: B256,
    miner: Address,
    state_root: B256,
    transactions_root: B256,
    receipts_root: B256,
    logs_bloom: Bloom,
    difficulty: U256,
    number: U64,
    gas_limit: U64,
    gas_used: U64,
    timestamp: U64,
    extra_data: Bytes,
    mix_hash: B256,
    nonce: B64,
    hash: B256,
}

impl From<RpcHeader> for Header {
    fn from(header: RpcHeader) -> Self {
        Self {
            parent_hash: header.parent_hash,
            uncles_hash: header.sha3_uncles,
            miner: header.miner,
            state_root: header.state_root,
            transactions_root: header.transactions_root,
            receipts_root: header.receipts_root,
            logs_bloom: header.logs_bloom,
            difficulty: header.difficulty,
            number: header.number.to::<u64>(),
            gas_limit: header.gas_limit.to::<u64>(),
            gas_used: header.gas_used.to::<u64>(),
            timestamp: header.timestamp.to::<u64>(),
            extra_data: header.extra_data,
            mix_hash: header.mix_hash,
            nonce: header.nonce,
            hash: header.hash,
        }
    }
}

#[derive(Deserialize)]
struct RpcPeer {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    network: RpcPeerNetwork,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcPeerNetwork {
    #[serde(default)]
    remote_address: String,
}

impl From<RpcPeer> for Peer {
    fn from(peer: RpcPeer) -> Self {
        Self {
            id: peer.id,
            name: peer.name,
            remote_address: peer.network.remote_address,
        }
    }
}

/// Render a block selector (`latest` when absent).
fn block_tag(number: Option<u64>) -> Value {
    match number {
        Some(number) => Value::String(format!("{number:#x}")),
        None => Value::String("latest".into()),
    }
}

/// Decode the payload of a JSON-RPC response.
fn decode<T: DeserializeOwned>(response: Response) -> Result<T, Error> {
    if let Some(err) = response.error {
        return Err(Error::Rpc {
            code: err.code,
            message: err.message,
        });
    }
    serde_json::from_value(response.result.unwrap_or(Value::Null))
        .map_err(|err| Error::Decode(err.to_string()))
}

impl<E: Clock + Spawner + Metrics> Client<E> {
    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, Error> {
        let request = Request {
            jsonrpc: "2.0",
            method,
            params,
            id: self.ids.fetch_add(1, Ordering::Relaxed),
        };
        let response = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|err| Error::Transport(err.to_string()))?
            .error_for_status()
            .map_err(|err| Error::Transport(err.to_string()))?
            .json::<Response>()
            .await
            .map_err(|err| Error::Decode(err.to_string()))?;
        decode(response)
    }

    fn bft_method(&self, method: &str) -> String {
        format!("{}_{}", self.namespace, method)
    }
}

impl<E: Clock + Spawner + Metrics> super::Client for Client<E> {
    async fn block_number(&self) -> Result<u64, Error> {
        let number: U64 = self.call("eth_blockNumber", json!([])).await?;
        Ok(number.to::<u64>())
    }

    async fn header_by_number(&self, number: Option<u64>) -> Result<Option<Header>, Error> {
        let header: Option<RpcHeader> = self
            .call("eth_getBlockByNumber", json!([block_tag(number), false]))
            .await?;
        Ok(header.map(Header::from))
    }

    async fn balance(&self, account: Address) -> Result<U256, Error> {
        self.call("eth_getBalance", json!([account, "latest"])).await
    }

    async fn peers(&self) -> Result<Vec<Peer>, Error> {
        let peers: Vec<RpcPeer> = self.call("admin_peers", json!([])).await?;
        Ok(peers.into_iter().map(Peer::from).collect())
    }

    async fn add_peer(&self, enode: &str) -> Result<bool, Error> {
        self.call("admin_addPeer", json!([enode])).await
    }

    async fn start_mining(&self) -> Result<(), Error> {
        let _: Value = self.call("miner_start", json!([])).await?;
        Ok(())
    }

    async fn stop_mining(&self) -> Result<(), Error> {
        let _: Value = self.call("miner_stop", json!([])).await?;
        Ok(())
    }

    async fn propose(&self, candidate: Address, authorize: bool) -> Result<(), Error> {
        let method = self.bft_method("propose");
        let _: Value = self.call(&method, json!([candidate, authorize])).await?;
        Ok(())
    }

    async fn fullnodes(&self, number: Option<u64>) -> Result<Vec<Address>, Error> {
        let method = self.bft_method("getFullnodes");
        let mut fullnodes: Vec<Address> = self.call(&method, json!([block_tag(number)])).await?;
        fullnodes.sort();
        Ok(fullnodes)
    }

    async fn subscribe_new_heads(&self) -> Result<Subscription, Error> {
        let (mut sender, receiver) = mpsc::channel(HEAD_BUFFER);
        let mut last = self.block_number().await?;
        let client = self.clone();
        self.context
            .with_label("heads")
            .spawn(move |context| async move {
                loop {
                    context.sleep(client.poll_interval).await;
                    if sender.is_closed() {
                        debug!(url = client.url.as_str(), "head subscriber dropped");
                        return;
                    }
                    let latest = match super::Client::block_number(&client).await {
                        Ok(latest) => latest,
                        Err(err) => {
                            let _ = sender.send(Err(err)).await;
                            return;
                        }
                    };
                    for number in (last + 1)..=latest {
                        let header =
                            match super::Client::header_by_number(&client, Some(number)).await {
                                Ok(Some(header)) => header,
                                Ok(None) => break,
                                Err(err) => {
                                    let _ = sender.send(Err(err)).await;
                                    return;
                                }
                            };
                        if sender.send(Ok(header)).await.is_err() {
                            return;
                        }
                        last = number;
                    }
                }
            });
        Ok(receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_tag() {
        assert_eq!(block_tag(None), json!("latest"));
        assert_eq!(block_tag(Some(0)), json!("0x0"));
        assert_eq!(block_tag(Some(255)), json!("0xff"));
    }

    #[test]
    fn test_decode_header() {
        let response: Response = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "number": "0x1b",
                "hash": "0x00000000000000000000000000000000000000000000000000000000000000aa",
                "parentHash": "0x00000000000000000000000000000000000000000000000000000000000000bb",
                "sha3Uncles": "0x1dcc4de8dec75d7aab85b567b6ccd41ad312451b948a7413f0a142fd40d49347",
                "stateRoot": "0x00000000000000000000000000000000000000000000000000000000000000cc",
                "transactionsRoot": "0x56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421",
                "receiptsRoot": "0x56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421",
                "logsBloom": format!("0x{}", "00".repeat(256)),
                "difficulty": "0x1",
                "timestamp": "0x5e0be0ff",
                "miner": "0x1a9afb711302c5f83b5902843d1c007a1a137632",
                "extraData": "0x0102",
                "gasLimit": "0x47b760",
                "gasUsed": "0x0",
                "mixHash": "0x63746963616c2062797a616e74696e65206661756c7420746f6c6572616e6365",
                "nonce": "0x0000000000000000",
                "size": "0x25c",
                "transactions": [],
                "uncles": []
            }
        }))
        .unwrap();
        let header: Option<RpcHeader> = decode(response).unwrap();
        let header = Header::from(header.unwrap());
        assert_eq!(header.number, 27);
        assert_eq!(header.timestamp, 0x5e0be0ff);
        assert_eq!(header.gas_limit, 4_700_000);
        assert_eq!(header.difficulty, U256::from(1));
        assert_eq!(header.mix_hash, crate::genesis::SPORT_DIGEST);
        assert_eq!(
            header.miner.to_string().to_lowercase(),
            "0x1a9afb711302c5f83b5902843d1c007a1a137632"
        );
        assert_eq!(header.extra_data.as_ref(), &[1u8, 2]);
    }

    #[test]
    fn test_decode_missing_block() {
        let response: Response =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": 1, "result": null})).unwrap();
        let header: Option<RpcHeader> = decode(response).unwrap();
        assert!(header.is_none());
    }

    #[test]
    fn test_decode_error() {
        let response: Response = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": -32601, "message": "the method smilobft_propose does not exist"}
        }))
        .unwrap();
        let err = decode::<Value>(response).unwrap_err();
        assert!(matches!(err, Error::Rpc { code: -32601, .. }));
    }

    #[test]
    fn test_decode_peers() {
        let response: Response = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": [
                {"id": "ab", "name": "node/v1", "network": {"remoteAddress": "172.18.0.3:30303"}},
                {"id": "cd"}
            ]
        }))
        .unwrap();
        let peers: Vec<RpcPeer> = decode(response).unwrap();
        let peers: Vec<Peer> = peers.into_iter().map(Peer::from).collect();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].remote_address, "172.18.0.3:30303");
        assert_eq!(peers[1].name, "");
    }

    #[test]
    fn test_request_shape() {
        let request = Request {
            jsonrpc: "2.0",
            method: "smilobft_propose",
            params: json!(["0x1a9afb711302c5f83b5902843d1c007a1a137632", true]),
            id: 7,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "jsonrpc": "2.0",
                "method": "smilobft_propose",
                "params": ["0x1a9afb711302c5f83b5902843d1c007a1a137632", true],
                "id": 7
            })
        );
    }
}
