//! Genesis files for BFT networks.
//!
//! The initial validator set travels in the genesis `extraData`: 32 bytes of vanity followed by
//! the RLP encoding of `[fullnodes, seal, committed_seals]`, with an all-zero seal and no
//! committed seals.

use alloy_primitives::{b256, Address, Bytes, B256, U256};
use commonware_utils::{from_hex_formatted, hex};
use rlp::{Rlp, RlpStream};
use serde_json::{json, Map, Value};
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Name of the genesis file inside its directory.
pub const FILE_NAME: &str = "genesis.json";

/// Bytes of vanity preceding the encoded validator set.
pub const EXTRA_VANITY: usize = 32;

/// Length of a proposer seal.
pub const EXTRA_SEAL: usize = 65;

/// Mix digest identifying blocks sealed by the BFT engine.
pub const SPORT_DIGEST: B256 =
    b256!("63746963616c2062797a616e74696e65206661756c7420746f6c6572616e6365");

/// Length of an account address.
const ADDRESS_LENGTH: usize = 20;

/// Errors that can occur when writing or reading a genesis file.
#[derive(Error, Debug)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("rlp: {0}")]
    Rlp(String),
    #[error("invalid extra data: {0}")]
    InvalidExtra(&'static str),
    #[error("invalid alloc: {0}")]
    InvalidAlloc(&'static str),
}

/// Chain parameters written into the genesis file.
#[derive(Clone, Debug)]
pub struct Config {
    pub chain_id: u64,
    pub gas_limit: u64,
    pub difficulty: u64,
    pub homestead_block: u64,
    pub eip150_block: u64,
    pub eip155_block: u64,
    pub eip158_block: u64,

    /// Proposer rotation policy of the BFT engine (0 = round robin).
    pub speaker_policy: u64,

    /// Number of blocks after which pending votes are reset.
    pub epoch: u64,

    pub mix_hash: B256,

    /// Genesis timestamp (unix seconds).
    pub timestamp: u64,

    /// Balance of every funded account.
    pub balance: U256,

    /// Emit the extended chain configuration flags (`isSmilo`, `isGas`, `isGasRefunded`).
    pub extended: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chain_id: 2017,
            gas_limit: 4_700_000,
            difficulty: 1,
            homestead_block: 1,
            eip150_block: 2,
            eip155_block: 3,
            eip158_block: 3,
            speaker_policy: 0,
            epoch: 30_000,
            mix_hash: SPORT_DIGEST,
            timestamp: 0,
            balance: U256::from(9u8) * U256::from(10u8).pow(U256::from(44u8)),
            extended: true,
        }
    }
}

/// BFT fields carried in a header's `extraData`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Extra {
    pub vanity: [u8; EXTRA_VANITY],

    /// Validator set the block was produced under.
    pub fullnodes: Vec<Address>,

    /// Proposer signature over the seal hash of the block (empty or zeroed if unsealed).
    pub seal: Vec<u8>,

    /// Commit signatures gathered for the block.
    pub committed_seals: Vec<Vec<u8>>,
}

fn rlp_error(err: rlp::DecoderError) -> Error {
    Error::Rlp(err.to_string())
}

impl Extra {
    /// Encode as `vanity || rlp([fullnodes, seal, committed_seals])`.
    pub fn encode(&self) -> Bytes {
        let mut stream = RlpStream::new_list(3);
        stream.begin_list(self.fullnodes.len());
        for fullnode in &self.fullnodes {
            stream.append(&fullnode.as_slice());
        }
        stream.append(&self.seal.as_slice());
        stream.begin_list(self.committed_seals.len());
        for seal in &self.committed_seals {
            stream.append(&seal.as_slice());
        }

        let mut extra = self.vanity.to_vec();
        extra.extend_from_slice(&stream.out());
        extra.into()
    }

    pub fn decode(extra: &[u8]) -> Result<Self, Error> {
        if extra.len() < EXTRA_VANITY {
            return Err(Error::InvalidExtra("missing vanity"));
        }
        let mut vanity = [0u8; EXTRA_VANITY];
        vanity.copy_from_slice(&extra[..EXTRA_VANITY]);
        let rlp = Rlp::new(&extra[EXTRA_VANITY..]);

        let fullnodes = rlp.at(0).map_err(rlp_error)?;
        if !fullnodes.is_list() {
            return Err(Error::InvalidExtra("fullnodes not a list"));
        }
        let fullnodes = fullnodes
            .iter()
            .map(|item| {
                let data = item.data().map_err(rlp_error)?;
                if data.len() != ADDRESS_LENGTH {
                    return Err(Error::InvalidExtra("malformed address"));
                }
                Ok(Address::from_slice(data))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let seal = rlp
            .at(1)
            .and_then(|item| item.data().map(<[u8]>::to_vec))
            .map_err(rlp_error)?;

        let committed = rlp.at(2).map_err(rlp_error)?;
        if !committed.is_list() {
            return Err(Error::InvalidExtra("committed seals not a list"));
        }
        let committed_seals = committed
            .iter()
            .map(|item| item.data().map(<[u8]>::to_vec).map_err(rlp_error))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            vanity,
            fullnodes,
            seal,
            committed_seals,
        })
    }

    /// The extra data a proposer signs: seal and committed seals cleared.
    pub fn filtered(&self) -> Self {
        Self {
            vanity: self.vanity,
            fullnodes: self.fullnodes.clone(),
            seal: Vec::new(),
            committed_seals: Vec::new(),
        }
    }
}

/// Encode `fullnodes` into genesis extra data (zeroed seal, no committed seals).
pub fn extra_data(fullnodes: &[Address]) -> Bytes {
    Extra {
        fullnodes: fullnodes.to_vec(),
        seal: vec![0u8; EXTRA_SEAL],
        ..Extra::default()
    }
    .encode()
}

/// Decode the validator set from genesis (or header) extra data.
pub fn decode_extra(extra: &[u8]) -> Result<Vec<Address>, Error> {
    Ok(Extra::decode(extra)?.fullnodes)
}

/// Render the genesis document.
pub fn document(cfg: &Config, fullnodes: &[Address], funded: &[Address]) -> Value {
    let mut chain = json!({
        "chainId": cfg.chain_id,
        "homesteadBlock": cfg.homestead_block,
        "eip150Block": cfg.eip150_block,
        "eip155Block": cfg.eip155_block,
        "eip158Block": cfg.eip158_block,
        "sport": {
            "policy": cfg.speaker_policy,
            "epoch": cfg.epoch,
        },
    });
    if cfg.extended {
        chain["isSmilo"] = Value::Bool(true);
        chain["isGas"] = Value::Bool(true);
        chain["isGasRefunded"] = Value::Bool(true);
    }

    let mut alloc = Map::new();
    for account in funded {
        alloc.insert(
            hex(account.as_slice()),
            json!({ "balance": format!("{:#x}", cfg.balance) }),
        );
    }

    json!({
        "config": chain,
        "nonce": "0x0",
        "timestamp": format!("{:#x}", cfg.timestamp),
        "extraData": format!("0x{}", hex(&extra_data(fullnodes))),
        "gasLimit": format!("{:#x}", cfg.gas_limit),
        "difficulty": format!("{:#x}", cfg.difficulty),
        "mixHash": cfg.mix_hash,
        "coinbase": Address::ZERO,
        "alloc": alloc,
        "number": "0x0",
        "gasUsed": "0x0",
        "parentHash": B256::ZERO,
    })
}

/// Write a genesis file into `dir`, returning its path.
pub fn create(
    dir: &Path,
    cfg: &Config,
    fullnodes: &[Address],
    funded: &[Address],
) -> Result<PathBuf, Error> {
    fs::create_dir_all(dir)?;
    let path = dir.join(FILE_NAME);
    let raw = serde_json::to_vec_pretty(&document(cfg, fullnodes, funded))?;
    fs::write(&path, raw)?;
    Ok(path)
}

/// Read the initial validator set back from a genesis file.
pub fn fullnodes(path: &Path) -> Result<Vec<Address>, Error> {
    let document: Value = serde_json::from_slice(&fs::read(path)?)?;
    let extra = document
        .get("extraData")
        .and_then(Value::as_str)
        .ok_or(Error::InvalidExtra("missing extraData"))?;
    let extra = from_hex_formatted(extra).ok_or(Error::InvalidExtra("invalid hex"))?;
    decode_extra(&extra)
}

/// Read the funded accounts (and their balances) back from a genesis file.
pub fn allocations(path: &Path) -> Result<Vec<(Address, U256)>, Error> {
    let document: Value = serde_json::from_slice(&fs::read(path)?)?;
    let Some(alloc) = document.get("alloc").and_then(Value::as_object) else {
        return Ok(Vec::new());
    };
    alloc
        .iter()
        .map(|(account, entry)| {
            let account = account
                .parse::<Address>()
                .map_err(|_| Error::InvalidAlloc("invalid account"))?;
            let balance = entry
                .get("balance")
                .and_then(Value::as_str)
                .ok_or(Error::InvalidAlloc("missing balance"))?
                .parse::<U256>()
                .map_err(|_| Error::InvalidAlloc("invalid balance"))?;
            Ok((account, balance))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use rand::{rngs::StdRng, SeedableRng};

    fn addresses(n: usize) -> Vec<Address> {
        let mut rng = StdRng::seed_from_u64(7);
        (0..n)
            .map(|_| Identity::generate(&mut rng).address())
            .collect()
    }

    #[test]
    fn test_extra_layout() {
        let fullnodes = addresses(4);
        let extra = extra_data(&fullnodes);
        assert!(extra[..EXTRA_VANITY].iter().all(|b| *b == 0));

        // long list header, 4 x (0x94 || 20 bytes), long seal header + 65 bytes, empty list
        let payload = 2 + 4 * 21 + 2 + EXTRA_SEAL + 1;
        assert_eq!(extra.len(), EXTRA_VANITY + 2 + payload);
        assert_eq!(decode_extra(&extra).unwrap(), fullnodes);
    }

    #[test]
    fn test_extra_fields() {
        let extra = Extra {
            vanity: [7u8; EXTRA_VANITY],
            fullnodes: addresses(2),
            seal: vec![1u8; EXTRA_SEAL],
            committed_seals: vec![vec![2u8; EXTRA_SEAL], vec![3u8; EXTRA_SEAL]],
        };
        let decoded = Extra::decode(&extra.encode()).unwrap();
        assert_eq!(decoded, extra);

        let filtered = Extra::decode(&decoded.filtered().encode()).unwrap();
        assert_eq!(filtered.fullnodes, extra.fullnodes);
        assert!(filtered.seal.is_empty());
        assert!(filtered.committed_seals.is_empty());
    }

    #[test]
    fn test_empty_set() {
        let extra = extra_data(&[]);
        assert!(decode_extra(&extra).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_extra() {
        assert!(matches!(
            decode_extra(&[0u8; 8]),
            Err(Error::InvalidExtra("missing vanity"))
        ));
        let mut extra = vec![0u8; EXTRA_VANITY];
        extra.extend_from_slice(&[0xc2, 0x01, 0x02]);
        assert!(decode_extra(&extra).is_err());
    }

    #[test]
    fn test_file() {
        let dir = tempfile::tempdir().unwrap();
        let fullnodes = addresses(3);
        let funded = addresses(6);
        let cfg = Config {
            timestamp: 1_600_000_000,
            ..Config::default()
        };
        let path = create(dir.path(), &cfg, &fullnodes, &funded).unwrap();
        assert_eq!(path.file_name().unwrap(), FILE_NAME);
        assert_eq!(super::fullnodes(&path).unwrap(), fullnodes);

        let document: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(document["config"]["chainId"], 2017);
        assert_eq!(document["config"]["isSmilo"], true);
        assert_eq!(document["gasLimit"], "0x47b760");
        assert_eq!(document["alloc"].as_object().unwrap().len(), 6);
        let allocations = allocations(&path).unwrap();
        assert_eq!(allocations.len(), 6);
        assert!(allocations
            .iter()
            .all(|(account, balance)| funded.contains(account) && *balance == cfg.balance));
        assert_eq!(
            document["mixHash"],
            "0x63746963616c2062797a616e74696e65206661756c7420746f6c6572616e6365"
        );
    }
}
