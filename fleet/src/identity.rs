//! secp256k1 node identities.
//!
//! A node is identified on the P2P layer by its uncompressed public key (hex, without the `0x04`
//! prefix) and on chain by the address derived from that key.

use alloy_primitives::{keccak256, Address};
use commonware_utils::{from_hex_formatted, hex};
use k256::{
    ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey},
    elliptic_curve::sec1::ToEncodedPoint,
    SecretKey,
};
use rand::{CryptoRng, RngCore};
use std::{
    fmt,
    fs,
    net::Ipv4Addr,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Location of the node key inside a node's data directory.
pub const NODEKEY_PATH: &str = "geth/nodekey";

/// Length of a recoverable signature (`r || s || v`).
pub const SIGNATURE_LENGTH: usize = 65;

/// Errors that can occur when loading an identity.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid hex")]
    InvalidHex,
    #[error("invalid secret key")]
    InvalidKey,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// A secp256k1 keypair with its derived address and P2P id.
#[derive(Clone)]
pub struct Identity {
    secret: SecretKey,
    address: Address,
    id: String,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address)
            .field("id", &self.id)
            .finish()
    }
}

impl Identity {
    /// Generate a fresh identity.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self::from_secret(SecretKey::random(rng))
    }

    /// Load an identity from a (optionally `0x`-prefixed) hex secret.
    pub fn from_hex(secret: &str) -> Result<Self, Error> {
        let bytes = from_hex_formatted(secret).ok_or(Error::InvalidHex)?;
        let secret = SecretKey::from_slice(&bytes).map_err(|_| Error::InvalidKey)?;
        Ok(Self::from_secret(secret))
    }

    fn from_secret(secret: SecretKey) -> Self {
        // Uncompressed SEC1: 0x04 || x || y
        let encoded = secret.public_key().to_encoded_point(false);
        let public = &encoded.as_bytes()[1..];
        Self {
            address: Address::from_raw_public_key(public),
            id: hex(public),
            secret,
        }
    }

    /// Sign the keccak256 digest of `data`, returning `r || s || v` with `v` in `{0, 1}`.
    pub fn sign(&self, data: &[u8]) -> Result<[u8; SIGNATURE_LENGTH], Error> {
        let digest = keccak256(data);
        let key = SigningKey::from(&self.secret);
        let (signature, recovery) = key
            .sign_prehash_recoverable(digest.as_slice())
            .map_err(|_| Error::InvalidSignature)?;
        let mut out = [0u8; SIGNATURE_LENGTH];
        out[..SIGNATURE_LENGTH - 1].copy_from_slice(&signature.to_bytes());
        out[SIGNATURE_LENGTH - 1] = recovery.to_byte();
        Ok(out)
    }

    /// Account address derived from the public key.
    pub fn address(&self) -> Address {
        self.address
    }

    /// P2P id (uncompressed public key without prefix, hex).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Secret key as hex (the format expected in a `nodekey` file).
    pub fn secret_hex(&self) -> String {
        hex(&self.secret.to_bytes())
    }

    /// Enode URL advertised at `ip:port`.
    pub fn enode(&self, ip: Ipv4Addr, port: u16) -> String {
        format!("enode://{}@{}:{}?discport=0", self.id, ip, port)
    }

    /// Write the node key below `datadir`, returning its path.
    pub fn save_nodekey(&self, datadir: &Path) -> Result<PathBuf, Error> {
        let path = datadir.join(NODEKEY_PATH);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, self.secret_hex())?;
        Ok(path)
    }
}

/// Recover the address that signed the keccak256 digest of `data`.
///
/// Accepts `v` as `{0, 1}` or `{27, 28}`.
pub fn recover(data: &[u8], signature: &[u8]) -> Result<Address, Error> {
    if signature.len() != SIGNATURE_LENGTH {
        return Err(Error::InvalidSignature);
    }
    let (rs, v) = signature.split_at(SIGNATURE_LENGTH - 1);
    let v = if v[0] >= 27 { v[0] - 27 } else { v[0] };
    let recovery = RecoveryId::from_byte(v).ok_or(Error::InvalidSignature)?;
    let parsed = Signature::from_slice(rs).map_err(|_| Error::InvalidSignature)?;
    let digest = keccak256(data);
    let key = VerifyingKey::recover_from_prehash(digest.as_slice(), &parsed, recovery)
        .map_err(|_| Error::InvalidSignature)?;
    let encoded = key.to_encoded_point(false);
    Ok(Address::from_raw_public_key(&encoded.as_bytes()[1..]))
}
