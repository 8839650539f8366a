//! P2WPKH addresses in base58-check form
//!
//! Payload: `version | witness version (0) | reserved (0) | HASH160(pubkey)`,
//! followed by the first four bytes of its sha256d as a checksum.

use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::constants::PUBKEY_HASH_SIZE;
use crate::error::{LedgerError, Result};
use crate::hashes::{hash160, sha256d};
use crate::script::Script;

const CHECKSUM_SIZE: usize = 4;

/// Payload length before the checksum
pub const ADDRESS_SIZE: usize = 3 + PUBKEY_HASH_SIZE;

/// Network an address belongs to; these tags are specific to this ledger
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum AddressVersion {
    Mainnet = 0x01,
    Goodnet = 0x02,
    Testnet = 0x03,
}

impl AddressVersion {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(AddressVersion::Mainnet),
            0x02 => Some(AddressVersion::Goodnet),
            0x03 => Some(AddressVersion::Testnet),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    pub version: AddressVersion,
    pub public_key_hash: [u8; PUBKEY_HASH_SIZE],
}

impl Address {
    pub fn new(version: AddressVersion, public_key_hash: [u8; PUBKEY_HASH_SIZE]) -> Self {
        Address {
            version,
            public_key_hash,
        }
    }

    pub fn from_public_key(version: AddressVersion, key: &PublicKey) -> Self {
        Address::new(version, hash160(&key.serialize()))
    }

    pub fn to_bytes(&self) -> [u8; ADDRESS_SIZE] {
        let mut data = [0u8; ADDRESS_SIZE];
        data[0] = self.version as u8;
        data[3..].copy_from_slice(&self.public_key_hash);
        data
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != ADDRESS_SIZE {
            return Err(LedgerError::Address(format!(
                "expected {} bytes, got {}",
                ADDRESS_SIZE,
                data.len()
            )));
        }
        let version = AddressVersion::from_u8(data[0])
            .ok_or_else(|| LedgerError::Address(format!("unknown version {:#04x}", data[0])))?;
        if data[1] != 0 {
            return Err(LedgerError::Address(format!(
                "unexpected witness program version {}",
                data[1]
            )));
        }
        if data[2] != 0 {
            return Err(LedgerError::Address("reserved byte is set".to_string()));
        }
        let mut public_key_hash = [0u8; PUBKEY_HASH_SIZE];
        public_key_hash.copy_from_slice(&data[3..]);
        Ok(Address::new(version, public_key_hash))
    }

    pub fn base58check(&self) -> String {
        let mut data = self.to_bytes().to_vec();
        let checksum = sha256d(&data);
        data.extend_from_slice(&checksum[..CHECKSUM_SIZE]);
        bs58::encode(data).into_string()
    }

    /// Locking script paying to this address
    pub fn script_pubkey(&self) -> Vec<u8> {
        Script::p2wpkh_output(&self.public_key_hash).marshal()
    }
}

/// Decode base58 and strip a verified 4-byte checksum.
pub fn base58check_decode(s: &str) -> Result<Vec<u8>> {
    let mut data = bs58::decode(s)
        .into_vec()
        .map_err(|e| LedgerError::Address(e.to_string()))?;
    if data.len() <= CHECKSUM_SIZE {
        return Err(LedgerError::Address(
            "check-encoded address malformed or too short".to_string(),
        ));
    }
    let actual = data.split_off(data.len() - CHECKSUM_SIZE);
    let expected = sha256d(&data);
    if actual[..] != expected[..CHECKSUM_SIZE] {
        return Err(LedgerError::Address(format!(
            "checksum failed (got {}, expected {})",
            hex::encode(&actual),
            hex::encode(&expected[..CHECKSUM_SIZE])
        )));
    }
    Ok(data)
}

pub fn parse_address(s: &str) -> Result<Address> {
    Address::from_bytes(&base58check_decode(s)?)
}

impl FromStr for Address {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        parse_address(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base58check())
    }
}

impl Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.base58check())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_address(&s).map_err(serde::de::Error::custom)
    }
}
