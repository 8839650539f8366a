//! Daemon configuration, read from flags or the environment

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use secp256k1::SecretKey;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::address::AddressVersion;
use crate::constants::DEFAULT_GENESIS_COINS;
use crate::mining::BlockSchedule;

#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[clap(
    author,
    version,
    about = "CDN payment ledger",
    long_about = r#"Single-miner UTXO ledger settling CDN payments"#
)]
pub struct MinerConfig {
    #[clap(
        long,
        env = "MINER_KEY",
        help = "Hex-encoded secp256k1 secret key that signs blocks (random when unset)"
    )]
    pub miner_key: Option<String>,

    #[clap(
        long,
        env = "BLOCK_INTERVAL_SECS",
        help = "Seconds between mining cycles; 0 mines as soon as a transaction arrives",
        default_value = "0"
    )]
    pub block_interval_secs: u64,

    #[clap(
        long,
        env = "GENESIS_COINS",
        help = "Coins minted to the miner key in the genesis block",
        default_value = "420000000"
    )]
    pub genesis_coins: u32,

    #[clap(
        long,
        env = "ADDRESS_VERSION",
        help = "Network used when printing addresses",
        value_enum,
        default_value = "testnet"
    )]
    pub address_version: AddressVersion,
}

impl Default for MinerConfig {
    fn default() -> Self {
        MinerConfig {
            miner_key: None,
            block_interval_secs: 0,
            genesis_coins: DEFAULT_GENESIS_COINS,
            address_version: AddressVersion::Testnet,
        }
    }
}

impl MinerConfig {
    pub fn load() -> Result<Self> {
        Ok(MinerConfig::try_parse()?)
    }

    pub fn schedule(&self) -> BlockSchedule {
        match self.block_interval_secs {
            0 => BlockSchedule::Immediate,
            secs => BlockSchedule::Interval(Duration::from_secs(secs)),
        }
    }

    pub fn signing_key(&self) -> Result<SecretKey> {
        match &self.miner_key {
            Some(key) => {
                let bytes = hex::decode(key.trim()).context("miner key is not hex")?;
                SecretKey::from_slice(&bytes).context("miner key is not a valid secret key")
            }
            None => {
                warn!("No miner key configured, generating an ephemeral one");
                Ok(SecretKey::new(&mut secp256k1::rand::thread_rng()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MinerConfig::try_parse_from(["ledgerd"]).unwrap();
        assert_eq!(config.block_interval_secs, 0);
        assert_eq!(config.genesis_coins, DEFAULT_GENESIS_COINS);
        assert_eq!(config.address_version, AddressVersion::Testnet);
        assert_eq!(config.schedule(), BlockSchedule::Immediate);
    }

    #[test]
    fn test_flags() {
        let config = MinerConfig::try_parse_from([
            "ledgerd",
            "--block-interval-secs",
            "30",
            "--address-version",
            "mainnet",
            "--miner-key",
            "11".repeat(32).as_str(),
        ])
        .unwrap();
        assert_eq!(
            config.schedule(),
            BlockSchedule::Interval(Duration::from_secs(30))
        );
        assert_eq!(config.address_version, AddressVersion::Mainnet);
        assert_eq!(
            config.signing_key().unwrap(),
            SecretKey::from_slice(&[0x11; 32]).unwrap()
        );
    }

    #[test]
    fn test_bad_miner_key() {
        let mut config = MinerConfig::default();
        config.miner_key = Some("zz".to_string());
        assert!(config.signing_key().is_err());
        config.miner_key = Some("00".repeat(32));
        assert!(config.signing_key().is_err());
        config.miner_key = None;
        assert!(config.signing_key().is_ok());
    }
}
