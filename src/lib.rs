//! # CDN Ledger
//!
//! UTXO ledger core for settling payments between CDN clients and edge
//! servers.
//!
//! A single trusted miner holds the mempool, validates transfers against the
//! confirmed UTXO set and seals them into signed blocks. Transfers lock coins
//! to a public-key hash (pay-to-witness-public-key-hash) and are unlocked by a
//! secp256k1 signature and public key carried in the witness.
//!
//! ## Layout
//!
//! - Wire format: [`codec`], [`transaction`], [`block`], [`address`]
//! - Scripts: [`script`], [`interpreter`], [`segwit`]
//! - Ledger state: [`utxo`], [`storage`], [`memory`], [`chain`]
//! - Block production: [`mining`]
//! - Daemon plumbing: [`config`], [`logging`], [`stopper`]
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use cdn_ledger::memory::MemoryLedger;
//! use cdn_ledger::mining::{BlockSchedule, LedgerMiner};
//! use cdn_ledger::storage::LedgerStorage;
//! use secp256k1::{PublicKey, Secp256k1, SecretKey};
//!
//! let miner_key = SecretKey::from_slice(&[7u8; 32]).unwrap();
//! let owner = PublicKey::from_secret_key(&Secp256k1::new(), &SecretKey::from_slice(&[1u8; 32]).unwrap());
//!
//! let miner = LedgerMiner::new(Arc::new(MemoryLedger::new()), miner_key, BlockSchedule::Immediate);
//! let genesis = miner.init_genesis_block(1_000, &owner).unwrap();
//! assert!(genesis.is_genesis());
//!
//! // nothing queued, nothing mined
//! assert!(miner.generate_block().unwrap().is_none());
//! assert_eq!(miner.storage().highest_block().unwrap().unwrap().height, 0);
//! ```

pub mod address;
pub mod block;
pub mod chain;
pub mod codec;
pub mod config;
pub mod constants;
pub mod error;
pub mod hashes;
pub mod interpreter;
pub mod logging;
pub mod memory;
pub mod mining;
pub mod script;
pub mod segwit;
pub mod stopper;
pub mod storage;
pub mod transaction;
pub mod types;
pub mod utxo;

// Re-export commonly used types
pub use address::{Address, AddressVersion};
pub use codec::Codec;
pub use constants::*;
pub use error::{LedgerError, Result};
pub use mining::{BlockSchedule, LedgerMiner, MinerHandle};
pub use storage::{BlockCommit, BlockRecord, ChainStorage, LedgerStorage};
pub use types::*;
pub use utxo::SpendingState;
