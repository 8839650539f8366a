//! Ledger constants shared by the codec, script engine and block assembly

/// Size of a transaction identifier in bytes
pub const TRANSACTION_ID_SIZE: usize = 32;

/// Size of a block identifier in bytes
pub const BLOCK_ID_SIZE: usize = 32;

/// The only transaction version accepted on the wire
pub const TX_VERSION: u8 = 1;

/// Maximum number of inputs a transaction may declare
pub const MAX_INPUTS: usize = 512;

/// Maximum number of outputs a transaction may declare
pub const MAX_OUTPUTS: usize = 512;

/// Maximum number of items in a single witness stack
pub const MAX_WITNESS_ITEMS: usize = 512;

/// Maximum length of any variable-length field (script, witness item)
pub const MAX_FIELDLEN: usize = 520;

/// Outputs addressable by an outpoint; the index is a single byte
pub const MAX_ADDRESSABLE_OUTPUTS: usize = u8::MAX as usize + 1;

/// Maximum serialized size of all transactions in one block: 1 MiB
pub const BLOCK_SIZE_LIMIT: usize = 1 << 20;

/// Length of the compact secp256k1 signature carried in a block header
pub const BLOCK_SIGNATURE_SIZE: usize = 64;

/// Length of a public-key hash (HASH160)
pub const PUBKEY_HASH_SIZE: usize = 20;

/// Maximum stack depth during script execution
pub const MAX_STACK_SIZE: usize = 1000;

/// Sighash type tag appended to every signing preimage
pub const SIGHASH_ALL: u32 = 0x1;

/// Sequence number for a final input
pub const SEQUENCE_FINAL: u32 = 0xffffffff;

/// Coins minted by the genesis transaction unless configured otherwise
pub const DEFAULT_GENESIS_COINS: u32 = 420_000_000;
