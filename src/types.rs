//! Core ledger types: identifiers, transactions and blocks

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::constants::{BLOCK_ID_SIZE, BLOCK_SIGNATURE_SIZE, TRANSACTION_ID_SIZE};
use crate::error::LedgerError;

pub use crate::hashes::Hash;

macro_rules! hex_id {
    ($(#[$meta:meta])* $name:ident, $size:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; $size]);

        impl $name {
            /// The all-zero sentinel
            pub const fn zero() -> Self {
                Self([0u8; $size])
            }

            pub fn is_zero(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }

            pub fn as_bytes(&self) -> &[u8; $size] {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::zero()
            }
        }

        impl From<[u8; $size]> for $name {
            fn from(bytes: [u8; $size]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = LedgerError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = hex::decode(s)
                    .map_err(|e| LedgerError::Decode(format!("{}: {}", stringify!($name), e)))?;
                let bytes: [u8; $size] = bytes.try_into().map_err(|b: Vec<u8>| {
                    LedgerError::Decode(format!(
                        "{}: expected {} bytes, got {}",
                        stringify!($name),
                        $size,
                        b.len()
                    ))
                })?;
                Ok(Self(bytes))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_id!(
    /// Transaction identifier: sha256d of the canonical transaction bytes
    TxId,
    TRANSACTION_ID_SIZE
);

hex_id!(
    /// Block identifier: sha256d of the header without its signature
    BlockId,
    BLOCK_ID_SIZE
);

hex_id!(
    /// Compact secp256k1 signature over a block ID
    BlockSignature,
    BLOCK_SIGNATURE_SIZE
);

/// Serde adapter writing byte strings as lowercase hex
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// Length of an outpoint's map key: txid followed by the output index
pub const OUTPOINT_KEY_SIZE: usize = TRANSACTION_ID_SIZE + 1;

/// One output of one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Outpoint {
    pub previous_tx: TxId,
    pub index: u8,
}

impl Outpoint {
    pub fn new(previous_tx: TxId, index: u8) -> Self {
        Self { previous_tx, index }
    }

    pub fn key(&self) -> OutpointKey {
        let mut key = [0u8; OUTPOINT_KEY_SIZE];
        key[..TRANSACTION_ID_SIZE].copy_from_slice(&self.previous_tx.0);
        key[TRANSACTION_ID_SIZE] = self.index;
        OutpointKey(key)
    }
}

impl fmt::Display for Outpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.previous_tx, self.index)
    }
}

/// Canonical 33-byte form of an [`Outpoint`], used as a map key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutpointKey(pub [u8; OUTPOINT_KEY_SIZE]);

impl OutpointKey {
    pub fn outpoint(&self) -> Outpoint {
        let mut txid = [0u8; TRANSACTION_ID_SIZE];
        txid.copy_from_slice(&self.0[..TRANSACTION_ID_SIZE]);
        Outpoint::new(TxId(txid), self.0[TRANSACTION_ID_SIZE])
    }
}

impl From<Outpoint> for OutpointKey {
    fn from(outpoint: Outpoint) -> Self {
        outpoint.key()
    }
}

impl fmt::Debug for OutpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OutpointKey({})", self.outpoint())
    }
}

/// Spendable value locked by a script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutput {
    pub value: u32,
    #[serde(with = "hex_bytes")]
    pub script_pubkey: Vec<u8>,
}

/// Consumes exactly one prior output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInput {
    pub outpoint: Outpoint,
    #[serde(with = "hex_bytes")]
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

/// Witness stack authorizing the input at the same position
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionWitness {
    pub data: Vec<Vec<u8>>,
}

impl TransactionWitness {
    pub fn new(data: Vec<Vec<u8>>) -> Self {
        Self { data }
    }
}

/// Wire tag of a transaction body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TxType {
    Transfer = 0x01,
    Genesis = 0x02,
    EscrowOpen = 0x03,
}

impl TxType {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(TxType::Transfer),
            0x02 => Some(TxType::Genesis),
            0x03 => Some(TxType::EscrowOpen),
            _ => None,
        }
    }
}

/// Mints value from nothing; only valid as the sole transaction of the first block
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisTransaction {
    pub outputs: Vec<TransactionOutput>,
}

/// Standard spend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTransaction {
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub witnesses: Vec<TransactionWitness>,
    pub lock_time: u32,
}

/// Reserved for the escrow lifecycle; carries no payload yet
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowOpenTransaction {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransactionBody {
    Transfer(TransferTransaction),
    Genesis(GenesisTransaction),
    EscrowOpen(EscrowOpenTransaction),
}

impl TransactionBody {
    pub fn tx_type(&self) -> TxType {
        match self {
            TransactionBody::Transfer(_) => TxType::Transfer,
            TransactionBody::Genesis(_) => TxType::Genesis,
            TransactionBody::EscrowOpen(_) => TxType::EscrowOpen,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u8,
    pub flags: u16,
    pub body: TransactionBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u32,
    pub previous_block: BlockId,
    #[serde(with = "hex_array")]
    pub merkle_root: Hash,
    pub timestamp: u32,
    pub signature: BlockSignature,
    pub random: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

/// Outcome of a rule check that is not an I/O or decode failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Valid,
    Invalid(String),
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid)
    }

    /// Turn a rejection into a transaction validation error.
    pub fn into_result(self) -> crate::error::Result<()> {
        match self {
            ValidationResult::Valid => Ok(()),
            ValidationResult::Invalid(reason) => Err(LedgerError::TransactionValidation(reason)),
        }
    }
}

mod hex_array {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::Hash;

    pub fn serialize<S: Serializer>(bytes: &Hash, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Hash, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_id() {
        let id = TxId::zero();
        assert!(id.is_zero());
        assert_eq!(id.to_string(), "0".repeat(64));

        let mut bytes = [0u8; 32];
        bytes[0] = 1;
        let id = TxId(bytes);
        assert!(!id.is_zero());
        assert_eq!(id.to_string(), format!("01{}", "0".repeat(62)));
    }

    #[test]
    fn test_id_parse() {
        let id = BlockId([0xab; 32]);
        let parsed: BlockId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);

        assert!("abcd".parse::<BlockId>().is_err());
        assert!("zz".repeat(32).parse::<BlockId>().is_err());
    }

    #[test]
    fn test_outpoint_key() {
        let outpoint = Outpoint::new(TxId([7; 32]), 3);
        let key = outpoint.key();
        assert_eq!(&key.0[..32], &[7u8; 32]);
        assert_eq!(key.0[32], 3);
        assert_eq!(key.outpoint(), outpoint);
        assert_ne!(Outpoint::new(TxId([7; 32]), 4).key(), key);
    }

    #[test]
    fn test_tx_type_tags() {
        assert_eq!(TxType::from_u8(1), Some(TxType::Transfer));
        assert_eq!(TxType::from_u8(2), Some(TxType::Genesis));
        assert_eq!(TxType::from_u8(3), Some(TxType::EscrowOpen));
        assert_eq!(TxType::from_u8(0), None);
        assert_eq!(TxType::from_u8(4), None);
    }

    #[test]
    fn test_json_uses_hex() {
        let output = TransactionOutput {
            value: 5,
            script_pubkey: vec![0x00, 0x14],
        };
        let json = serde_json::to_string(&output).unwrap();
        assert_eq!(json, r#"{"value":5,"script_pubkey":"0014"}"#);

        let tx = Transaction {
            version: 1,
            flags: 0,
            body: TransactionBody::EscrowOpen(EscrowOpenTransaction {}),
        };
        let json = serde_json::to_string(&tx).unwrap();
        let back: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tx);
    }
}
