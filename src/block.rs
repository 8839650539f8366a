//! Block wire format, identifiers, Merkle roots and header signatures
//!
//! Layout: `version:u32 | previous_block[32] | merkle_root[32] | timestamp:u32 |
//! signature[64] | random:u64 | uvarint tx count | (tx_len:u32 | tx)*`. The
//! block ID hashes the header with the signature left out, and the signature is
//! a compact secp256k1 ECDSA signature over that ID.

use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, SecretKey};

use crate::codec::{uvarint_size, Codec, Reader, Writer};
use crate::constants::{BLOCK_SIGNATURE_SIZE, BLOCK_SIZE_LIMIT};
use crate::error::{LedgerError, Result};
use crate::hashes::{sha256d_concat, Hash};
use crate::types::*;

/// Current block header version
pub const BLOCK_VERSION: u32 = 1;

/// Serialized header length
pub const BLOCK_HEADER_SIZE: usize = 4 + 32 + 32 + 4 + BLOCK_SIGNATURE_SIZE + 8;

/// Upper bound on the transaction count a decoder will accept; every
/// transaction takes at least eight bytes on the wire.
const MAX_BLOCK_TRANSACTIONS: usize = BLOCK_SIZE_LIMIT / 8;

impl Codec for BlockHeader {
    fn size(&self) -> usize {
        BLOCK_HEADER_SIZE
    }

    fn encode(&self, w: &mut Writer<'_>) -> Result<()> {
        w.put_u32_le(self.version)?;
        w.put_bytes(&self.previous_block.0)?;
        w.put_bytes(&self.merkle_root)?;
        w.put_u32_le(self.timestamp)?;
        w.put_bytes(&self.signature.0)?;
        w.put_u64_le(self.random)
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(BlockHeader {
            version: r.get_u32_le("block version")?,
            previous_block: BlockId(r.get_array("previous block")?),
            merkle_root: r.get_array("merkle root")?,
            timestamp: r.get_u32_le("timestamp")?,
            signature: BlockSignature(r.get_array("block signature")?),
            random: r.get_u64_le("random")?,
        })
    }
}

impl BlockHeader {
    /// sha256d over every header field except the signature
    pub fn block_id(&self) -> BlockId {
        BlockId(sha256d_concat(&[
            &self.version.to_le_bytes(),
            &self.previous_block.0,
            &self.merkle_root,
            &self.timestamp.to_le_bytes(),
            &self.random.to_le_bytes(),
        ]))
    }
}

impl Codec for Block {
    fn size(&self) -> usize {
        BLOCK_HEADER_SIZE
            + uvarint_size(self.transactions.len() as u64)
            + self
                .transactions
                .iter()
                .map(|tx| 4 + tx.size())
                .sum::<usize>()
    }

    /// Header, then `uvarint tx count | (tx_len:u32 LE | tx)*`. The header is
    /// `version:u32 | previous_block[32] | merkle_root[32] | timestamp:u32 |
    /// signature[64] | random:u64`, all little endian.
    ///
    /// The explicit count, the per-transaction length prefix and the `random`
    /// field are part of this format; a block encoded without them is not
    /// byte compatible and does not hash to the same ID.
    fn encode(&self, w: &mut Writer<'_>) -> Result<()> {
        if self.transactions.is_empty() {
            return Err(LedgerError::Encode(
                "block without transactions".to_string(),
            ));
        }
        self.header.encode(w)?;
        w.put_count(self.transactions.len(), MAX_BLOCK_TRANSACTIONS, "block transactions")?;
        for tx in &self.transactions {
            let len = u32::try_from(tx.size()).map_err(|_| {
                LedgerError::Encode(format!("transaction of {} bytes", tx.size()))
            })?;
            w.put_u32_le(len)?;
            tx.encode(w)?;
        }
        Ok(())
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let header = BlockHeader::decode(r)?;
        let count = r.get_count(MAX_BLOCK_TRANSACTIONS, "block transactions")?;
        if count == 0 {
            return Err(LedgerError::Decode(
                "block without transactions".to_string(),
            ));
        }
        let mut transactions = Vec::with_capacity(count.min(r.remaining() / 8));
        for i in 0..count {
            let len = r.get_u32_le("transaction length")? as usize;
            let tx = Transaction::unmarshal(r.take(len, "transaction")?)
                .map_err(|e| LedgerError::Decode(format!("transaction {}: {}", i, e)))?;
            transactions.push(tx);
        }
        Ok(Block {
            header,
            transactions,
        })
    }
}

/// Root of the pairwise sha256d tree over `txids`, duplicating the last node of
/// odd levels. An empty list has no root.
pub fn compute_merkle_root(txids: &[TxId]) -> Result<Hash> {
    if txids.is_empty() {
        return Err(LedgerError::BlockValidation(
            "Cannot calculate merkle root for empty transaction list".to_string(),
        ));
    }

    let mut hashes: Vec<Hash> = txids.iter().map(|id| id.0).collect();
    while hashes.len() > 1 {
        hashes = hashes
            .chunks(2)
            .map(|pair| {
                let right = pair.get(1).unwrap_or(&pair[0]);
                sha256d_concat(&[&pair[0], right])
            })
            .collect();
    }
    Ok(hashes[0])
}

impl Block {
    /// Unsigned block over `transactions` with the Merkle root filled in.
    pub fn new(
        previous_block: BlockId,
        transactions: Vec<Transaction>,
        timestamp: u32,
        random: u64,
    ) -> Result<Block> {
        let mut block = Block {
            header: BlockHeader {
                version: BLOCK_VERSION,
                previous_block,
                merkle_root: [0u8; 32],
                timestamp,
                signature: BlockSignature::zero(),
                random,
            },
            transactions,
        };
        block.header.merkle_root = block.merkle_root()?;
        Ok(block)
    }

    pub fn block_id(&self) -> BlockId {
        self.header.block_id()
    }

    pub fn txids(&self) -> Result<Vec<TxId>> {
        self.transactions.iter().map(Transaction::txid).collect()
    }

    pub fn merkle_root(&self) -> Result<Hash> {
        compute_merkle_root(&self.txids()?)
    }

    pub fn is_genesis(&self) -> bool {
        self.header.previous_block.is_zero()
    }

    /// Serialized size of the transactions alone
    pub fn transactions_size(&self) -> usize {
        self.transactions.iter().map(Codec::size).sum()
    }

    pub fn sign(&mut self, key: &SecretKey) -> Result<()> {
        let secp = Secp256k1::signing_only();
        let message = Message::from_digest_slice(&self.block_id().0)
            .map_err(|e| LedgerError::InvalidSignature(e.to_string()))?;
        self.header.signature = BlockSignature(secp.sign_ecdsa(&message, key).serialize_compact());
        Ok(())
    }

    pub fn verify_signature(&self, key: &PublicKey) -> Result<()> {
        let secp = Secp256k1::verification_only();
        let message = Message::from_digest_slice(&self.block_id().0)
            .map_err(|e| LedgerError::InvalidSignature(e.to_string()))?;
        let signature = Signature::from_compact(&self.header.signature.0)
            .map_err(|e| LedgerError::InvalidSignature(e.to_string()))?;
        secp.verify_ecdsa(&message, &signature, key)
            .map_err(|e| LedgerError::InvalidSignature(format!("block {}: {}", self.block_id(), e)))
    }

    /// Header commits to exactly these transactions.
    pub fn check_merkle_root(&self) -> Result<()> {
        let computed = self.merkle_root()?;
        if computed != self.header.merkle_root {
            return Err(LedgerError::BlockValidation(format!(
                "merkle root mismatch: header {}, computed {}",
                hex::encode(self.header.merkle_root),
                hex::encode(computed)
            )));
        }
        Ok(())
    }
}
