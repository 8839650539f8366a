//! Storage interfaces consumed by the miner and the chain database
//!
//! Backends live outside the core; [`crate::memory`] provides in-memory ones.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::*;

/// A block as stored, with its position in the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub block_id: BlockId,
    pub height: u64,
    /// Zero for the genesis block
    pub parent: BlockId,
    pub block: Block,
}

impl BlockRecord {
    pub fn new(height: u64, block: Block) -> Self {
        BlockRecord {
            block_id: block.block_id(),
            height,
            parent: block.header.previous_block,
            block,
        }
    }
}

/// Everything a mined block changes, applied by [`LedgerStorage::commit_block`]
/// as a single unit
#[derive(Debug, Clone)]
pub struct BlockCommit {
    pub record: BlockRecord,
    /// Confirmed outputs consumed by the block
    pub spent: Vec<OutpointKey>,
    /// Outputs created by the block and still unspent at its end
    pub created: Vec<(OutpointKey, TransactionOutput)>,
    /// Transactions to drop from the mempool
    pub mined: Vec<TxId>,
}

/// Mempool, confirmed UTXO set and block list used by the miner.
pub trait LedgerStorage: Send + Sync {
    /// Pending transactions in arrival order
    fn mempool_txs(&self) -> Result<Vec<Transaction>>;

    fn queue_tx(&self, tx: Transaction) -> Result<TxId>;

    fn delete_mempool_tx(&self, txid: &TxId) -> Result<()>;

    /// Confirmed unspent output, if any
    fn utxo(&self, key: &OutpointKey) -> Result<Option<TransactionOutput>>;

    fn insert_utxo(&self, key: OutpointKey, output: TransactionOutput) -> Result<()>;

    fn delete_utxo(&self, key: &OutpointKey) -> Result<()>;

    /// Tip of the chain, `None` before the genesis block
    fn highest_block(&self) -> Result<Option<BlockRecord>>;

    fn insert_block(&self, record: BlockRecord) -> Result<()>;

    /// Insert the block, delete the spent outputs, insert the created outputs
    /// and drop the mined transactions from the mempool. Either all of it
    /// happens or none of it does.
    fn commit_block(&self, commit: BlockCommit) -> Result<()>;
}

/// Block and transaction persistence behind [`crate::chain::ChainDatabase`].
pub trait ChainStorage {
    /// Number of heights in use; zero for an empty chain
    fn height(&self) -> Result<u64>;

    fn add_block(&mut self, height: u64, block: Block) -> Result<()>;

    /// Stored block with its height
    fn get_block(&self, block_id: &BlockId) -> Result<Option<(Block, u64)>>;

    fn add_tx(&mut self, txid: TxId, tx: Transaction) -> Result<()>;

    fn get_tx(&self, txid: &TxId) -> Result<Option<Transaction>>;

    /// Store the block at `height` together with its transactions. Either all
    /// of it happens or none of it does.
    fn commit_block(
        &mut self,
        height: u64,
        block: Block,
        txs: Vec<(TxId, Transaction)>,
    ) -> Result<()>;
}
