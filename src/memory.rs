//! In-memory storage backends

use std::collections::HashMap;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{LedgerError, Result};
use crate::storage::{BlockCommit, BlockRecord, ChainStorage, LedgerStorage};
use crate::types::*;

#[derive(Debug, Default)]
struct LedgerState {
    mempool: IndexMap<TxId, Transaction>,
    utxos: HashMap<OutpointKey, TransactionOutput>,
    blocks: IndexMap<BlockId, BlockRecord>,
    tip: Option<BlockId>,
}

impl LedgerState {
    fn tip(&self) -> Option<&BlockRecord> {
        self.tip.as_ref().and_then(|id| self.blocks.get(id))
    }

    /// The record must extend the current tip.
    fn check_linkage(&self, record: &BlockRecord) -> Result<()> {
        if self.blocks.contains_key(&record.block_id) {
            return Err(LedgerError::BlockValidation(format!(
                "block {} already stored",
                record.block_id
            )));
        }
        match self.tip() {
            None if record.parent.is_zero() && record.height == 0 => Ok(()),
            None => Err(LedgerError::BlockValidation(format!(
                "first block must have a zero parent and height 0, got parent {} height {}",
                record.parent, record.height
            ))),
            Some(tip) if record.parent == tip.block_id && record.height == tip.height + 1 => Ok(()),
            Some(tip) => Err(LedgerError::BlockValidation(format!(
                "block {} at height {} does not extend tip {} at height {}",
                record.block_id, record.height, tip.block_id, tip.height
            ))),
        }
    }
}

/// Mempool, UTXO set and block list behind a single mutex
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mempool_len(&self) -> usize {
        self.state.lock().mempool.len()
    }

    pub fn utxo_count(&self) -> usize {
        self.state.lock().utxos.len()
    }

    pub fn block_count(&self) -> usize {
        self.state.lock().blocks.len()
    }

    pub fn get_block(&self, block_id: &BlockId) -> Option<BlockRecord> {
        self.state.lock().blocks.get(block_id).cloned()
    }
}

impl LedgerStorage for MemoryLedger {
    fn mempool_txs(&self) -> Result<Vec<Transaction>> {
        Ok(self.state.lock().mempool.values().cloned().collect())
    }

    fn queue_tx(&self, tx: Transaction) -> Result<TxId> {
        let txid = tx.txid()?;
        let mut state = self.state.lock();
        if state.mempool.contains_key(&txid) {
            return Err(LedgerError::DuplicateTransaction(txid.to_string()));
        }
        state.mempool.insert(txid, tx);
        Ok(txid)
    }

    fn delete_mempool_tx(&self, txid: &TxId) -> Result<()> {
        self.state.lock().mempool.shift_remove(txid);
        Ok(())
    }

    fn utxo(&self, key: &OutpointKey) -> Result<Option<TransactionOutput>> {
        Ok(self.state.lock().utxos.get(key).cloned())
    }

    fn insert_utxo(&self, key: OutpointKey, output: TransactionOutput) -> Result<()> {
        let mut state = self.state.lock();
        if state.utxos.contains_key(&key) {
            return Err(LedgerError::Storage(format!(
                "utxo {} already exists",
                key.outpoint()
            )));
        }
        state.utxos.insert(key, output);
        Ok(())
    }

    fn delete_utxo(&self, key: &OutpointKey) -> Result<()> {
        self.state
            .lock()
            .utxos
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| LedgerError::UtxoNotFound(key.outpoint().to_string()))
    }

    fn highest_block(&self) -> Result<Option<BlockRecord>> {
        Ok(self.state.lock().tip().cloned())
    }

    fn insert_block(&self, record: BlockRecord) -> Result<()> {
        let mut state = self.state.lock();
        state.check_linkage(&record)?;
        state.tip = Some(record.block_id);
        state.blocks.insert(record.block_id, record);
        Ok(())
    }

    fn commit_block(&self, commit: BlockCommit) -> Result<()> {
        let mut state = self.state.lock();

        state.check_linkage(&commit.record)?;
        if let Some(missing) = commit.spent.iter().find(|key| !state.utxos.contains_key(*key)) {
            return Err(LedgerError::UtxoNotFound(missing.outpoint().to_string()));
        }
        if let Some((existing, _)) = commit
            .created
            .iter()
            .find(|(key, _)| state.utxos.contains_key(key))
        {
            return Err(LedgerError::Storage(format!(
                "utxo {} already exists",
                existing.outpoint()
            )));
        }

        for key in &commit.spent {
            state.utxos.remove(key);
        }
        for (key, output) in commit.created {
            state.utxos.insert(key, output);
        }
        for txid in &commit.mined {
            state.mempool.shift_remove(txid);
        }
        debug!(
            block_id = %commit.record.block_id,
            height = commit.record.height,
            "committed block"
        );
        state.tip = Some(commit.record.block_id);
        state.blocks.insert(commit.record.block_id, commit.record);
        Ok(())
    }
}

/// Blocks and transactions keyed by ID
#[derive(Debug, Default)]
pub struct MemoryChainStorage {
    blocks: HashMap<BlockId, (Block, u64)>,
    height: u64,
    txns: HashMap<TxId, Transaction>,
}

impl MemoryChainStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_new_block(&self, block_id: &BlockId) -> Result<()> {
        if self.blocks.contains_key(block_id) {
            return Err(LedgerError::BlockValidation(format!(
                "block {} already present in database",
                block_id
            )));
        }
        Ok(())
    }
}

impl ChainStorage for MemoryChainStorage {
    fn height(&self) -> Result<u64> {
        Ok(self.height)
    }

    fn add_block(&mut self, height: u64, block: Block) -> Result<()> {
        let block_id = block.block_id();
        self.check_new_block(&block_id)?;
        self.blocks.insert(block_id, (block, height));
        self.height = self.height.max(height + 1);
        Ok(())
    }

    fn get_block(&self, block_id: &BlockId) -> Result<Option<(Block, u64)>> {
        Ok(self.blocks.get(block_id).cloned())
    }

    fn add_tx(&mut self, txid: TxId, tx: Transaction) -> Result<()> {
        self.txns.insert(txid, tx);
        Ok(())
    }

    fn get_tx(&self, txid: &TxId) -> Result<Option<Transaction>> {
        Ok(self.txns.get(txid).cloned())
    }

    fn commit_block(
        &mut self,
        height: u64,
        block: Block,
        txs: Vec<(TxId, Transaction)>,
    ) -> Result<()> {
        // add_block fails before any write
        self.add_block(height, block)?;
        self.txns.extend(txs);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(value: u32) -> TransactionOutput {
        TransactionOutput {
            value,
            script_pubkey: vec![0x00],
        }
    }

    fn block_on(parent: BlockId, value: u32) -> Block {
        Block::new(parent, vec![Transaction::new_genesis(vec![output(value)])], 0, 0).unwrap()
    }

    fn key(n: u8) -> OutpointKey {
        Outpoint::new(TxId([n; 32]), 0).key()
    }

    #[test]
    fn test_mempool_order_and_duplicates() {
        let ledger = MemoryLedger::new();
        let a = Transaction::new_genesis(vec![output(1)]);
        let b = Transaction::new_genesis(vec![output(2)]);
        let a_id = ledger.queue_tx(a.clone()).unwrap();
        ledger.queue_tx(b.clone()).unwrap();
        assert!(matches!(
            ledger.queue_tx(a.clone()),
            Err(LedgerError::DuplicateTransaction(_))
        ));
        assert_eq!(ledger.mempool_txs().unwrap(), vec![a, b.clone()]);

        ledger.delete_mempool_tx(&a_id).unwrap();
        ledger.delete_mempool_tx(&a_id).unwrap();
        assert_eq!(ledger.mempool_txs().unwrap(), vec![b]);
    }

    #[test]
    fn test_utxo_insert_delete() {
        let ledger = MemoryLedger::new();
        ledger.insert_utxo(key(1), output(5)).unwrap();
        assert!(ledger.insert_utxo(key(1), output(5)).is_err());
        assert_eq!(ledger.utxo(&key(1)).unwrap(), Some(output(5)));
        ledger.delete_utxo(&key(1)).unwrap();
        assert!(matches!(
            ledger.delete_utxo(&key(1)),
            Err(LedgerError::UtxoNotFound(_))
        ));
        assert_eq!(ledger.utxo(&key(1)).unwrap(), None);
    }

    #[test]
    fn test_block_linkage() {
        let ledger = MemoryLedger::new();
        assert!(ledger.highest_block().unwrap().is_none());

        let orphan = block_on(BlockId([9; 32]), 1);
        assert!(ledger.insert_block(BlockRecord::new(0, orphan)).is_err());

        let genesis = block_on(BlockId::zero(), 1);
        let genesis_id = genesis.block_id();
        ledger
            .insert_block(BlockRecord::new(0, genesis.clone()))
            .unwrap();
        assert!(ledger.insert_block(BlockRecord::new(0, genesis)).is_err());

        let next = block_on(genesis_id, 2);
        assert!(ledger.insert_block(BlockRecord::new(5, next.clone())).is_err());
        ledger.insert_block(BlockRecord::new(1, next.clone())).unwrap();

        let tip = ledger.highest_block().unwrap().unwrap();
        assert_eq!(tip.block_id, next.block_id());
        assert_eq!(tip.height, 1);
        assert_eq!(tip.parent, genesis_id);
    }

    #[test]
    fn test_commit_is_all_or_nothing() {
        let ledger = MemoryLedger::new();
        ledger.insert_utxo(key(1), output(5)).unwrap();
        let tx = Transaction::new_genesis(vec![output(5)]);
        let txid = ledger.queue_tx(tx).unwrap();

        // spends a missing output: nothing may change
        let bad = BlockCommit {
            record: BlockRecord::new(0, block_on(BlockId::zero(), 5)),
            spent: vec![key(1), key(2)],
            created: vec![(key(3), output(5))],
            mined: vec![txid],
        };
        assert!(ledger.commit_block(bad).is_err());
        assert_eq!(ledger.utxo(&key(1)).unwrap(), Some(output(5)));
        assert_eq!(ledger.utxo(&key(3)).unwrap(), None);
        assert_eq!(ledger.mempool_len(), 1);
        assert_eq!(ledger.block_count(), 0);

        let good = BlockCommit {
            record: BlockRecord::new(0, block_on(BlockId::zero(), 5)),
            spent: vec![key(1)],
            created: vec![(key(3), output(5))],
            mined: vec![txid],
        };
        ledger.commit_block(good).unwrap();
        assert_eq!(ledger.utxo(&key(1)).unwrap(), None);
        assert_eq!(ledger.utxo(&key(3)).unwrap(), Some(output(5)));
        assert_eq!(ledger.mempool_len(), 0);
        assert_eq!(ledger.block_count(), 1);
    }

    #[test]
    fn test_chain_storage_heights() {
        let mut storage = MemoryChainStorage::new();
        assert_eq!(storage.height().unwrap(), 0);

        let genesis = block_on(BlockId::zero(), 1);
        let genesis_id = genesis.block_id();
        storage.add_block(0, genesis.clone()).unwrap();
        assert!(storage.add_block(0, genesis).is_err());

        let next = block_on(genesis_id, 2);
        storage.add_block(1, next.clone()).unwrap();
        assert_eq!(storage.height().unwrap(), 2);
        assert_eq!(storage.get_block(&next.block_id()).unwrap().map(|(_, h)| h), Some(1));
        assert!(storage.get_block(&BlockId([7; 32])).unwrap().is_none());
    }
}
