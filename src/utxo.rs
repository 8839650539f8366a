//! Conflict tracking for the block under assembly
//!
//! A [`SpendingState`] sits on top of the confirmed UTXO set and accumulates the
//! transactions of the next block. It refuses anything that would overflow the
//! block, repeat an accepted transaction or spend an outpoint twice. It is
//! never persisted; the miner builds a fresh one per block.

use indexmap::{IndexMap, IndexSet};

use crate::codec::Codec;
use crate::constants::BLOCK_SIZE_LIMIT;
use crate::error::{LedgerError, Result};
use crate::types::*;

#[derive(Debug, Clone)]
pub struct SpendingState {
    limit: usize,
    size: usize,
    spent: IndexSet<OutpointKey>,
    new_utxos: IndexMap<OutpointKey, TransactionOutput>,
    accepted: Vec<Transaction>,
    accepted_ids: IndexSet<TxId>,
}

impl Default for SpendingState {
    fn default() -> Self {
        Self::new()
    }
}

impl SpendingState {
    pub fn new() -> Self {
        Self::with_limit(BLOCK_SIZE_LIMIT)
    }

    /// State bounded by `limit` bytes of transactions instead of the block limit.
    pub fn with_limit(limit: usize) -> Self {
        SpendingState {
            limit,
            size: 0,
            spent: IndexSet::new(),
            new_utxos: IndexMap::new(),
            accepted: Vec::new(),
            accepted_ids: IndexSet::new(),
        }
    }

    /// Accept `tx` into the pending block.
    ///
    /// Nothing is modified when the transaction is rejected. A capacity
    /// rejection is [`LedgerError::BlockFull`]; the transaction may fit a
    /// later block.
    pub fn add_tx(&mut self, tx: &Transaction) -> Result<TxId> {
        let tx_size = tx.size();
        let new_size = self.size.saturating_add(tx_size);
        if new_size > self.limit {
            return Err(LedgerError::BlockFull {
                size: new_size,
                limit: self.limit,
            });
        }

        let txid = tx.txid()?;
        if self.accepted_ids.contains(&txid) {
            return Err(LedgerError::DuplicateTransaction(txid.to_string()));
        }

        let inpoints: Vec<OutpointKey> = tx.inpoints().iter().map(Outpoint::key).collect();
        if let Some(conflict) = inpoints.iter().find(|key| self.spent.contains(*key)) {
            return Err(LedgerError::DoubleSpend(conflict.outpoint().to_string()));
        }
        let outpoints = tx.outpoints()?;

        self.spent.extend(inpoints);
        for (outpoint, output) in outpoints {
            self.new_utxos.insert(outpoint.key(), output.clone());
        }
        self.accepted.push(tx.clone());
        self.accepted_ids.insert(txid);
        self.size = new_size;
        Ok(txid)
    }

    /// Output created earlier in this pending block and not yet spent in it
    pub fn is_new_unspent(&self, key: &OutpointKey) -> Option<&TransactionOutput> {
        if self.spent.contains(key) {
            return None;
        }
        self.new_utxos.get(key)
    }

    pub fn is_spent(&self, key: &OutpointKey) -> bool {
        self.spent.contains(key)
    }

    pub fn contains_tx(&self, txid: &TxId) -> bool {
        self.accepted_ids.contains(txid)
    }

    pub fn accepted_transactions(&self) -> &[Transaction] {
        &self.accepted
    }

    pub fn into_accepted_transactions(self) -> Vec<Transaction> {
        self.accepted
    }

    pub fn accepted_ids(&self) -> impl Iterator<Item = &TxId> {
        self.accepted_ids.iter()
    }

    /// Every outpoint consumed in this block, in acceptance order
    pub fn spent_utxos(&self) -> Vec<OutpointKey> {
        self.spent.iter().copied().collect()
    }

    /// Spent outpoints that existed before this block; these leave the
    /// confirmed set on commit.
    pub fn confirmed_spent(&self) -> Vec<OutpointKey> {
        self.spent
            .iter()
            .filter(|key| !self.new_utxos.contains_key(*key))
            .copied()
            .collect()
    }

    /// Outputs created in this block that are still unspent at its end; these
    /// join the confirmed set on commit.
    pub fn new_utxos(&self) -> Vec<(OutpointKey, TransactionOutput)> {
        self.new_utxos
            .iter()
            .filter(|(key, _)| !self.spent.contains(*key))
            .map(|(key, output)| (*key, output.clone()))
            .collect()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        self.accepted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accepted.is_empty()
    }

    pub fn has_genesis(&self) -> bool {
        self.accepted.iter().any(Transaction::is_genesis)
    }
}
