//! Chain database: block linkage and history queries over a [`ChainStorage`]
//!
//! The block graph is a tree; every block has exactly one parent. Queries take a
//! [`Position`] and only see transactions that come before it: earlier in the
//! same block, or anywhere in an ancestor.

use tracing::info;

use crate::error::{LedgerError, Result};
use crate::interpreter::execute_verify;
use crate::script::Script;
use crate::segwit::SigHasher;
use crate::storage::ChainStorage;
use crate::types::*;

/// Location of a transaction: the `tx_index`th transaction of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub block_id: BlockId,
    pub tx_index: u32,
}

impl Position {
    pub fn new(block_id: BlockId, tx_index: u32) -> Self {
        Position { block_id, tx_index }
    }

    /// Position after every transaction of `block`
    pub fn end_of(block: &Block) -> Self {
        Position::new(block.block_id(), block.transactions.len() as u32)
    }
}

pub struct ChainDatabase<S: ChainStorage> {
    storage: S,
}

impl<S: ChainStorage> ChainDatabase<S> {
    pub fn new(storage: S) -> Self {
        ChainDatabase { storage }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn height(&self) -> Result<u64> {
        self.storage.height()
    }

    /// Store `block` under its parent and return its height.
    ///
    /// A zero parent is only accepted on an empty chain. Any other parent must
    /// already be stored, and the block ID must be new.
    pub fn add_block(&mut self, block: Block) -> Result<u64> {
        let parent = block.header.previous_block;
        let height = if parent.is_zero() {
            if self.storage.height()? > 0 {
                return Err(LedgerError::BlockValidation(
                    "genesis blocks must be height #0".to_string(),
                ));
            }
            0
        } else {
            let (_, parent_height) = self.storage.get_block(&parent)?.ok_or_else(|| {
                LedgerError::BlockValidation(format!("parent block {} not found", parent))
            })?;
            parent_height + 1
        };

        let block_id = block.block_id();
        if self.storage.get_block(&block_id)?.is_some() {
            return Err(LedgerError::BlockValidation(format!(
                "block {} already present",
                block_id
            )));
        }

        let txs = block
            .transactions
            .iter()
            .map(|tx| Ok((tx.txid()?, tx.clone())))
            .collect::<Result<Vec<_>>>()?;
        self.storage.commit_block(height, block, txs)?;

        info!(block_id = %block_id, height, "added block to chain");
        Ok(height)
    }

    /// Visit transactions visible from `position`, newest first, until
    /// `visit` returns `false`.
    fn visit_transactions<F>(&self, position: &Position, mut visit: F) -> Result<()>
    where
        F: FnMut(&Transaction) -> Result<bool>,
    {
        let mut block_id = position.block_id;
        let mut first = true;
        while !block_id.is_zero() {
            let (block, _) = self.storage.get_block(&block_id)?.ok_or_else(|| {
                LedgerError::BlockValidation(format!("block {} not found", block_id))
            })?;

            let end = if first {
                let end = position.tx_index as usize;
                if end > block.transactions.len() {
                    return Err(LedgerError::BlockValidation(format!(
                        "transaction index {} out of range for block {} with {} transactions",
                        end,
                        block_id,
                        block.transactions.len()
                    )));
                }
                end
            } else {
                block.transactions.len()
            };
            first = false;

            for tx in block.transactions[..end].iter().rev() {
                if !visit(tx)? {
                    return Ok(());
                }
            }
            block_id = block.header.previous_block;
        }
        Ok(())
    }

    /// Transaction `txid` if it is visible from `position`
    pub fn get_transaction(&self, position: &Position, txid: &TxId) -> Result<Option<Transaction>> {
        let mut found = None;
        self.visit_transactions(position, |tx| {
            if tx.txid()? == *txid {
                found = Some(tx.clone());
                return Ok(false);
            }
            Ok(true)
        })?;
        Ok(found)
    }

    /// True iff `outpoint` was created and not spent by anything visible from
    /// `position`. An outpoint whose creator is not visible is an error.
    pub fn unspent(&self, position: &Position, outpoint: &Outpoint) -> Result<bool> {
        let mut result = None;
        self.visit_transactions(position, |tx| {
            if tx.txid()? == outpoint.previous_tx {
                result = Some(true);
                return Ok(false);
            }
            if tx.inputs().iter().any(|input| input.outpoint == *outpoint) {
                result = Some(false);
                return Ok(false);
            }
            Ok(true)
        })?;
        result.ok_or_else(|| LedgerError::UtxoNotFound(outpoint.to_string()))
    }

    /// A genesis transaction only belongs at index 0 of a stored first block
    /// that holds nothing else.
    fn check_genesis_position(&self, position: &Position) -> Result<()> {
        let (block, height) = self.storage.get_block(&position.block_id)?.ok_or_else(|| {
            LedgerError::BlockValidation(format!("block {} not found", position.block_id))
        })?;
        if !block.header.previous_block.is_zero()
            || height != 0
            || position.tx_index != 0
            || block.transactions.len() != 1
        {
            return Err(LedgerError::TransactionValidation(format!(
                "genesis transaction at index {} of block {} (height {}); only the sole \
                 transaction of the first block may mint",
                position.tx_index, position.block_id, height
            )));
        }
        Ok(())
    }

    /// Check `tx` against the history visible from `position`.
    ///
    /// A transfer is valid when it is well-formed and standard, spends only
    /// unspent outputs, every script pair verifies, and its inputs add up to
    /// exactly its outputs. A genesis transaction is valid only at the start of
    /// a first block holding nothing else.
    pub fn transaction_valid(&self, position: &Position, tx: &Transaction) -> Result<()> {
        match tx.tx_type() {
            TxType::Genesis | TxType::Transfer => {}
            other => {
                return Err(LedgerError::TransactionValidation(format!(
                    "no validation rules for {:?} transactions",
                    other
                )))
            }
        }
        tx.well_formed().into_result()?;
        tx.standard().into_result()?;
        if tx.is_genesis() {
            return self.check_genesis_position(position);
        }

        for inpoint in tx.inpoints() {
            if !self.unspent(position, &inpoint)? {
                return Err(LedgerError::TransactionValidation(format!(
                    "input {} already spent",
                    inpoint
                )));
            }
        }

        let mut prev_outputs = Vec::with_capacity(tx.inputs().len());
        for inpoint in tx.inpoints() {
            let prev_tx = self
                .get_transaction(position, &inpoint.previous_tx)?
                .ok_or_else(|| LedgerError::UtxoNotFound(inpoint.to_string()))?;
            let output = prev_tx
                .outputs()
                .get(inpoint.index as usize)
                .cloned()
                .ok_or_else(|| {
                    LedgerError::TransactionValidation(format!(
                        "input index out of range for previous transaction: {}",
                        inpoint
                    ))
                })?;
            prev_outputs.push(output);
        }

        if !prev_outputs.is_empty() {
            let hasher = SigHasher::new(tx)?;
            for (i, (input, prev)) in tx.inputs().iter().zip(&prev_outputs).enumerate() {
                execute_verify(
                    &Script::parse(&prev.script_pubkey)?,
                    &Script::parse(&input.script_sig)?,
                    &tx.witnesses()[i],
                    &hasher,
                    i,
                    prev.value as u64,
                )?;
            }
        }

        let total_in: u64 = prev_outputs.iter().map(|o| o.value as u64).sum();
        let total_out = tx.output_value();
        if total_in != total_out {
            return Err(LedgerError::TransactionValidation(format!(
                "value of inputs ({}) does not equal value of outputs ({})",
                total_in, total_out
            )));
        }
        Ok(())
    }
}
