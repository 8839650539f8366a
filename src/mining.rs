//! Block production
//!
//! A single trusted miner pulls the mempool, accepts every transaction that
//! validates against the confirmed UTXO set plus the block being assembled,
//! signs the block and commits it in one storage call. Transactions that fail
//! stay in the mempool for a later cycle.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use secp256k1::{PublicKey, Secp256k1, SecretKey};
use tokio::{select, sync::Notify, task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::Codec;
use crate::error::{LedgerError, Result};
use crate::interpreter::execute_verify;
use crate::script::Script;
use crate::segwit::{pubkey_hash, SigHasher};
use crate::storage::{BlockCommit, BlockRecord, LedgerStorage};
use crate::types::*;
use crate::utxo::SpendingState;

/// When the miner wakes up to build a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSchedule {
    /// As soon as a transaction is queued
    Immediate,
    /// Every interval, or earlier when a transaction is queued
    Interval(Duration),
}

/// Queues transactions and wakes the miner
pub struct MinerHandle<S> {
    storage: Arc<S>,
    notify: Arc<Notify>,
}

impl<S> Clone for MinerHandle<S> {
    fn clone(&self) -> Self {
        MinerHandle {
            storage: Arc::clone(&self.storage),
            notify: Arc::clone(&self.notify),
        }
    }
}

impl<S: LedgerStorage> MinerHandle<S> {
    pub fn queue_tx(&self, tx: Transaction) -> Result<TxId> {
        let txid = self.storage.queue_tx(tx)?;
        debug!(txid = %txid, "queued transaction");
        self.notify.notify_one();
        Ok(txid)
    }
}

pub struct LedgerMiner<S> {
    storage: Arc<S>,
    signing_key: SecretKey,
    notify: Arc<Notify>,
    schedule: BlockSchedule,
}

impl<S: LedgerStorage> LedgerMiner<S> {
    pub fn new(storage: Arc<S>, signing_key: SecretKey, schedule: BlockSchedule) -> Self {
        LedgerMiner {
            storage,
            signing_key,
            notify: Arc::new(Notify::new()),
            schedule,
        }
    }

    pub fn handle(&self) -> MinerHandle<S> {
        MinerHandle {
            storage: Arc::clone(&self.storage),
            notify: Arc::clone(&self.notify),
        }
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Key that verifies this miner's block signatures
    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_secret_key(&Secp256k1::signing_only(), &self.signing_key)
    }

    /// Mint `total_coins` to `owner` in the first block of the chain.
    pub fn init_genesis_block(&self, total_coins: u32, owner: &PublicKey) -> Result<Block> {
        if let Some(tip) = self.storage.highest_block()? {
            return Err(LedgerError::BlockValidation(format!(
                "chain already has blocks up to height {}",
                tip.height
            )));
        }

        let tx = Transaction::new_genesis(vec![TransactionOutput {
            value: total_coins,
            script_pubkey: Script::p2wpkh_output(&pubkey_hash(owner)).marshal(),
        }]);
        info!(txid = %tx.txid()?, total_coins, "adding genesis transaction");

        let mut state = SpendingState::new();
        state.add_tx(&tx)?;
        self.commit(state, None)
    }

    /// Run one mining cycle; `None` when nothing could be mined.
    pub fn generate_block(&self) -> Result<Option<Block>> {
        let mempool = self.storage.mempool_txs()?;
        if mempool.is_empty() {
            debug!("mempool is empty");
            return Ok(None);
        }

        let tip = self.storage.highest_block()?;
        let mut state = SpendingState::new();

        // repeat until a pass adds nothing, so transactions spending outputs of
        // later mempool entries are still picked up
        loop {
            let mut progress = false;
            for tx in &mempool {
                let txid = match tx.txid() {
                    Ok(txid) => txid,
                    Err(e) => {
                        warn!(error = %e, "skipping unencodable mempool transaction");
                        continue;
                    }
                };
                if state.contains_tx(&txid) {
                    continue;
                }
                if let Err(e) = self.validate_tx(tx, tip.as_ref(), &state) {
                    debug!(txid = %txid, error = %e, "transaction not valid yet, skipping");
                    continue;
                }
                match state.add_tx(tx) {
                    Ok(_) => progress = true,
                    Err(e) if e.is_capacity() => {
                        debug!(txid = %txid, error = %e, "block is full, deferring transaction")
                    }
                    Err(e) => {
                        warn!(txid = %txid, error = %e, "transaction conflicts with block, skipping")
                    }
                }
            }
            if !progress {
                break;
            }
        }

        if state.is_empty() {
            debug!(pending = mempool.len(), "no transaction could be mined");
            return Ok(None);
        }
        info!(txs = state.len(), "accepted transactions into block");
        self.commit(state, tip.as_ref()).map(Some)
    }

    /// Check `tx` against the confirmed UTXO set and the block under assembly.
    pub fn validate_tx(
        &self,
        tx: &Transaction,
        tip: Option<&BlockRecord>,
        state: &SpendingState,
    ) -> Result<()> {
        tx.well_formed().into_result()?;
        tx.standard().into_result()?;

        match &tx.body {
            TransactionBody::Genesis(_) => {
                if tip.is_some() || !state.is_empty() {
                    return Err(LedgerError::TransactionValidation(
                        "only the first block can hold a genesis transaction".to_string(),
                    ));
                }
                return Ok(());
            }
            TransactionBody::EscrowOpen(_) => {
                return Err(LedgerError::TransactionValidation(
                    "escrow transactions cannot be mined".to_string(),
                ));
            }
            TransactionBody::Transfer(_) => {}
        }
        if state.has_genesis() {
            return Err(LedgerError::TransactionValidation(
                "the genesis transaction must be alone in its block".to_string(),
            ));
        }

        let mut prev_outputs = Vec::with_capacity(tx.inputs().len());
        for input in tx.inputs() {
            let key = input.outpoint.key();
            if state.is_spent(&key) {
                return Err(LedgerError::DoubleSpend(input.outpoint.to_string()));
            }
            let output = match state.is_new_unspent(&key) {
                Some(output) => output.clone(),
                None => self
                    .storage
                    .utxo(&key)?
                    .ok_or_else(|| LedgerError::UtxoNotFound(input.outpoint.to_string()))?,
            };
            prev_outputs.push(output);
        }

        let mut total_in = 0u64;
        for output in &prev_outputs {
            total_in = total_in.checked_add(output.value as u64).ok_or_else(|| {
                LedgerError::TransactionValidation("input values overflow".to_string())
            })?;
        }
        let mut total_out = 0u64;
        for output in tx.outputs() {
            total_out = total_out.checked_add(output.value as u64).ok_or_else(|| {
                LedgerError::TransactionValidation("output values overflow".to_string())
            })?;
        }
        if total_in != total_out {
            return Err(LedgerError::TransactionValidation(format!(
                "output sum {} does not match input sum {}",
                total_out, total_in
            )));
        }

        let hasher = SigHasher::new(tx)?;
        let spends = tx.inputs().iter().zip(tx.witnesses()).zip(&prev_outputs);
        for (i, ((input, witness), prev)) in spends.enumerate() {
            execute_verify(
                &Script::parse(&prev.script_pubkey)?,
                &Script::parse(&input.script_sig)?,
                witness,
                &hasher,
                i,
                prev.value as u64,
            )?;
        }
        Ok(())
    }

    /// Sign a block over the accepted transactions and commit it atomically.
    fn commit(&self, state: SpendingState, tip: Option<&BlockRecord>) -> Result<Block> {
        let (previous_block, height) = match tip {
            Some(tip) => (tip.block_id, tip.height + 1),
            None => (BlockId::zero(), 0),
        };
        let spent = state.confirmed_spent();
        let created = state.new_utxos();
        let mined: Vec<TxId> = state.accepted_ids().copied().collect();

        let mut block = Block::new(
            previous_block,
            state.into_accepted_transactions(),
            unix_timestamp()?,
            rand::random(),
        )?;
        block.sign(&self.signing_key)?;

        let record = BlockRecord::new(height, block.clone());
        info!(
            block_id = %record.block_id,
            height,
            txs = block.transactions.len(),
            size = block.size(),
            "adding block to storage"
        );
        self.storage.commit_block(BlockCommit {
            record,
            spent,
            created,
            mined,
        })?;
        Ok(block)
    }

    /// Wait for the next reason to mine; `false` once cancelled.
    pub async fn wait_for_work(&self, cancel_token: &CancellationToken) -> bool {
        match self.schedule {
            BlockSchedule::Immediate => select! {
                _ = cancel_token.cancelled() => false,
                _ = self.notify.notified() => true,
            },
            BlockSchedule::Interval(interval) => select! {
                _ = cancel_token.cancelled() => false,
                _ = sleep(interval) => true,
                _ = self.notify.notified() => true,
            },
        }
    }

    pub async fn run(self, cancel_token: CancellationToken) {
        loop {
            if cancel_token.is_cancelled() {
                break;
            }
            debug!("checking for new transactions in mempool");
            match self.generate_block() {
                Ok(Some(block)) => info!(
                    block_id = %block.block_id(),
                    txs = block.transactions.len(),
                    "block has been created"
                ),
                Ok(None) => {}
                Err(e) => error!(error = %e, "failed to create block, retrying next cycle"),
            }
            if !self.wait_for_work(&cancel_token).await {
                break;
            }
        }
        info!("Miner exited");
    }
}

impl<S: LedgerStorage + 'static> LedgerMiner<S> {
    pub fn spawn(self, cancel_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel_token))
    }
}

/// Seconds since the epoch as stored in block headers
fn unix_timestamp() -> Result<u32> {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| LedgerError::BlockValidation(format!("clock before epoch: {}", e)))?
        .as_secs();
    header_timestamp(secs)
}

fn header_timestamp(secs: u64) -> Result<u32> {
    u32::try_from(secs).map_err(|_| {
        LedgerError::BlockValidation(format!("timestamp {} does not fit a block header", secs))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{DEFAULT_GENESIS_COINS, SEQUENCE_FINAL};
    use crate::memory::MemoryLedger;

    fn key(n: u8) -> SecretKey {
        SecretKey::from_slice(&[n; 32]).unwrap()
    }

    fn public(key: &SecretKey) -> PublicKey {
        PublicKey::from_secret_key(&Secp256k1::new(), key)
    }

    fn pay_to(key: &SecretKey, value: u32) -> TransactionOutput {
        TransactionOutput {
            value,
            script_pubkey: Script::p2wpkh_output(&pubkey_hash(&public(key))).marshal(),
        }
    }

    fn transfer(
        from: &SecretKey,
        spends: &[(Outpoint, TransactionOutput)],
        outputs: Vec<TransactionOutput>,
    ) -> Transaction {
        let inputs = spends
            .iter()
            .map(|(outpoint, _)| TransactionInput {
                outpoint: *outpoint,
                script_sig: vec![],
                sequence: SEQUENCE_FINAL,
            })
            .collect();
        let prev: Vec<_> = spends.iter().map(|(_, o)| o.clone()).collect();
        let mut tx = Transaction::new_transfer(inputs, outputs, 0);
        tx.generate_witnesses(from, &prev).unwrap();
        tx
    }

    fn miner() -> LedgerMiner<MemoryLedger> {
        LedgerMiner::new(
            Arc::new(MemoryLedger::new()),
            key(42),
            BlockSchedule::Immediate,
        )
    }

    /// Miner with a genesis output of 1000 owned by key 1
    fn funded_miner() -> (LedgerMiner<MemoryLedger>, Outpoint) {
        let miner = miner();
        let genesis = miner.init_genesis_block(1000, &public(&key(1))).unwrap();
        let outpoint = Outpoint::new(genesis.transactions[0].txid().unwrap(), 0);
        (miner, outpoint)
    }

    #[test]
    fn test_genesis_block() {
        let miner = miner();
        let owner = public(&key(1));
        let block = miner
            .init_genesis_block(DEFAULT_GENESIS_COINS, &owner)
            .unwrap();
        assert!(block.is_genesis());
        block.verify_signature(&miner.public_key()).unwrap();
        block.check_merkle_root().unwrap();

        let tip = miner.storage().highest_block().unwrap().unwrap();
        assert_eq!(tip.height, 0);
        assert_eq!(tip.block_id, block.block_id());
        assert_eq!(miner.storage().utxo_count(), 1);

        assert!(miner.init_genesis_block(1, &owner).is_err());
    }

    #[test]
    fn test_empty_mempool_mines_nothing() {
        let (miner, _) = funded_miner();
        assert!(miner.generate_block().unwrap().is_none());
    }

    #[test]
    fn test_mines_valid_transfer() {
        let (miner, genesis_out) = funded_miner();
        let tx = transfer(
            &key(1),
            &[(genesis_out, pay_to(&key(1), 1000))],
            vec![pay_to(&key(2), 700), pay_to(&key(1), 300)],
        );
        let txid = miner.handle().queue_tx(tx).unwrap();

        let block = miner.generate_block().unwrap().unwrap();
        assert_eq!(block.transactions.len(), 1);
        assert_eq!(miner.storage().mempool_len(), 0);
        assert_eq!(
            miner.storage().utxo(&genesis_out.key()).unwrap(),
            None
        );
        assert_eq!(
            miner
                .storage()
                .utxo(&Outpoint::new(txid, 0).key())
                .unwrap()
                .map(|o| o.value),
            Some(700)
        );

        let tip = miner.storage().highest_block().unwrap().unwrap();
        assert_eq!(tip.height, 1);
        assert!(!block.is_genesis());
    }

    #[test]
    fn test_chained_transactions_in_one_block() {
        let (miner, genesis_out) = funded_miner();
        let parent = transfer(
            &key(1),
            &[(genesis_out, pay_to(&key(1), 1000))],
            vec![pay_to(&key(2), 1000)],
        );
        let parent_id = parent.txid().unwrap();
        let child = transfer(
            &key(2),
            &[(Outpoint::new(parent_id, 0), pay_to(&key(2), 1000))],
            vec![pay_to(&key(3), 1000)],
        );

        // child arrives first and only validates on the second pass
        let handle = miner.handle();
        let child_id = handle.queue_tx(child).unwrap();
        handle.queue_tx(parent).unwrap();

        let block = miner.generate_block().unwrap().unwrap();
        assert_eq!(block.transactions.len(), 2);
        assert_eq!(miner.storage().utxo_count(), 1);
        assert!(miner
            .storage()
            .utxo(&Outpoint::new(child_id, 0).key())
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_conflicting_spend_stays_in_mempool() {
        let (miner, genesis_out) = funded_miner();
        let spends = [(genesis_out, pay_to(&key(1), 1000))];
        let to_two = transfer(&key(1), &spends, vec![pay_to(&key(2), 1000)]);
        let to_three = transfer(&key(1), &spends, vec![pay_to(&key(3), 1000)]);
        let handle = miner.handle();
        handle.queue_tx(to_two).unwrap();
        let loser = handle.queue_tx(to_three).unwrap();

        let block = miner.generate_block().unwrap().unwrap();
        assert_eq!(block.transactions.len(), 1);
        let remaining = miner.storage().mempool_txs().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].txid().unwrap(), loser);

        // the loser can never be mined now
        assert!(miner.generate_block().unwrap().is_none());
    }

    #[test]
    fn test_rejects_unbalanced_and_unsigned() {
        let (miner, genesis_out) = funded_miner();
        let spends = [(genesis_out, pay_to(&key(1), 1000))];
        let state = SpendingState::new();
        let tip = miner.storage().highest_block().unwrap();

        let unbalanced = transfer(&key(1), &spends, vec![pay_to(&key(2), 1001)]);
        assert!(miner.validate_tx(&unbalanced, tip.as_ref(), &state).is_err());

        let wrong_signer = transfer(&key(7), &spends, vec![pay_to(&key(2), 1000)]);
        assert!(miner.validate_tx(&wrong_signer, tip.as_ref(), &state).is_err());

        let good = transfer(&key(1), &spends, vec![pay_to(&key(2), 1000)]);
        miner.validate_tx(&good, tip.as_ref(), &state).unwrap();
    }

    #[test]
    fn test_genesis_only_first_block() {
        let (miner, _) = funded_miner();
        let late = Transaction::new_genesis(vec![pay_to(&key(1), 5)]);
        miner.handle().queue_tx(late).unwrap();
        assert!(miner.generate_block().unwrap().is_none());
        assert_eq!(miner.storage().mempool_len(), 1);
    }

    #[test]
    fn test_escrow_open_not_mined() {
        let (miner, _) = funded_miner();
        let escrow = Transaction::new(TransactionBody::EscrowOpen(EscrowOpenTransaction {}));
        let state = SpendingState::new();
        assert!(miner.validate_tx(&escrow, None, &state).is_err());
    }

    #[test]
    fn test_header_timestamp_range() {
        assert_eq!(header_timestamp(1_700_000_000).unwrap(), 1_700_000_000);
        assert_eq!(header_timestamp(u32::MAX as u64).unwrap(), u32::MAX);
        assert!(header_timestamp(u32::MAX as u64 + 1).is_err());
    }

    #[tokio::test]
    async fn test_immediate_schedule_wakes_on_queue() {
        let miner = miner();
        let cancel_token = CancellationToken::new();
        miner.handle().notify.notify_one();
        assert!(miner.wait_for_work(&cancel_token).await);

        cancel_token.cancel();
        assert!(!miner.wait_for_work(&cancel_token).await);
    }

    #[tokio::test]
    async fn test_interval_schedule_wakes_early() {
        let miner = LedgerMiner::new(
            Arc::new(MemoryLedger::new()),
            key(42),
            BlockSchedule::Interval(Duration::from_secs(3600)),
        );
        let cancel_token = CancellationToken::new();
        let handle = miner.handle();
        handle
            .queue_tx(Transaction::new_genesis(vec![pay_to(&key(1), 1)]))
            .unwrap();
        let woke = tokio::time::timeout(
            Duration::from_secs(5),
            miner.wait_for_work(&cancel_token),
        )
        .await;
        assert_eq!(woke.ok(), Some(true));
    }
}
