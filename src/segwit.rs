//! Segregated-witness signature hashing
//!
//! The digest for one input commits to every outpoint, every sequence number
//! and every output through three aggregate hashes that are computed once per
//! transaction, so signing all inputs stays linear in the transaction size.

use bitcoin_hashes::{sha256d, Hash as BitcoinHash, HashEngine};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

use crate::constants::SIGHASH_ALL;
use crate::error::{LedgerError, Result};
use crate::hashes::{hash160, Hash};
use crate::interpreter::SigHashable;
use crate::script::Script;
use crate::types::*;

/// Aggregate digests shared by every input of one transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionHashes {
    pub hash_prevouts: Hash,
    pub hash_sequence: Hash,
    pub hash_outputs: Hash,
}

impl TransactionHashes {
    pub fn new(tx: &TransferTransaction) -> Self {
        let mut prevouts = sha256d::Hash::engine();
        let mut sequence = sha256d::Hash::engine();
        for input in &tx.inputs {
            prevouts.input(&input.outpoint.previous_tx.0);
            prevouts.input(&(input.outpoint.index as u32).to_le_bytes());
            sequence.input(&input.sequence.to_le_bytes());
        }

        let mut outputs = sha256d::Hash::engine();
        for output in &tx.outputs {
            outputs.input(&(output.value as u64).to_le_bytes());
            outputs.input(&encode_varint(output.script_pubkey.len() as u64));
            outputs.input(&output.script_pubkey);
        }

        TransactionHashes {
            hash_prevouts: sha256d::Hash::from_engine(prevouts).into_inner(),
            hash_sequence: sha256d::Hash::from_engine(sequence).into_inner(),
            hash_outputs: sha256d::Hash::from_engine(outputs).into_inner(),
        }
    }
}

/// Signing digest for input `input_index` spending `amount` under `script_code`.
pub fn calc_witness_signature_hash(
    hashes: &TransactionHashes,
    version: u8,
    tx: &TransferTransaction,
    script_code: &[u8],
    input_index: usize,
    amount: u64,
) -> Result<Hash> {
    let input = tx.inputs.get(input_index).ok_or_else(|| {
        LedgerError::TransactionValidation(format!(
            "input index {} out of range for {} inputs",
            input_index,
            tx.inputs.len()
        ))
    })?;

    let mut engine = sha256d::Hash::engine();
    engine.input(&(version as u32).to_le_bytes());
    engine.input(&hashes.hash_prevouts);
    engine.input(&hashes.hash_sequence);
    engine.input(&input.outpoint.previous_tx.0);
    engine.input(&(input.outpoint.index as u32).to_le_bytes());
    engine.input(&encode_varint(script_code.len() as u64));
    engine.input(script_code);
    engine.input(&amount.to_le_bytes());
    engine.input(&input.sequence.to_le_bytes());
    engine.input(&hashes.hash_outputs);
    engine.input(&tx.lock_time.to_le_bytes());
    engine.input(&SIGHASH_ALL.to_le_bytes());
    Ok(sha256d::Hash::from_engine(engine).into_inner())
}

/// Sighash source for one transfer; aggregates are computed on construction.
pub struct SigHasher<'a> {
    version: u8,
    tx: &'a TransferTransaction,
    hashes: TransactionHashes,
}

impl<'a> SigHasher<'a> {
    pub fn new(tx: &'a Transaction) -> Result<Self> {
        match &tx.body {
            TransactionBody::Transfer(transfer) => Ok(SigHasher {
                version: tx.version,
                tx: transfer,
                hashes: TransactionHashes::new(transfer),
            }),
            _ => Err(LedgerError::TransactionValidation(format!(
                "{:?} transactions carry no signatures",
                tx.tx_type()
            ))),
        }
    }

    pub fn hashes(&self) -> &TransactionHashes {
        &self.hashes
    }
}

impl SigHashable for SigHasher<'_> {
    fn sig_hash(&self, script_code: &[u8], input_index: usize, amount: u64) -> Result<Hash> {
        calc_witness_signature_hash(
            &self.hashes,
            self.version,
            self.tx,
            script_code,
            input_index,
            amount,
        )
    }
}

impl SigHashable for Transaction {
    fn sig_hash(&self, script_code: &[u8], input_index: usize, amount: u64) -> Result<Hash> {
        SigHasher::new(self)?.sig_hash(script_code, input_index, amount)
    }
}

/// Script code committed to when spending `script_pubkey`
pub fn script_code_for(script_pubkey: &[u8]) -> Result<Vec<u8>> {
    let program = Script::parse(script_pubkey)?.witness_program()?;
    Ok(Script::p2wpkh_script_code(&program).marshal())
}

impl Transaction {
    /// Sign every input with `key`, replacing the witnesses.
    ///
    /// `prev_outputs[i]` is the output spent by input `i`; its value and
    /// locking script enter the digest.
    pub fn generate_witnesses(
        &mut self,
        key: &SecretKey,
        prev_outputs: &[TransactionOutput],
    ) -> Result<()> {
        if prev_outputs.len() != self.inputs().len() {
            return Err(LedgerError::TransactionValidation(format!(
                "{} previous outputs for {} inputs",
                prev_outputs.len(),
                self.inputs().len()
            )));
        }

        let secp = Secp256k1::signing_only();
        let pubkey = PublicKey::from_secret_key(&secp, key).serialize().to_vec();
        let witnesses = {
            let hasher = SigHasher::new(self)?;
            let mut witnesses = Vec::with_capacity(prev_outputs.len());
            for (i, prev) in prev_outputs.iter().enumerate() {
                let code = script_code_for(&prev.script_pubkey)?;
                let digest = hasher.sig_hash(&code, i, prev.value as u64)?;
                let message = Message::from_digest_slice(&digest)
                    .map_err(|e| LedgerError::InvalidSignature(e.to_string()))?;
                let signature = secp.sign_ecdsa(&message, key).serialize_der().to_vec();
                witnesses.push(TransactionWitness::new(vec![signature, pubkey.clone()]));
            }
            witnesses
        };

        if let TransactionBody::Transfer(transfer) = &mut self.body {
            transfer.witnesses = witnesses;
        }
        Ok(())
    }
}

/// Public-key hash a secret key's P2WPKH outputs commit to
pub fn pubkey_hash(key: &PublicKey) -> [u8; 20] {
    hash160(&key.serialize())
}

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

/// Bitcoin compact-size encoding
fn encode_varint(value: u64) -> Vec<u8> {
    if value < 0xfd {
        vec![value as u8]
    } else if value <= 0xffff {
        let mut result = vec![0xfd];
        result.extend_from_slice(&(value as u16).to_le_bytes());
        result
    } else if value <= 0xffffffff {
        let mut result = vec![0xfe];
        result.extend_from_slice(&(value as u32).to_le_bytes());
        result
    } else {
        let mut result = vec![0xff];
        result.extend_from_slice(&value.to_le_bytes());
        result
    }
}
