//! Transaction wire format and structural checks
//!
//! Layout: `version:u8 | type:u8 | flags:u16 LE | body`, where the body is
//! selected by the type tag. The transaction ID is the sha256d of exactly these
//! bytes, so encoding must be deterministic.

use std::collections::HashSet;

use crate::codec::{uvarint_size, Codec, Reader, Writer};
use crate::constants::*;
use crate::error::{LedgerError, Result};
use crate::hashes::sha256d;
use crate::script::Script;
use crate::types::*;

impl Codec for TransactionInput {
    fn size(&self) -> usize {
        TRANSACTION_ID_SIZE
            + 1
            + uvarint_size(self.script_sig.len() as u64)
            + self.script_sig.len()
            + 4
    }

    fn encode(&self, w: &mut Writer<'_>) -> Result<()> {
        w.put_bytes(&self.outpoint.previous_tx.0)?;
        w.put_u8(self.outpoint.index)?;
        w.put_var_bytes(&self.script_sig, MAX_FIELDLEN, "script_sig")?;
        w.put_u32_le(self.sequence)
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let previous_tx = TxId(r.get_array("outpoint txid")?);
        let index = r.get_u8("outpoint index")?;
        let script_sig = r.get_var_bytes(MAX_FIELDLEN, "script_sig")?;
        let sequence = r.get_u32_le("sequence")?;
        Ok(TransactionInput {
            outpoint: Outpoint::new(previous_tx, index),
            script_sig,
            sequence,
        })
    }
}

impl Codec for TransactionOutput {
    fn size(&self) -> usize {
        4 + uvarint_size(self.script_pubkey.len() as u64) + self.script_pubkey.len()
    }

    fn encode(&self, w: &mut Writer<'_>) -> Result<()> {
        w.put_u32_le(self.value)?;
        w.put_var_bytes(&self.script_pubkey, MAX_FIELDLEN, "script_pubkey")
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let value = r.get_u32_le("output value")?;
        let script_pubkey = r.get_var_bytes(MAX_FIELDLEN, "script_pubkey")?;
        Ok(TransactionOutput {
            value,
            script_pubkey,
        })
    }
}

impl Codec for TransactionWitness {
    fn size(&self) -> usize {
        uvarint_size(self.data.len() as u64)
            + self
                .data
                .iter()
                .map(|item| uvarint_size(item.len() as u64) + item.len())
                .sum::<usize>()
    }

    fn encode(&self, w: &mut Writer<'_>) -> Result<()> {
        w.put_count(self.data.len(), MAX_WITNESS_ITEMS, "witness items")?;
        for item in &self.data {
            w.put_var_bytes(item, MAX_FIELDLEN, "witness item")?;
        }
        Ok(())
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let count = r.get_count(MAX_WITNESS_ITEMS, "witness items")?;
        let mut data = Vec::with_capacity(count.min(r.remaining()));
        for _ in 0..count {
            data.push(r.get_var_bytes(MAX_FIELDLEN, "witness item")?);
        }
        Ok(TransactionWitness { data })
    }
}

fn list_size<T: Codec>(items: &[T]) -> usize {
    uvarint_size(items.len() as u64) + items.iter().map(Codec::size).sum::<usize>()
}

fn encode_list<T: Codec>(w: &mut Writer<'_>, items: &[T], max: usize, what: &str) -> Result<()> {
    w.put_count(items.len(), max, what)?;
    for item in items {
        item.encode(w)?;
    }
    Ok(())
}

fn decode_list<T: Codec>(r: &mut Reader<'_>, max: usize, what: &str) -> Result<Vec<T>> {
    let count = r.get_count(max, what)?;
    decode_n(r, count)
}

fn decode_n<T: Codec>(r: &mut Reader<'_>, count: usize) -> Result<Vec<T>> {
    // every item takes at least one byte, so the remaining input bounds the allocation
    let mut items = Vec::with_capacity(count.min(r.remaining()));
    for _ in 0..count {
        items.push(T::decode(r)?);
    }
    Ok(items)
}

impl TransferTransaction {
    fn body_size(&self) -> usize {
        list_size(&self.inputs)
            + list_size(&self.outputs)
            + self.witnesses.iter().map(Codec::size).sum::<usize>()
            + 4
    }

    fn encode_body(&self, w: &mut Writer<'_>) -> Result<()> {
        if self.witnesses.len() != self.inputs.len() {
            return Err(LedgerError::Encode(format!(
                "{} witnesses for {} inputs",
                self.witnesses.len(),
                self.inputs.len()
            )));
        }
        encode_list(w, &self.inputs, MAX_INPUTS, "inputs")?;
        encode_list(w, &self.outputs, MAX_OUTPUTS, "outputs")?;
        for witness in &self.witnesses {
            witness.encode(w)?;
        }
        w.put_u32_le(self.lock_time)
    }

    fn decode_body(r: &mut Reader<'_>) -> Result<Self> {
        let inputs: Vec<TransactionInput> = decode_list(r, MAX_INPUTS, "inputs")?;
        let outputs = decode_list(r, MAX_OUTPUTS, "outputs")?;
        let witnesses = decode_n(r, inputs.len())?;
        let lock_time = r.get_u32_le("lock_time")?;
        Ok(TransferTransaction {
            inputs,
            outputs,
            witnesses,
            lock_time,
        })
    }
}

impl Codec for Transaction {
    fn size(&self) -> usize {
        let body = match &self.body {
            TransactionBody::Transfer(transfer) => transfer.body_size(),
            TransactionBody::Genesis(genesis) => list_size(&genesis.outputs),
            TransactionBody::EscrowOpen(_) => 0,
        };
        1 + 1 + 2 + body
    }

    /// `version:u8 | type:u8 | flags:u16 LE | body`. A transfer body is
    /// `uvarint nin | inputs | uvarint nout | outputs | nin witnesses |
    /// lock_time:u32 LE`; a genesis body is `uvarint nout | outputs`; an escrow
    /// open body is empty.
    ///
    /// The trailing lock time is part of the transaction ID and the sighash.
    /// Encoders that leave it out produce different bytes and different IDs
    /// for the same transfer.
    fn encode(&self, w: &mut Writer<'_>) -> Result<()> {
        if self.version != TX_VERSION {
            return Err(LedgerError::Encode(format!(
                "unsupported transaction version {}",
                self.version
            )));
        }
        if self.flags != 0 {
            return Err(LedgerError::Encode(format!(
                "reserved flags set: {:#06x}",
                self.flags
            )));
        }
        w.put_u8(self.version)?;
        w.put_u8(self.tx_type() as u8)?;
        w.put_u16_le(self.flags)?;
        match &self.body {
            TransactionBody::Transfer(transfer) => transfer.encode_body(w),
            TransactionBody::Genesis(genesis) => {
                encode_list(w, &genesis.outputs, MAX_OUTPUTS, "outputs")
            }
            TransactionBody::EscrowOpen(_) => Ok(()),
        }
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let version = r.get_u8("version")?;
        if version != TX_VERSION {
            return Err(LedgerError::Decode(format!(
                "unsupported transaction version {}",
                version
            )));
        }
        let tag = r.get_u8("transaction type")?;
        let tx_type = TxType::from_u8(tag)
            .ok_or_else(|| LedgerError::Decode(format!("unknown transaction type {:#04x}", tag)))?;
        let flags = r.get_u16_le("flags")?;
        if flags != 0 {
            return Err(LedgerError::Decode(format!(
                "reserved flags set: {:#06x}",
                flags
            )));
        }
        let body = match tx_type {
            TxType::Transfer => TransactionBody::Transfer(TransferTransaction::decode_body(r)?),
            TxType::Genesis => TransactionBody::Genesis(GenesisTransaction {
                outputs: decode_list(r, MAX_OUTPUTS, "outputs")?,
            }),
            TxType::EscrowOpen => TransactionBody::EscrowOpen(EscrowOpenTransaction {}),
        };
        Ok(Transaction {
            version,
            flags,
            body,
        })
    }
}

impl Transaction {
    pub fn new(body: TransactionBody) -> Self {
        Transaction {
            version: TX_VERSION,
            flags: 0,
            body,
        }
    }

    /// Unsigned transfer with one empty witness per input.
    pub fn new_transfer(
        inputs: Vec<TransactionInput>,
        outputs: Vec<TransactionOutput>,
        lock_time: u32,
    ) -> Self {
        let witnesses = vec![TransactionWitness::default(); inputs.len()];
        Transaction::new(TransactionBody::Transfer(TransferTransaction {
            inputs,
            outputs,
            witnesses,
            lock_time,
        }))
    }

    pub fn new_genesis(outputs: Vec<TransactionOutput>) -> Self {
        Transaction::new(TransactionBody::Genesis(GenesisTransaction { outputs }))
    }

    pub fn tx_type(&self) -> TxType {
        self.body.tx_type()
    }

    pub fn is_genesis(&self) -> bool {
        matches!(self.body, TransactionBody::Genesis(_))
    }

    pub fn txid(&self) -> Result<TxId> {
        Ok(TxId(sha256d(&self.marshal()?)))
    }

    pub fn inputs(&self) -> &[TransactionInput] {
        match &self.body {
            TransactionBody::Transfer(transfer) => &transfer.inputs,
            _ => &[],
        }
    }

    pub fn outputs(&self) -> &[TransactionOutput] {
        match &self.body {
            TransactionBody::Transfer(transfer) => &transfer.outputs,
            TransactionBody::Genesis(genesis) => &genesis.outputs,
            TransactionBody::EscrowOpen(_) => &[],
        }
    }

    pub fn witnesses(&self) -> &[TransactionWitness] {
        match &self.body {
            TransactionBody::Transfer(transfer) => &transfer.witnesses,
            _ => &[],
        }
    }

    /// Outpoints this transaction consumes
    pub fn inpoints(&self) -> Vec<Outpoint> {
        self.inputs().iter().map(|input| input.outpoint).collect()
    }

    /// Outpoints this transaction creates, paired with their outputs
    pub fn outpoints(&self) -> Result<Vec<(Outpoint, &TransactionOutput)>> {
        let outputs = self.outputs();
        if outputs.len() > MAX_ADDRESSABLE_OUTPUTS {
            return Err(LedgerError::TransactionValidation(format!(
                "{} outputs cannot be addressed by a u8 index",
                outputs.len()
            )));
        }
        let txid = self.txid()?;
        Ok(outputs
            .iter()
            .enumerate()
            .map(|(i, output)| (Outpoint::new(txid, i as u8), output))
            .collect())
    }

    /// Structural rules independent of chain state.
    pub fn well_formed(&self) -> ValidationResult {
        if self.version != TX_VERSION {
            return ValidationResult::Invalid(format!("Unsupported version {}", self.version));
        }
        if self.flags != 0 {
            return ValidationResult::Invalid(format!("Reserved flags set: {}", self.flags));
        }
        match &self.body {
            TransactionBody::Transfer(transfer) => {
                if transfer.inputs.is_empty() || transfer.outputs.is_empty() {
                    return ValidationResult::Invalid("Empty inputs or outputs".to_string());
                }
                if transfer.witnesses.len() != transfer.inputs.len() {
                    return ValidationResult::Invalid(format!(
                        "{} witnesses for {} inputs",
                        transfer.witnesses.len(),
                        transfer.inputs.len()
                    ));
                }
                let mut seen = HashSet::with_capacity(transfer.inputs.len());
                for input in &transfer.inputs {
                    if !seen.insert(input.outpoint.key()) {
                        return ValidationResult::Invalid(format!(
                            "Duplicate inpoint {}",
                            input.outpoint
                        ));
                    }
                }
            }
            TransactionBody::Genesis(genesis) => {
                if genesis.outputs.is_empty() {
                    return ValidationResult::Invalid("Genesis without outputs".to_string());
                }
            }
            TransactionBody::EscrowOpen(_) => {}
        }
        if self.outputs().len() > MAX_ADDRESSABLE_OUTPUTS {
            return ValidationResult::Invalid(format!(
                "Too many outputs: {}",
                self.outputs().len()
            ));
        }
        ValidationResult::Valid
    }

    /// Every output pays to a witness key hash and every script_sig parses.
    pub fn standard(&self) -> ValidationResult {
        for (i, output) in self.outputs().iter().enumerate() {
            let standard = Script::parse(&output.script_pubkey)
                .and_then(|script| script.standard_output());
            if let Err(e) = standard {
                return ValidationResult::Invalid(format!("Non-standard output {}: {}", i, e));
            }
        }
        for (i, input) in self.inputs().iter().enumerate() {
            if let Err(e) = Script::parse(&input.script_sig) {
                return ValidationResult::Invalid(format!("Unparseable script_sig {}: {}", i, e));
            }
        }
        ValidationResult::Valid
    }

    /// Sum of output values, widened so it cannot overflow
    pub fn output_value(&self) -> u64 {
        self.outputs().iter().map(|o| o.value as u64).sum()
    }
}
