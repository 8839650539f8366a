//! Error types for the ledger core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Encode failed: {0}")]
    Encode(String),

    #[error("Script parse failed: {0}")]
    ScriptParse(String),

    #[error("Script execution failed: {0}")]
    ScriptExecution(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Transaction validation failed: {0}")]
    TransactionValidation(String),

    #[error("Outpoint already spent in pending block: {0}")]
    DoubleSpend(String),

    #[error("Transaction already accepted: {0}")]
    DuplicateTransaction(String),

    #[error("Block size limit exceeded: {size} > {limit}")]
    BlockFull { size: usize, limit: usize },

    #[error("UTXO not found: {0}")]
    UtxoNotFound(String),

    #[error("Block validation failed: {0}")]
    BlockValidation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid address: {0}")]
    Address(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl LedgerError {
    /// True when the rejection is only about room in the pending block; the
    /// transaction may still fit into a later one.
    pub fn is_capacity(&self) -> bool {
        matches!(self, LedgerError::BlockFull { .. })
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
