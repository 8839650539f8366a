//! Digest helpers: double-SHA256 for identifiers and HASH160 for key hashes

use bitcoin_hashes::{sha256d, Hash as BitcoinHash, HashEngine};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

use crate::constants::PUBKEY_HASH_SIZE;

/// 256-bit digest
pub type Hash = [u8; 32];

/// SHA256(SHA256(data))
pub fn sha256d(data: &[u8]) -> Hash {
    sha256d::Hash::hash(data).into_inner()
}

/// SHA256d over the concatenation of `parts`, without building the buffer
pub fn sha256d_concat(parts: &[&[u8]]) -> Hash {
    let mut engine = sha256d::Hash::engine();
    for part in parts {
        engine.input(part);
    }
    sha256d::Hash::from_engine(engine).into_inner()
}

/// RIPEMD160(SHA256(data))
pub fn hash160(data: &[u8]) -> [u8; PUBKEY_HASH_SIZE] {
    let sha = Sha256::digest(data);
    let digest = Ripemd160::digest(sha);
    let mut out = [0u8; PUBKEY_HASH_SIZE];
    out.copy_from_slice(&digest);
    out
}
