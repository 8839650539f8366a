//! Script execution: the byte-string stack, opcode handlers and `execute_verify`

use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, VerifyOnly};

use crate::constants::{MAX_STACK_SIZE, PUBKEY_HASH_SIZE};
use crate::error::{LedgerError, Result};
use crate::hashes::{hash160, Hash};
use crate::script::{Instruction, Script};
use crate::types::TransactionWitness;

/// Largest script number accepted when popping an integer
const MAX_SCRIPT_NUM_LEN: usize = 4;

/// Something that can produce the signing digest for one of its inputs.
pub trait SigHashable {
    fn sig_hash(&self, script_code: &[u8], input_index: usize, amount: u64) -> Result<Hash>;
}

/// Integer in script encoding: little-endian magnitude with the sign in the top bit
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ScriptNum(pub i64);

impl ScriptNum {
    pub fn to_bytes(self) -> Vec<u8> {
        if self.0 == 0 {
            return Vec::new();
        }
        let negative = self.0 < 0;
        let mut magnitude = self.0.unsigned_abs();
        let mut out = Vec::with_capacity(9);
        while magnitude > 0 {
            out.push((magnitude & 0xff) as u8);
            magnitude >>= 8;
        }
        // the sign needs its own byte if the top bit is taken
        let last = out.len() - 1;
        if out[last] & 0x80 != 0 {
            out.push(if negative { 0x80 } else { 0x00 });
        } else if negative {
            out[last] |= 0x80;
        }
        out
    }

    /// Decode a little-endian sign-magnitude number of at most `max_len`
    /// bytes. Anything wider than an `i64` is rejected whatever `max_len` says.
    pub fn from_bytes(data: &[u8], require_minimal: bool, max_len: usize) -> Result<Self> {
        let max_len = max_len.min(std::mem::size_of::<i64>());
        if data.len() > max_len {
            return Err(LedgerError::ScriptExecution(format!(
                "script number of {} bytes exceeds {}",
                data.len(),
                max_len
            )));
        }
        if data.is_empty() {
            return Ok(ScriptNum(0));
        }
        let last = data.len() - 1;
        if require_minimal
            && data[last] & 0x7f == 0
            && (data.len() == 1 || data[last - 1] & 0x80 == 0)
        {
            return Err(LedgerError::ScriptExecution(format!(
                "non-minimal script number {}",
                hex::encode(data)
            )));
        }
        let mut value: i64 = 0;
        for (i, byte) in data.iter().enumerate() {
            value |= (*byte as i64) << (8 * i);
        }
        if data[last] & 0x80 != 0 {
            value &= !(0x80i64 << (8 * last));
            value = -value;
        }
        Ok(ScriptNum(value))
    }
}

/// Truthiness of a stack element; negative zero is false
pub fn as_bool(data: &[u8]) -> bool {
    match data.iter().rposition(|b| *b != 0) {
        None => false,
        Some(i) => !(i == data.len() - 1 && data[i] == 0x80 && data[..i].iter().all(|b| *b == 0)),
    }
}

pub fn from_bool(value: bool) -> Vec<u8> {
    if value {
        vec![1]
    } else {
        Vec::new()
    }
}

/// Execution stack. Element 0 is the bottom; `peek_*` take a depth from the top.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptStack {
    data: Vec<Vec<u8>>,
}

impl ScriptStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn push_bytes(&mut self, value: Vec<u8>) -> Result<()> {
        if self.data.len() >= MAX_STACK_SIZE {
            return Err(LedgerError::ScriptExecution(format!(
                "stack overflow: {} elements",
                self.data.len() + 1
            )));
        }
        self.data.push(value);
        Ok(())
    }

    pub fn peek_bytes(&self, depth: usize) -> Result<&[u8]> {
        self.data
            .len()
            .checked_sub(depth + 1)
            .map(|idx| self.data[idx].as_slice())
            .ok_or_else(|| {
                LedgerError::ScriptExecution(format!(
                    "stack depth {} out of range for {} elements",
                    depth,
                    self.data.len()
                ))
            })
    }

    pub fn pop_bytes(&mut self) -> Result<Vec<u8>> {
        self.data
            .pop()
            .ok_or_else(|| LedgerError::ScriptExecution("stack underflow".to_string()))
    }

    pub fn push_int(&mut self, value: ScriptNum) -> Result<()> {
        self.push_bytes(value.to_bytes())
    }

    pub fn peek_int(&self, depth: usize) -> Result<ScriptNum> {
        ScriptNum::from_bytes(self.peek_bytes(depth)?, true, MAX_SCRIPT_NUM_LEN)
    }

    pub fn pop_int(&mut self) -> Result<ScriptNum> {
        ScriptNum::from_bytes(&self.pop_bytes()?, true, MAX_SCRIPT_NUM_LEN)
    }

    pub fn push_bool(&mut self, value: bool) -> Result<()> {
        self.push_bytes(from_bool(value))
    }

    pub fn peek_bool(&self, depth: usize) -> Result<bool> {
        Ok(as_bool(self.peek_bytes(depth)?))
    }

    pub fn pop_bool(&mut self) -> Result<bool> {
        Ok(as_bool(&self.pop_bytes()?))
    }
}

struct SignatureContext<'a> {
    tx: &'a dyn SigHashable,
    input_index: usize,
    amount: u64,
}

pub struct VirtualMachine<'a> {
    stack: ScriptStack,
    /// Bytes of the script currently executing; committed to by signatures
    script_code: Vec<u8>,
    context: Option<SignatureContext<'a>>,
    secp: Secp256k1<VerifyOnly>,
}

impl Default for VirtualMachine<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> VirtualMachine<'a> {
    pub fn new() -> Self {
        VirtualMachine {
            stack: ScriptStack::new(),
            script_code: Vec::new(),
            context: None,
            secp: Secp256k1::verification_only(),
        }
    }

    /// Bind OP_CHECKSIG to one input of `tx`.
    pub fn with_signature_context(
        mut self,
        tx: &'a dyn SigHashable,
        input_index: usize,
        amount: u64,
    ) -> Self {
        self.context = Some(SignatureContext {
            tx,
            input_index,
            amount,
        });
        self
    }

    pub fn stack(&self) -> &ScriptStack {
        &self.stack
    }

    pub fn stack_mut(&mut self) -> &mut ScriptStack {
        &mut self.stack
    }

    pub fn push_witness_data(&mut self, witness: &TransactionWitness) -> Result<()> {
        for item in &witness.data {
            self.stack.push_bytes(item.clone())?;
        }
        Ok(())
    }

    pub fn execute(&mut self, script: &Script) -> Result<()> {
        self.script_code = script.marshal();
        for instruction in script.instructions() {
            (instruction.opcode.exec)(self, instruction)?;
        }
        Ok(())
    }

    /// Pop the top element and fail unless it is truthy.
    pub fn verify(&mut self) -> Result<()> {
        if !self.stack.pop_bool()? {
            return Err(LedgerError::ScriptExecution(
                "OP_VERIFY failed; top stack element is not truthy".to_string(),
            ));
        }
        Ok(())
    }

    fn check_signature(&self, signature: &[u8], pubkey: &[u8]) -> Result<bool> {
        let context = self.context.as_ref().ok_or_else(|| {
            LedgerError::ScriptExecution("OP_CHECKSIG without a transaction to sign".to_string())
        })?;
        let (Ok(pubkey), Ok(signature)) =
            (PublicKey::from_slice(pubkey), Signature::from_der(signature))
        else {
            return Ok(false);
        };
        let digest = context
            .tx
            .sig_hash(&self.script_code, context.input_index, context.amount)?;
        let message = Message::from_digest_slice(&digest)
            .map_err(|e| LedgerError::InvalidSignature(e.to_string()))?;
        Ok(self.secp.verify_ecdsa(&message, &signature, &pubkey).is_ok())
    }
}

// ============================================================================
// OPCODE HANDLERS
// ============================================================================

pub fn op_false(vm: &mut VirtualMachine<'_>, _: &Instruction) -> Result<()> {
    vm.stack.push_int(ScriptNum(0))
}

pub fn op_push_data(vm: &mut VirtualMachine<'_>, ins: &Instruction) -> Result<()> {
    let data = ins.immediate.clone().ok_or_else(|| {
        LedgerError::ScriptExecution(format!("{} without immediate", ins.opcode.name))
    })?;
    vm.stack.push_bytes(data)
}

pub fn op_verify(vm: &mut VirtualMachine<'_>, _: &Instruction) -> Result<()> {
    vm.verify()
}

pub fn op_dup(vm: &mut VirtualMachine<'_>, _: &Instruction) -> Result<()> {
    let top = vm.stack.peek_bytes(0)?.to_vec();
    vm.stack.push_bytes(top)
}

pub fn op_equal(vm: &mut VirtualMachine<'_>, _: &Instruction) -> Result<()> {
    let a = vm.stack.pop_bytes()?;
    let b = vm.stack.pop_bytes()?;
    vm.stack.push_bool(a == b)
}

pub fn op_equal_verify(vm: &mut VirtualMachine<'_>, ins: &Instruction) -> Result<()> {
    op_equal(vm, ins)?;
    vm.verify()
}

pub fn op_hash160(vm: &mut VirtualMachine<'_>, _: &Instruction) -> Result<()> {
    let data = vm.stack.pop_bytes()?;
    vm.stack.push_bytes(hash160(&data).to_vec())
}

pub fn op_checksig(vm: &mut VirtualMachine<'_>, _: &Instruction) -> Result<()> {
    let pubkey = vm.stack.pop_bytes()?;
    let signature = vm.stack.pop_bytes()?;
    let valid = vm.check_signature(&signature, &pubkey)?;
    vm.stack.push_bool(valid)
}

/// Verify that `witness` authorizes spending an output locked by `locking`.
///
/// The locking script must be a standard P2WPKH output. The witness carries
/// `[signature, public_key]`. The unlocking script runs first, then the locking
/// script, whose witness program is popped and expanded into the script code
/// `OP_DUP OP_HASH160 <hash> OP_EQUALVERIFY OP_CHECKSIG`. That script code runs
/// with OP_CHECKSIG bound to `(tx, input_index, amount)` and must leave exactly
/// one truthy element.
pub fn execute_verify(
    locking: &Script,
    unlocking: &Script,
    witness: &TransactionWitness,
    tx: &dyn SigHashable,
    input_index: usize,
    amount: u64,
) -> Result<()> {
    locking.standard_output()?;
    if witness.data.len() != 2 {
        return Err(LedgerError::ScriptExecution(format!(
            "P2WPKH witness needs 2 items, found {}",
            witness.data.len()
        )));
    }

    let mut vm = VirtualMachine::new().with_signature_context(tx, input_index, amount);
    vm.push_witness_data(witness)?;
    vm.execute(unlocking)?;
    vm.execute(locking)?;

    let program = vm.stack.pop_bytes()?;
    let version = vm.stack.pop_int()?;
    if version != ScriptNum(0) {
        return Err(LedgerError::ScriptExecution(format!(
            "unsupported witness version {}",
            version.0
        )));
    }
    let pubkey_hash: [u8; PUBKEY_HASH_SIZE] = program.as_slice().try_into().map_err(|_| {
        LedgerError::ScriptExecution(format!("witness program of {} bytes", program.len()))
    })?;

    vm.execute(&Script::p2wpkh_script_code(&pubkey_hash))?;

    if vm.stack.size() != 1 {
        return Err(LedgerError::ScriptExecution(format!(
            "expected 1 stack element after execution, found {}",
            vm.stack.size()
        )));
    }
    if !vm.stack.pop_bool()? {
        return Err(LedgerError::InvalidSignature(format!(
            "signature for input {} does not verify",
            input_index
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{OP_DUP, OP_EQUAL, OP_EQUALVERIFY, OP_HASH160, OP_VERIFY};
    use secp256k1::SecretKey;

    struct FixedDigest(Hash);

    impl SigHashable for FixedDigest {
        fn sig_hash(&self, script_code: &[u8], input_index: usize, amount: u64) -> Result<Hash> {
            let mut digest = self.0;
            digest[0] ^= script_code.len() as u8;
            digest[1] ^= input_index as u8;
            digest[2] ^= amount as u8;
            Ok(digest)
        }
    }

    fn signed_witness(
        key: &SecretKey,
        tx: &dyn SigHashable,
        input_index: usize,
        amount: u64,
    ) -> (TransactionWitness, [u8; 20]) {
        let secp = Secp256k1::new();
        let pubkey = PublicKey::from_secret_key(&secp, key);
        let pubkey_hash = hash160(&pubkey.serialize());
        let code = Script::p2wpkh_script_code(&pubkey_hash).marshal();
        let digest = tx.sig_hash(&code, input_index, amount).unwrap();
        let message = Message::from_digest_slice(&digest).unwrap();
        let signature = secp.sign_ecdsa(&message, key).serialize_der().to_vec();
        (
            TransactionWitness::new(vec![signature, pubkey.serialize().to_vec()]),
            pubkey_hash,
        )
    }

    #[test]
    fn test_script_num_encoding() {
        assert_eq!(ScriptNum(0).to_bytes(), Vec::<u8>::new());
        assert_eq!(ScriptNum(1).to_bytes(), vec![0x01]);
        assert_eq!(ScriptNum(-1).to_bytes(), vec![0x81]);
        assert_eq!(ScriptNum(127).to_bytes(), vec![0x7f]);
        assert_eq!(ScriptNum(128).to_bytes(), vec![0x80, 0x00]);
        assert_eq!(ScriptNum(-128).to_bytes(), vec![0x80, 0x80]);
        assert_eq!(ScriptNum(256).to_bytes(), vec![0x00, 0x01]);

        for n in [0i64, 1, -1, 127, 128, -128, 255, 256, -32768, 0x7fffffff] {
            let bytes = ScriptNum(n).to_bytes();
            assert_eq!(ScriptNum::from_bytes(&bytes, true, 5).unwrap(), ScriptNum(n));
        }
    }

    #[test]
    fn test_script_num_rejects_non_minimal() {
        assert!(ScriptNum::from_bytes(&[0x00], true, 4).is_err());
        assert!(ScriptNum::from_bytes(&[0x01, 0x00], true, 4).is_err());
        assert!(ScriptNum::from_bytes(&[0x80, 0x00], true, 4).is_ok());
        assert!(ScriptNum::from_bytes(&[0x01, 0x00], false, 4).is_ok());
        assert!(ScriptNum::from_bytes(&[1, 1, 1, 1, 1], true, 4).is_err());
    }

    #[test]
    fn test_script_num_wider_than_i64() {
        assert_eq!(
            ScriptNum::from_bytes(&[0, 0, 0, 0, 0, 0, 0, 0x01], true, 16).unwrap(),
            ScriptNum(1 << 56)
        );
        assert!(ScriptNum::from_bytes(&[1; 9], false, 16).is_err());
        assert!(ScriptNum::from_bytes(&[1; 32], false, usize::MAX).is_err());
    }

    #[test]
    fn test_as_bool() {
        assert!(!as_bool(&[]));
        assert!(!as_bool(&[0x00, 0x00]));
        assert!(!as_bool(&[0x00, 0x80]));
        assert!(as_bool(&[0x01]));
        assert!(as_bool(&[0x80, 0x00]));
        assert!(as_bool(&[0x00, 0x81]));
    }

    #[test]
    fn test_stack_operations() {
        let mut stack = ScriptStack::new();
        stack.push_bytes(vec![1, 2]).unwrap();
        stack.push_bool(true).unwrap();
        stack.push_int(ScriptNum(-5)).unwrap();

        assert_eq!(stack.size(), 3);
        assert_eq!(stack.peek_int(0).unwrap(), ScriptNum(-5));
        assert!(stack.peek_bool(1).unwrap());
        assert_eq!(stack.peek_bytes(2).unwrap(), &[1, 2]);
        assert!(stack.peek_bytes(3).is_err());

        assert_eq!(stack.pop_int().unwrap(), ScriptNum(-5));
        assert!(stack.pop_bool().unwrap());
        assert_eq!(stack.pop_bytes().unwrap(), vec![1, 2]);
        assert!(stack.pop_bytes().is_err());
    }

    #[test]
    fn test_stack_overflow() {
        let mut stack = ScriptStack::new();
        for _ in 0..MAX_STACK_SIZE {
            stack.push_bytes(vec![]).unwrap();
        }
        assert!(stack.push_bytes(vec![]).is_err());
    }

    #[test]
    fn test_dup_hash160_equalverify() {
        let mut vm = VirtualMachine::new();
        vm.stack_mut().push_bytes(b"key".to_vec()).unwrap();
        let script = Script::new(vec![
            Instruction::new(OP_DUP),
            Instruction::new(OP_HASH160),
            Instruction::push_data(hash160(b"key")),
            Instruction::new(OP_EQUALVERIFY),
        ]);
        vm.execute(&script).unwrap();
        assert_eq!(vm.stack().size(), 1);
        assert_eq!(vm.stack().peek_bytes(0).unwrap(), b"key");
    }

    #[test]
    fn test_equalverify_mismatch_fails() {
        let mut vm = VirtualMachine::new();
        vm.stack_mut().push_bytes(b"key".to_vec()).unwrap();
        let script = Script::new(vec![
            Instruction::new(OP_HASH160),
            Instruction::push_data([0u8; 20]),
            Instruction::new(OP_EQUALVERIFY),
        ]);
        assert!(vm.execute(&script).is_err());
    }

    #[test]
    fn test_equal_then_verify() {
        let mut vm = VirtualMachine::new();
        vm.stack_mut().push_bytes(vec![7]).unwrap();
        vm.stack_mut().push_bytes(vec![7]).unwrap();
        let script = Script::new(vec![Instruction::new(OP_EQUAL), Instruction::new(OP_VERIFY)]);
        vm.execute(&script).unwrap();
        assert!(vm.stack().is_empty());
    }

    #[test]
    fn test_underflow_is_error() {
        let mut vm = VirtualMachine::new();
        assert!(vm.execute(&Script::new(vec![Instruction::new(OP_DUP)])).is_err());
    }

    #[test]
    fn test_checksig_requires_context() {
        let mut vm = VirtualMachine::new();
        vm.stack_mut().push_bytes(vec![1]).unwrap();
        vm.stack_mut().push_bytes(vec![2]).unwrap();
        let script = Script::new(vec![Instruction::new(crate::script::OP_CHECKSIG)]);
        assert!(vm.execute(&script).is_err());
    }

    #[test]
    fn test_execute_verify_accepts_valid_spend() {
        let key = SecretKey::from_slice(&[1u8; 32]).unwrap();
        let tx = FixedDigest([9u8; 32]);
        let (witness, pubkey_hash) = signed_witness(&key, &tx, 0, 1000);
        let locking = Script::p2wpkh_output(&pubkey_hash);
        execute_verify(&locking, &Script::default(), &witness, &tx, 0, 1000).unwrap();
    }

    #[test]
    fn test_execute_verify_rejects_wrong_context() {
        let key = SecretKey::from_slice(&[1u8; 32]).unwrap();
        let tx = FixedDigest([9u8; 32]);
        let (witness, pubkey_hash) = signed_witness(&key, &tx, 0, 1000);
        let locking = Script::p2wpkh_output(&pubkey_hash);

        let wrong_index = execute_verify(&locking, &Script::default(), &witness, &tx, 1, 1000);
        assert!(matches!(wrong_index, Err(LedgerError::InvalidSignature(_))));

        let wrong_amount = execute_verify(&locking, &Script::default(), &witness, &tx, 0, 999);
        assert!(matches!(wrong_amount, Err(LedgerError::InvalidSignature(_))));
    }

    #[test]
    fn test_execute_verify_rejects_other_key() {
        let key = SecretKey::from_slice(&[1u8; 32]).unwrap();
        let other = SecretKey::from_slice(&[2u8; 32]).unwrap();
        let tx = FixedDigest([9u8; 32]);
        let (_, pubkey_hash) = signed_witness(&key, &tx, 0, 1000);
        let (other_witness, _) = signed_witness(&other, &tx, 0, 1000);
        let locking = Script::p2wpkh_output(&pubkey_hash);

        // the other key's hash does not match the locking program
        let result = execute_verify(&locking, &Script::default(), &other_witness, &tx, 0, 1000);
        assert!(matches!(result, Err(LedgerError::ScriptExecution(_))));
    }

    #[test]
    fn test_execute_verify_rejects_malformed_witness() {
        let key = SecretKey::from_slice(&[1u8; 32]).unwrap();
        let tx = FixedDigest([9u8; 32]);
        let (mut witness, pubkey_hash) = signed_witness(&key, &tx, 0, 1000);
        let locking = Script::p2wpkh_output(&pubkey_hash);

        witness.data[0] = vec![0x30, 0x01];
        let result = execute_verify(&locking, &Script::default(), &witness, &tx, 0, 1000);
        assert!(matches!(result, Err(LedgerError::InvalidSignature(_))));

        witness.data.pop();
        assert!(execute_verify(&locking, &Script::default(), &witness, &tx, 0, 1000).is_err());
    }

    #[test]
    fn test_execute_verify_requires_standard_lock() {
        let key = SecretKey::from_slice(&[1u8; 32]).unwrap();
        let tx = FixedDigest([9u8; 32]);
        let (witness, pubkey_hash) = signed_witness(&key, &tx, 0, 1000);
        let locking = Script::p2wpkh_script_code(&pubkey_hash);
        let result = execute_verify(&locking, &Script::default(), &witness, &tx, 0, 1000);
        assert!(matches!(result, Err(LedgerError::ScriptParse(_))));
    }
}
