//! Script parsing: opcode table, instructions and the standard output shape
//!
//! Only native pay-to-witness-public-key-hash spends are supported. A script is
//! a flat list of instructions; there is no conditional execution. Each opcode
//! has a fixed total length, so an instruction carries at most one immediate.

use std::fmt;

use crate::constants::PUBKEY_HASH_SIZE;
use crate::error::{LedgerError, Result};
use crate::interpreter::{self, VirtualMachine};

pub const OP_0: u8 = 0x00;
pub const OP_DATA_20: u8 = 0x14;
pub const OP_VERIFY: u8 = 0x69;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;

/// Handler run when an instruction executes
pub type OpcodeFn = fn(&mut VirtualMachine<'_>, &Instruction) -> Result<()>;

pub struct Opcode {
    pub code: u8,
    /// Bytes taken by the instruction, opcode included
    pub length: usize,
    pub name: &'static str,
    pub exec: OpcodeFn,
}

impl PartialEq for Opcode {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code
    }
}

impl Eq for Opcode {}

impl fmt::Debug for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

static OPCODES: [Opcode; 8] = [
    Opcode { code: OP_0, length: 1, name: "OP_0", exec: interpreter::op_false },
    Opcode { code: OP_DATA_20, length: 1 + PUBKEY_HASH_SIZE, name: "OP_DATA_20", exec: interpreter::op_push_data },
    Opcode { code: OP_VERIFY, length: 1, name: "OP_VERIFY", exec: interpreter::op_verify },
    Opcode { code: OP_DUP, length: 1, name: "OP_DUP", exec: interpreter::op_dup },
    Opcode { code: OP_EQUAL, length: 1, name: "OP_EQUAL", exec: interpreter::op_equal },
    Opcode { code: OP_EQUALVERIFY, length: 1, name: "OP_EQUALVERIFY", exec: interpreter::op_equal_verify },
    Opcode { code: OP_HASH160, length: 1, name: "OP_HASH160", exec: interpreter::op_hash160 },
    Opcode { code: OP_CHECKSIG, length: 1, name: "OP_CHECKSIG", exec: interpreter::op_checksig },
];

pub fn lookup_opcode(code: u8) -> Option<&'static Opcode> {
    OPCODES.iter().find(|op| op.code == code)
}

fn opcode(code: u8) -> &'static Opcode {
    match lookup_opcode(code) {
        Some(op) => op,
        None => unreachable!("opcode {:#04x} missing from table", code),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: &'static Opcode,
    pub immediate: Option<Vec<u8>>,
}

impl Instruction {
    pub fn new(code: u8) -> Self {
        Instruction {
            opcode: opcode(code),
            immediate: None,
        }
    }

    pub fn push_data(data: [u8; PUBKEY_HASH_SIZE]) -> Self {
        Instruction {
            opcode: opcode(OP_DATA_20),
            immediate: Some(data.to_vec()),
        }
    }

    pub fn code(&self) -> u8 {
        self.opcode.code
    }

    fn marshal_into(&self, out: &mut Vec<u8>) {
        out.push(self.opcode.code);
        if let Some(imm) = &self.immediate {
            out.extend_from_slice(imm);
        }
    }

    pub fn pretty_print(&self) -> String {
        match &self.immediate {
            Some(imm) => format!("{} 0x{}", self.opcode.name, hex::encode(imm)),
            None => self.opcode.name.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Script {
    instructions: Vec<Instruction>,
}

impl Script {
    pub fn new(instructions: Vec<Instruction>) -> Self {
        Script { instructions }
    }

    /// Parse raw bytes opcode by opcode.
    pub fn parse(buf: &[u8]) -> Result<Script> {
        let mut instructions = Vec::new();
        let mut pos = 0;
        while pos < buf.len() {
            let code = buf[pos];
            let op = lookup_opcode(code).ok_or_else(|| {
                LedgerError::ScriptParse(format!("unknown opcode {:#04x} at offset {}", code, pos))
            })?;
            if pos + op.length > buf.len() {
                return Err(LedgerError::ScriptParse(format!(
                    "{} at offset {} needs {} bytes, {} left",
                    op.name,
                    pos,
                    op.length,
                    buf.len() - pos
                )));
            }
            let immediate = (op.length > 1).then(|| buf[pos + 1..pos + op.length].to_vec());
            instructions.push(Instruction {
                opcode: op,
                immediate,
            });
            pos += op.length;
        }
        Ok(Script { instructions })
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.instructions.iter().map(|i| i.opcode.length).sum());
        for instruction in &self.instructions {
            instruction.marshal_into(&mut out);
        }
        out
    }

    pub fn pretty_print(&self) -> String {
        self.instructions
            .iter()
            .map(Instruction::pretty_print)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Succeeds iff the script is exactly `OP_0 OP_DATA_20 <hash>`.
    pub fn standard_output(&self) -> Result<()> {
        self.witness_program().map(|_| ())
    }

    /// The public-key hash committed to by a standard output
    pub fn witness_program(&self) -> Result<[u8; PUBKEY_HASH_SIZE]> {
        let [version, program] = self.instructions.as_slice() else {
            return Err(LedgerError::ScriptParse(format!(
                "standard output has 2 instructions, found {}",
                self.instructions.len()
            )));
        };
        if version.code() != OP_0 || version.immediate.is_some() {
            return Err(LedgerError::ScriptParse(
                "standard output must begin with OP_0".to_string(),
            ));
        }
        if program.code() != OP_DATA_20 {
            return Err(LedgerError::ScriptParse(
                "standard output must end with OP_DATA_20".to_string(),
            ));
        }
        program
            .immediate
            .as_deref()
            .and_then(|imm| <[u8; PUBKEY_HASH_SIZE]>::try_from(imm).ok())
            .ok_or_else(|| {
                LedgerError::ScriptParse("OP_DATA_20 immediate must be 20 bytes".to_string())
            })
    }

    /// Locking script paying to a public-key hash: `OP_0 <hash>`
    pub fn p2wpkh_output(pubkey_hash: &[u8; PUBKEY_HASH_SIZE]) -> Script {
        Script::new(vec![Instruction::new(OP_0), Instruction::push_data(*pubkey_hash)])
    }

    /// Script code executed for a P2WPKH spend and committed to by its sighash
    pub fn p2wpkh_script_code(pubkey_hash: &[u8; PUBKEY_HASH_SIZE]) -> Script {
        Script::new(vec![
            Instruction::new(OP_DUP),
            Instruction::new(OP_HASH160),
            Instruction::push_data(*pubkey_hash),
            Instruction::new(OP_EQUALVERIFY),
            Instruction::new(OP_CHECKSIG),
        ])
    }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pretty_print())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: [u8; 20] = [
        0xde, 0xad, 0xb3, 0x3f, 0xde, 0xad, 0xb3, 0x3f, 0xde, 0xad, 0xb3, 0x3f, 0xde, 0xad, 0xb3,
        0x3f, 0xde, 0xad, 0xb3, 0x3f,
    ];

    #[test]
    fn test_p2wpkh_output_is_standard() {
        assert!(Script::p2wpkh_output(&HASH).standard_output().is_ok());
    }

    #[test]
    fn test_p2wpkh_output_marshal() {
        assert_eq!(
            hex::encode(Script::p2wpkh_output(&HASH).marshal()),
            "0014deadb33fdeadb33fdeadb33fdeadb33fdeadb33f"
        );
    }

    #[test]
    fn test_parse_standard_output() {
        let buf = hex::decode("0014deadb33fdeadb33fdeadb33fdeadb33fdeadb33f").unwrap();
        let script = Script::parse(&buf).unwrap();
        assert_eq!(script.witness_program().unwrap(), HASH);
        assert_eq!(script.marshal(), buf);
    }

    #[test]
    fn test_parse_bad_opcode() {
        let buf = hex::decode("00ff").unwrap();
        assert!(matches!(Script::parse(&buf), Err(LedgerError::ScriptParse(_))));
    }

    #[test]
    fn test_parse_immediate_underrun() {
        let buf = hex::decode("0014deadb33fdeadb33fdeadb33fdeadb33fdeadb3").unwrap();
        assert!(Script::parse(&buf).is_err());
    }

    #[test]
    fn test_parse_empty() {
        let script = Script::parse(&[]).unwrap();
        assert!(script.is_empty());
        assert!(script.standard_output().is_err());
    }

    #[test]
    fn test_pretty_print() {
        assert_eq!(
            Script::p2wpkh_output(&HASH).pretty_print(),
            "OP_0 OP_DATA_20 0xdeadb33fdeadb33fdeadb33fdeadb33fdeadb33f"
        );
        assert_eq!(
            Script::p2wpkh_script_code(&HASH).to_string(),
            "OP_DUP OP_HASH160 OP_DATA_20 0xdeadb33fdeadb33fdeadb33fdeadb33fdeadb33f OP_EQUALVERIFY OP_CHECKSIG"
        );
    }

    #[test]
    fn test_script_code_bytes() {
        let code = Script::p2wpkh_script_code(&HASH).marshal();
        assert_eq!(code.len(), 25);
        assert_eq!(&code[..3], &[OP_DUP, OP_HASH160, OP_DATA_20]);
        assert_eq!(&code[23..], &[OP_EQUALVERIFY, OP_CHECKSIG]);
    }

    #[test]
    fn test_non_standard_shapes() {
        let code = Script::p2wpkh_script_code(&HASH);
        assert!(code.standard_output().is_err());

        let swapped = Script::new(vec![Instruction::push_data(HASH), Instruction::new(OP_0)]);
        assert!(swapped.standard_output().is_err());

        let dup = Script::new(vec![Instruction::new(OP_DUP), Instruction::push_data(HASH)]);
        assert!(dup.standard_output().is_err());
    }
}
