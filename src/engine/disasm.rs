use alloy_primitives::{hex, U256};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use super::opcode::Opcode;
use crate::error::AnalysisError;

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Byte offset of the opcode inside the code.
    pub address: usize,
    pub opcode: Opcode,
    /// Immediate value of a `PUSHn`.
    pub argument: Option<U256>,
}

impl Instruction {
    pub fn new(address: usize, opcode: Opcode, argument: Option<U256>) -> Self {
        Instruction { address, opcode, argument }
    }

    /// Address of the instruction that follows this one in the code.
    pub fn next_address(&self) -> usize {
        self.address + 1 + self.opcode.push_size()
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.argument {
            Some(arg) => write!(f, "{} {} {:#x}", self.address, self.opcode, arg),
            None => write!(f, "{} {}", self.address, self.opcode),
        }
    }
}

/// Decoded code plus an address index.
#[derive(Debug, Clone, Default)]
pub struct Disassembly {
    pub bytecode: Vec<u8>,
    pub instructions: Vec<Instruction>,
    index: BTreeMap<usize, usize>,
    jump_destinations: HashSet<usize>,
}

impl Disassembly {
    pub fn new(bytecode: Vec<u8>) -> Self {
        let instructions = disassemble(&bytecode);
        let index = instructions
            .iter()
            .enumerate()
            .map(|(i, ins)| (ins.address, i))
            .collect();
        let jump_destinations = instructions
            .iter()
            .filter(|ins| ins.opcode == Opcode::JUMPDEST)
            .map(|ins| ins.address)
            .collect();
        Disassembly {
            bytecode,
            instructions,
            index,
            jump_destinations,
        }
    }

    pub fn instruction_at(&self, address: usize) -> Option<&Instruction> {
        self.index.get(&address).map(|&i| &self.instructions[i])
    }

    pub fn is_jump_destination(&self, address: usize) -> bool {
        self.jump_destinations.contains(&address)
    }
}

/// Decodes raw bytecode into instructions. Push data cut off by the end of the
/// code is zero-padded on the right.
pub fn disassemble(bytecode: &[u8]) -> Vec<Instruction> {
    let mut instructions = Vec::new();
    let mut address = 0;

    while address < bytecode.len() {
        let opcode = Opcode(bytecode[address]);
        let size = opcode.push_size();
        let argument = if opcode == Opcode::PUSH0 {
            Some(U256::ZERO)
        } else if size > 0 {
            let start = (address + 1).min(bytecode.len());
            let end = (address + 1 + size).min(bytecode.len());
            let mut word = [0u8; 32];
            let data = &bytecode[start..end];
            word[32 - size..32 - size + data.len()].copy_from_slice(data);
            Some(U256::from_be_bytes(word))
        } else {
            None
        };
        instructions.push(Instruction::new(address, opcode, argument));
        address += 1 + size;
    }

    instructions
}

/// Parses hex encoded bytecode, tolerating a `0x` prefix and surrounding whitespace.
pub fn parse_hex(text: &str) -> Result<Vec<u8>, AnalysisError> {
    let cleaned: String = text.split_whitespace().collect();
    let cleaned = cleaned.trim_start_matches("0x");
    if cleaned.is_empty() {
        return Err(AnalysisError::InvalidBytecode("empty bytecode".to_string()));
    }
    hex::decode(cleaned).map_err(|e| AnalysisError::InvalidBytecode(e.to_string()))
}
