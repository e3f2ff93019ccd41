use std::fmt;

/// A single EVM opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Opcode(pub u8);

impl Opcode {
    pub const STOP: Opcode = Opcode(0x00);
    pub const ADD: Opcode = Opcode(0x01);
    pub const SUB: Opcode = Opcode(0x03);
    pub const LT: Opcode = Opcode(0x10);
    pub const GT: Opcode = Opcode(0x11);
    pub const EQ: Opcode = Opcode(0x14);
    pub const ISZERO: Opcode = Opcode(0x15);
    pub const AND: Opcode = Opcode(0x16);
    pub const NOT: Opcode = Opcode(0x19);
    pub const BYTE: Opcode = Opcode(0x1a);
    pub const SHR: Opcode = Opcode(0x1c);
    pub const SHA3: Opcode = Opcode(0x20);
    pub const CALLER: Opcode = Opcode(0x33);
    pub const CALLDATALOAD: Opcode = Opcode(0x35);
    pub const CALLDATACOPY: Opcode = Opcode(0x37);
    pub const CODECOPY: Opcode = Opcode(0x39);
    pub const NUMBER: Opcode = Opcode(0x43);
    pub const POP: Opcode = Opcode(0x50);
    pub const MLOAD: Opcode = Opcode(0x51);
    pub const MSTORE: Opcode = Opcode(0x52);
    pub const MSTORE8: Opcode = Opcode(0x53);
    pub const SLOAD: Opcode = Opcode(0x54);
    pub const SSTORE: Opcode = Opcode(0x55);
    pub const JUMP: Opcode = Opcode(0x56);
    pub const JUMPI: Opcode = Opcode(0x57);
    pub const JUMPDEST: Opcode = Opcode(0x5b);
    pub const PUSH0: Opcode = Opcode(0x5f);
    pub const PUSH1: Opcode = Opcode(0x60);
    pub const PUSH2: Opcode = Opcode(0x61);
    pub const PUSH4: Opcode = Opcode(0x63);
    pub const PUSH32: Opcode = Opcode(0x7f);
    pub const DUP1: Opcode = Opcode(0x80);
    pub const SWAP1: Opcode = Opcode(0x90);
    pub const RETURN: Opcode = Opcode(0xf3);
    pub const REVERT: Opcode = Opcode(0xfd);
    pub const INVALID: Opcode = Opcode(0xfe);
    pub const SELFDESTRUCT: Opcode = Opcode(0xff);

    /// Mnemonic of the opcode, `"UNKNOWN"` for unassigned bytes.
    pub fn name(self) -> &'static str {
        const PUSH: [&str; 32] = [
            "PUSH1", "PUSH2", "PUSH3", "PUSH4", "PUSH5", "PUSH6", "PUSH7", "PUSH8",
            "PUSH9", "PUSH10", "PUSH11", "PUSH12", "PUSH13", "PUSH14", "PUSH15", "PUSH16",
            "PUSH17", "PUSH18", "PUSH19", "PUSH20", "PUSH21", "PUSH22", "PUSH23", "PUSH24",
            "PUSH25", "PUSH26", "PUSH27", "PUSH28", "PUSH29", "PUSH30", "PUSH31", "PUSH32",
        ];
        const DUP: [&str; 16] = [
            "DUP1", "DUP2", "DUP3", "DUP4", "DUP5", "DUP6", "DUP7", "DUP8",
            "DUP9", "DUP10", "DUP11", "DUP12", "DUP13", "DUP14", "DUP15", "DUP16",
        ];
        const SWAP: [&str; 16] = [
            "SWAP1", "SWAP2", "SWAP3", "SWAP4", "SWAP5", "SWAP6", "SWAP7", "SWAP8",
            "SWAP9", "SWAP10", "SWAP11", "SWAP12", "SWAP13", "SWAP14", "SWAP15", "SWAP16",
        ];
        const LOG: [&str; 5] = ["LOG0", "LOG1", "LOG2", "LOG3", "LOG4"];

        match self.0 {
            0x00 => "STOP",
            0x01 => "ADD",
            0x02 => "MUL",
            0x03 => "SUB",
            0x04 => "DIV",
            0x05 => "SDIV",
            0x06 => "MOD",
            0x07 => "SMOD",
            0x08 => "ADDMOD",
            0x09 => "MULMOD",
            0x0a => "EXP",
            0x0b => "SIGNEXTEND",
            0x10 => "LT",
            0x11 => "GT",
            0x12 => "SLT",
            0x13 => "SGT",
            0x14 => "EQ",
            0x15 => "ISZERO",
            0x16 => "AND",
            0x17 => "OR",
            0x18 => "XOR",
            0x19 => "NOT",
            0x1a => "BYTE",
            0x1b => "SHL",
            0x1c => "SHR",
            0x1d => "SAR",
            0x20 => "SHA3",
            0x30 => "ADDRESS",
            0x31 => "BALANCE",
            0x32 => "ORIGIN",
            0x33 => "CALLER",
            0x34 => "CALLVALUE",
            0x35 => "CALLDATALOAD",
            0x36 => "CALLDATASIZE",
            0x37 => "CALLDATACOPY",
            0x38 => "CODESIZE",
            0x39 => "CODECOPY",
            0x3a => "GASPRICE",
            0x3b => "EXTCODESIZE",
            0x3c => "EXTCODECOPY",
            0x3d => "RETURNDATASIZE",
            0x3e => "RETURNDATACOPY",
            0x3f => "EXTCODEHASH",
            0x40 => "BLOCKHASH",
            0x41 => "COINBASE",
            0x42 => "TIMESTAMP",
            0x43 => "NUMBER",
            0x44 => "PREVRANDAO",
            0x45 => "GASLIMIT",
            0x46 => "CHAINID",
            0x47 => "SELFBALANCE",
            0x48 => "BASEFEE",
            0x49 => "BLOBHASH",
            0x4a => "BLOBBASEFEE",
            0x50 => "POP",
            0x51 => "MLOAD",
            0x52 => "MSTORE",
            0x53 => "MSTORE8",
            0x54 => "SLOAD",
            0x55 => "SSTORE",
            0x56 => "JUMP",
            0x57 => "JUMPI",
            0x58 => "PC",
            0x59 => "MSIZE",
            0x5a => "GAS",
            0x5b => "JUMPDEST",
            0x5c => "TLOAD",
            0x5d => "TSTORE",
            0x5e => "MCOPY",
            0x5f => "PUSH0",
            b @ 0x60..=0x7f => PUSH[(b - 0x60) as usize],
            b @ 0x80..=0x8f => DUP[(b - 0x80) as usize],
            b @ 0x90..=0x9f => SWAP[(b - 0x90) as usize],
            b @ 0xa0..=0xa4 => LOG[(b - 0xa0) as usize],
            0xf0 => "CREATE",
            0xf1 => "CALL",
            0xf2 => "CALLCODE",
            0xf3 => "RETURN",
            0xf4 => "DELEGATECALL",
            0xf5 => "CREATE2",
            0xfa => "STATICCALL",
            0xfd => "REVERT",
            0xfe => "INVALID",
            0xff => "SELFDESTRUCT",
            _ => "UNKNOWN",
        }
    }

    /// Looks an opcode up by mnemonic. `KECCAK256` is accepted as an alias of `SHA3`.
    pub fn from_name(name: &str) -> Option<Opcode> {
        let name = name.trim().to_ascii_uppercase();
        if name == "KECCAK256" {
            return Some(Opcode::SHA3);
        }
        (0..=u8::MAX)
            .map(Opcode)
            .find(|op| op.is_defined() && op.name() == name)
    }

    pub fn is_defined(self) -> bool {
        self.name() != "UNKNOWN"
    }

    /// Number of immediate bytes following a `PUSHn`.
    pub fn push_size(self) -> usize {
        match self.0 {
            0x60..=0x7f => (self.0 - 0x5f) as usize,
            _ => 0,
        }
    }

    /// Items popped and pushed by the opcode.
    pub fn stack_io(self) -> (usize, usize) {
        match self.0 {
            0x00 | 0x5b | 0xfe => (0, 0),
            0x01..=0x07 | 0x0a | 0x0b | 0x10..=0x14 | 0x16..=0x18 | 0x1a..=0x1d | 0x20 => (2, 1),
            0x08 | 0x09 => (3, 1),
            0x15 | 0x19 => (1, 1),
            0x30 | 0x32..=0x34 | 0x36 | 0x38 | 0x3a | 0x3d => (0, 1),
            0x31 | 0x35 | 0x3b | 0x3f | 0x40 | 0x49 => (1, 1),
            0x37 | 0x39 | 0x3e | 0x5e => (3, 0),
            0x3c => (4, 0),
            0x41..=0x48 | 0x4a => (0, 1),
            0x50 | 0x56 => (1, 0),
            0x51 | 0x54 | 0x5c => (1, 1),
            0x52 | 0x53 | 0x55 | 0x57 | 0x5d => (2, 0),
            0x58..=0x5a | 0x5f..=0x7f => (0, 1),
            b @ 0x80..=0x8f => {
                let n = (b - 0x7f) as usize;
                (n, n + 1)
            }
            b @ 0x90..=0x9f => {
                let n = (b - 0x8f) as usize;
                (n + 1, n + 1)
            }
            b @ 0xa0..=0xa4 => ((b - 0xa0) as usize + 2, 0),
            0xf0 => (3, 1),
            0xf1 | 0xf2 => (7, 1),
            0xf3 | 0xfd => (2, 0),
            0xf4 | 0xfa => (6, 1),
            0xf5 => (4, 1),
            0xff => (1, 0),
            _ => (0, 0),
        }
    }

    /// Whether execution of the current path ends at this opcode.
    pub fn is_halting(self) -> bool {
        matches!(self.0, 0x00 | 0xf3 | 0xfd | 0xfe | 0xff) || !self.is_defined()
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
