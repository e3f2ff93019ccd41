use alloy_primitives::{Address, U256};
use std::collections::HashMap;

use crate::analysis::SymbolicAnalysis;
use crate::analyzers::{Detector, DetectorRegistry, Finding, Strategy};
use crate::config::{AnalysisConfig, Target};
use crate::engine::Opcode;

/// Minimal assembler for hand-written test programs. Labels mark `JUMPDEST`s
/// and are referenced through two-byte pushes.
#[derive(Default)]
pub struct Asm {
    code: Vec<u8>,
    labels: HashMap<String, usize>,
    fixups: Vec<(usize, String)>,
    generated: usize,
}

impl Asm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn op(mut self, opcode: Opcode) -> Self {
        self.code.push(opcode.0);
        self
    }

    pub fn push(self, value: u64) -> Self {
        self.push_word(U256::from(value))
    }

    /// Shortest `PUSHn` holding `value`, at least one byte.
    pub fn push_word(mut self, value: U256) -> Self {
        let bytes = value.to_be_bytes::<32>();
        let start = bytes.iter().position(|b| *b != 0).unwrap_or(31);
        let data = &bytes[start..];
        self.code.push(Opcode::PUSH1.0 + data.len() as u8 - 1);
        self.code.extend_from_slice(data);
        self
    }

    pub fn push_label(mut self, label: &str) -> Self {
        self.code.push(Opcode::PUSH2.0);
        self.fixups.push((self.code.len(), label.to_string()));
        self.code.extend_from_slice(&[0, 0]);
        self
    }

    pub fn label(mut self, label: &str) -> Self {
        self.labels.insert(label.to_string(), self.code.len());
        self.op(Opcode::JUMPDEST)
    }

    pub fn jump(self, label: &str) -> Self {
        self.push_label(label).op(Opcode::JUMP)
    }

    pub fn jumpi(self, label: &str) -> Self {
        self.push_label(label).op(Opcode::JUMPI)
    }

    /// Reverts unless the condition on top of the stack holds.
    pub fn require(mut self) -> Self {
        self.generated += 1;
        let ok = format!("__require_{}", self.generated);
        self.jumpi(&ok)
            .push(0)
            .op(Opcode::DUP1)
            .op(Opcode::REVERT)
            .label(&ok)
    }

    /// Jumps to `label` when the calldata selector equals `selector`.
    pub fn dispatch(self, selector: u32, label: &str) -> Self {
        self.push(0)
            .op(Opcode::CALLDATALOAD)
            .push(0xe0)
            .op(Opcode::SHR)
            .push_word(U256::from(selector))
            .op(Opcode::EQ)
            .jumpi(label)
    }

    /// `require(msg.sender == owner)` with `owner` read from `slot`.
    pub fn owner_guard(self, slot: u64, storage_first: bool) -> Self {
        self.owner_guard_slot(U256::from(slot), storage_first)
    }

    pub fn owner_guard_slot(self, slot: U256, storage_first: bool) -> Self {
        let asm = if storage_first {
            self.op(Opcode::CALLER).push_word(slot).op(Opcode::SLOAD)
        } else {
            self.push_word(slot).op(Opcode::SLOAD).op(Opcode::CALLER)
        };
        asm.op(Opcode::EQ).require()
    }

    pub fn build(mut self) -> Vec<u8> {
        for (position, label) in std::mem::take(&mut self.fixups) {
            let target = self.labels[&label];
            self.code[position] = (target >> 8) as u8;
            self.code[position + 1] = target as u8;
        }
        self.code
    }
}

/// Creation code whose constructor returns `runtime` unchanged.
pub fn creation_code(runtime: &[u8]) -> Vec<u8> {
    const HEADER: usize = 13;
    let length = runtime.len();
    let mut code = vec![
        Opcode::PUSH2.0,
        (length >> 8) as u8,
        length as u8,
        Opcode::DUP1.0,
        Opcode::PUSH2.0,
        0,
        HEADER as u8,
        Opcode::PUSH1.0,
        0,
        Opcode::CODECOPY.0,
        Opcode::PUSH1.0,
        0,
        Opcode::RETURN.0,
    ];
    code.extend_from_slice(runtime);
    code
}

pub fn runtime_target(code: Vec<u8>) -> Target {
    Target::Deployed {
        address: Address::ZERO,
        code,
    }
}

/// Runs `strategy` alone over `code` as deployed runtime code.
pub fn run_detector(strategy: Strategy, code: Vec<u8>) -> Vec<Finding> {
    let mut registry = DetectorRegistry::new(vec![Detector::new(strategy)]);
    let mut analysis = SymbolicAnalysis::new(AnalysisConfig::default());
    let report = analysis
        .execute(&runtime_target(code), &mut registry, None)
        .expect("analysis failed");
    report.items.into_iter().flat_map(|item| item.findings).collect()
}
