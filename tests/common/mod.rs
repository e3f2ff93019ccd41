#![allow(dead_code)]

use alloy_primitives::{hex, Address, U256};
use std::collections::HashMap;

use evm_fender::engine::Opcode;
use evm_fender::{AnalysisConfig, DetectorRegistry, Report, SymbolicAnalysis, Target};

/// Assembles whitespace separated mnemonics. `name:` defines a label (and
/// emits its `JUMPDEST`), `@name` pushes a label address with `PUSH2`, and
/// `;` starts a comment running to the end of the line.
pub fn assemble(source: &str) -> Vec<u8> {
    let tokens: Vec<&str> = source
        .lines()
        .map(|line| line.split(';').next().unwrap_or(""))
        .flat_map(str::split_whitespace)
        .collect();

    let mut code = Vec::new();
    let mut labels = HashMap::new();
    let mut fixups = Vec::new();
    let mut tokens = tokens.into_iter();

    while let Some(token) = tokens.next() {
        if let Some(label) = token.strip_suffix(':') {
            labels.insert(label.to_string(), code.len());
            code.push(Opcode::JUMPDEST.0);
        } else if let Some(label) = token.strip_prefix('@') {
            code.push(Opcode::PUSH2.0);
            fixups.push((code.len(), label.to_string()));
            code.extend_from_slice(&[0, 0]);
        } else {
            let opcode = Opcode::from_name(token).unwrap_or_else(|| panic!("unknown mnemonic {}", token));
            code.push(opcode.0);
            let size = opcode.push_size();
            if size > 0 {
                let argument = tokens.next().unwrap_or_else(|| panic!("{} needs an argument", token));
                let value = match argument.strip_prefix("0x") {
                    Some(hex) => U256::from_str_radix(hex, 16),
                    None => U256::from_str_radix(argument, 10),
                }
                .unwrap_or_else(|_| panic!("bad push argument {}", argument));
                code.extend_from_slice(&value.to_be_bytes::<32>()[32 - size..]);
            }
        }
    }

    for (position, label) in fixups {
        let target = labels[&label];
        code[position] = (target >> 8) as u8;
        code[position + 1] = target as u8;
    }
    code
}

/// Creation code whose constructor copies `runtime` to memory and returns it.
pub fn creation_code(runtime: &[u8]) -> Vec<u8> {
    let mut code = assemble(&format!(
        "PUSH2 {} DUP1 PUSH2 13 PUSH1 0 CODECOPY PUSH1 0 RETURN",
        runtime.len()
    ));
    code.extend_from_slice(runtime);
    code
}

pub fn deployed(runtime: &[u8]) -> Target {
    Target::deployed_hex(Address::repeat_byte(0x11), &hex::encode(runtime)).expect("valid runtime code")
}

pub fn run(target: &Target) -> Report {
    let config = AnalysisConfig::default();
    let mut registry = DetectorRegistry::with_all(&config);
    SymbolicAnalysis::new(config)
        .execute(target, &mut registry, None)
        .expect("analysis failed")
}

/// `(pattern, function, storage slot)` of every finding of `report`.
pub fn hits(report: &Report) -> Vec<(String, String, Option<U256>)> {
    report
        .items
        .iter()
        .flat_map(|item| {
            item.findings
                .iter()
                .map(move |f| (item.pattern_name.clone(), f.function_name.clone(), f.storage_address))
        })
        .collect()
}

pub fn hits_of(report: &Report, pattern: &str) -> Vec<(String, Option<U256>)> {
    hits(report)
        .into_iter()
        .filter(|(p, _, _)| p == pattern)
        .map(|(_, function, slot)| (function, slot))
        .collect()
}
