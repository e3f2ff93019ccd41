use alloy_primitives::U256;
use anyhow::Result;
use std::collections::BTreeSet;
use tracing::debug;

use super::{Analyzer, Finding, GraphAnalyzer};
use crate::engine::{ConstraintOracle, Instruction, Node, Opcode, StateSpace};

pub const PATTERN_NAME: &str = "OFF_CHAIN_SECRET";

/// Instruction sequence emitted for `keccak256(abi.encodePacked(..))` over a
/// dynamic argument.
const ENCODE_PACKED_SEQUENCE: [(Opcode, Option<u64>); 3] =
    [(Opcode::PUSH1, Some(0x20)), (Opcode::ADD, None), (Opcode::SHA3, None)];

/// Detects blocks hashing packed input whose successor reverts, the shape a
/// secret check against a stored hash compiles to.
pub struct OffChainSecret;

impl Analyzer for OffChainSecret {
    fn pattern_name(&self) -> &'static str {
        PATTERN_NAME
    }

    fn name(&self) -> &'static str {
        "Off-Chain Secret Enabled Authentication"
    }

    fn description(&self) -> &'static str {
        "This pattern aims at providing authentication when the account is not known in advance. \
         A secret is fixed off-chain and hashed, and the hash gets submitted to the contract. \
         Later, the holder of the secret can submit it to the contract, the contract checks \
         the secret's hash against the stored one, and if they match the protected logic gets executed."
    }
}

impl GraphAnalyzer for OffChainSecret {
    fn analyze(&self, space: &StateSpace, _oracle: &dyn ConstraintOracle) -> Result<Vec<Finding>> {
        let mut function_names = BTreeSet::new();
        for node in &space.nodes {
            if contains_sequence(node) && reverts_next(space, node) {
                debug!("Function '{}' is restricted by off-chain secret", node.function_name);
                function_names.insert(node.function_name.as_str());
            }
        }
        Ok(function_names.into_iter().map(Finding::new).collect())
    }
}

fn matches(instruction: &Instruction, (opcode, argument): &(Opcode, Option<u64>)) -> bool {
    instruction.opcode == *opcode
        && argument.map_or(true, |expected| instruction.argument == Some(U256::from(expected)))
}

fn contains_sequence(node: &Node) -> bool {
    let instructions: Vec<&Instruction> = node.instructions().collect();
    instructions.windows(ENCODE_PACKED_SEQUENCE.len()).any(|window| {
        window
            .iter()
            .zip(ENCODE_PACKED_SEQUENCE.iter())
            .all(|(instruction, expected)| matches(instruction, expected))
    })
}

fn reverts_next(space: &StateSpace, node: &Node) -> bool {
    space.successors(node.uid).any(|next| next.contains(Opcode::REVERT))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzers::test_utils::{run_detector, Asm};
    use crate::analyzers::Strategy;

    /// Hashes the secret stored at `0x20 + 0x20` and requires the hash to match slot 0.
    fn secret_check() -> Vec<u8> {
        Asm::new()
            .dispatch(0x2e1a7d4d, "withdraw")
            .op(Opcode::STOP)
            .label("withdraw")
            .push(4)
            .op(Opcode::CALLDATALOAD)
            .push(0x40)
            .op(Opcode::MSTORE)
            .push(0x20)
            .push(0x20)
            .push(0x20)
            .op(Opcode::ADD)
            .op(Opcode::SHA3)
            .push(0)
            .op(Opcode::SLOAD)
            .op(Opcode::EQ)
            .require()
            .op(Opcode::STOP)
            .build()
    }

    #[test]
    fn test_packed_hash_before_revert() {
        let findings = run_detector(Strategy::OffChainSecret(OffChainSecret), secret_check());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].function_name, "_function_0x2e1a7d4d");
    }

    #[test]
    fn test_other_offset_is_ignored() {
        let code = Asm::new()
            .push(0x20)
            .push(0x40)
            .op(Opcode::ADD)
            .push(0x20)
            .op(Opcode::SWAP1)
            .op(Opcode::SHA3)
            .op(Opcode::ISZERO)
            .require()
            .op(Opcode::STOP)
            .build();
        assert!(run_detector(Strategy::OffChainSecret(OffChainSecret), code).is_empty());
    }
}
