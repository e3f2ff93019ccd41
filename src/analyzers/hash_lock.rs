use anyhow::Result;

use super::{executed, loaded_slot, storage_index, Analyzer, Annotation, Finding, HookAnalyzer, Hooks};
use crate::engine::value::to_usize;
use crate::engine::{HookEvent, HookPhase, Opcode};

pub const PATTERN_NAME: &str = "HASH_LOCK";

/// Detects functions guarded by a secret whose hash is compared against, or
/// looked up in, contract storage.
///
/// Only hashes over at most `max_input_length` bytes count as hashed secrets.
/// Mapping lookups hash the key together with the slot and are always longer.
pub struct HashLock {
    max_input_length: usize,
}

impl HashLock {
    pub fn new(max_input_length: usize) -> Self {
        HashLock { max_input_length }
    }
}

impl Default for HashLock {
    fn default() -> Self {
        Self::new(32)
    }
}

impl Analyzer for HashLock {
    fn pattern_name(&self) -> &'static str {
        PATTERN_NAME
    }

    fn name(&self) -> &'static str {
        "Hash Lock (Off-Chain Secret Enabled Authentication)"
    }

    fn description(&self) -> &'static str {
        "This pattern aims at providing authentication when the account is not known in advance. \
         A secret is fixed off-chain and hashed, and the hash gets submitted to the contract. \
         Later, the holder of the secret can submit it to the contract, the contract checks \
         the secret's hash against the stored one, and if they match the protected logic gets executed."
    }
}

impl HookAnalyzer for HashLock {
    fn hooks(&self) -> Hooks {
        Hooks {
            pre: &[Opcode::JUMPI],
            post: &[Opcode::CALLDATALOAD, Opcode::SHA3, Opcode::SLOAD, Opcode::EQ],
        }
    }

    fn observe(&mut self, event: &HookEvent<'_>) -> Result<Option<Finding>> {
        let state = &event.state;

        match (event.phase, event.previous) {
            (HookPhase::Post, Some(previous)) => {
                let result = state.peek(0)?;
                match executed(event) {
                    Some(Opcode::CALLDATALOAD) => result.annotate(Annotation::Input),
                    Some(Opcode::SHA3) => {
                        let length = previous.peek(1)?.value().and_then(to_usize);
                        let short = length.is_some_and(|length| length <= self.max_input_length);
                        if short && result.discard(&Annotation::Input) {
                            result.annotate(Annotation::HashedInput);
                        }
                    }
                    Some(Opcode::SLOAD) => {
                        if let Some(slot) = loaded_slot(event)? {
                            result.annotate(Annotation::Storage(Some(slot)));
                        }
                        if previous.peek(0)?.has(&Annotation::HashedInput) {
                            result.annotate(Annotation::HashedStorage);
                        }
                    }
                    Some(Opcode::EQ) => {
                        if result.has(&Annotation::HashedInput) {
                            result.annotate(Annotation::HashedInputEq);
                        }
                    }
                    _ => {}
                }
                Ok(None)
            }
            (HookPhase::Pre, _) if state.opcode() == Opcode::JUMPI => {
                let condition = state.peek(1)?;
                if !condition.has_any(&[Annotation::HashedStorage, Annotation::HashedInputEq]) {
                    return Ok(None);
                }
                Ok(Some(
                    Finding::new(state.function_name).with_storage_address(storage_index(condition)),
                ))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzers::test_utils::{run_detector, Asm};
    use crate::analyzers::Strategy;
    use alloy_primitives::U256;

    /// Hashes the first calldata argument over `length` bytes of memory.
    fn hash_input(asm: Asm, length: u64) -> Asm {
        asm.push(4)
            .op(Opcode::CALLDATALOAD)
            .push(0)
            .op(Opcode::MSTORE)
            .push(length)
            .push(0)
            .op(Opcode::SHA3)
    }

    fn compare_with_slot(asm: Asm, slot: u64) -> Asm {
        asm.push(slot).op(Opcode::SLOAD).op(Opcode::EQ).require().op(Opcode::STOP)
    }

    #[test]
    fn test_secret_compared_with_stored_hash() {
        let code = compare_with_slot(hash_input(Asm::new(), 32), 2).build();
        let findings = run_detector(Strategy::HashLock(HashLock::default()), code);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].storage_address, Some(U256::from(2)));
    }

    #[test]
    fn test_long_hash_is_a_mapping_lookup() {
        let code = compare_with_slot(hash_input(Asm::new(), 64), 2).build();
        assert!(run_detector(Strategy::HashLock(HashLock::default()), code).is_empty());
    }

    #[test]
    fn test_hashed_secret_as_storage_key() {
        let code = hash_input(Asm::new(), 32)
            .op(Opcode::SLOAD)
            .op(Opcode::ISZERO)
            .op(Opcode::ISZERO)
            .require()
            .op(Opcode::STOP)
            .build();
        let findings = run_detector(Strategy::HashLock(HashLock::default()), code);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].storage_address, None);
    }

    #[test]
    fn test_unhashed_input_is_ignored() {
        let code = compare_with_slot(Asm::new().push(4).op(Opcode::CALLDATALOAD), 2).build();
        assert!(run_detector(Strategy::HashLock(HashLock::default()), code).is_empty());
    }
}
