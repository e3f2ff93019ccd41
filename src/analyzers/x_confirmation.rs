use anyhow::Result;

use super::{executed, has_storage, loaded_slot, storage_index, Analyzer, Annotation, ComparedItem, Finding, HookAnalyzer, Hooks};
use crate::engine::{HookEvent, HookPhase, Opcode};

pub const PATTERN_NAME: &str = "X_CONFIRMATION";

const BLOCK_CONDITION: [Annotation; 2] = [
    Annotation::Comparison(ComparedItem::BlockNumber),
    Annotation::Comparison(ComparedItem::Storage),
];

/// Detects branches on the current block number compared with a stored block
/// number.
pub struct XConfirmation;

impl Analyzer for XConfirmation {
    fn pattern_name(&self) -> &'static str {
        PATTERN_NAME
    }

    fn name(&self) -> &'static str {
        "X-Confirmation (Block Count)"
    }

    fn description(&self) -> &'static str {
        "This pattern protects functions from being executed unless a condition related to the \
         current block number is met. For example one might want to wait for a certain number \
         of blocks to have passed before a transaction is marked as valid or confirmed."
    }
}

impl HookAnalyzer for XConfirmation {
    fn hooks(&self) -> Hooks {
        Hooks {
            pre: &[Opcode::JUMPI, Opcode::EQ, Opcode::LT, Opcode::GT],
            post: &[Opcode::NUMBER, Opcode::SLOAD],
        }
    }

    fn observe(&mut self, event: &HookEvent<'_>) -> Result<Option<Finding>> {
        let state = &event.state;

        if event.phase == HookPhase::Post {
            match executed(event) {
                Some(Opcode::NUMBER) => state.peek(0)?.annotate(Annotation::BlockNumber),
                Some(Opcode::SLOAD) => state.peek(0)?.annotate(Annotation::Storage(loaded_slot(event)?)),
                _ => {}
            }
            return Ok(None);
        }

        match state.opcode() {
            Opcode::EQ | Opcode::LT | Opcode::GT => {
                let (a, b) = (state.peek(0)?, state.peek(1)?);
                let (number, stored) = if a.has(&Annotation::BlockNumber) && has_storage(b) {
                    (a, b)
                } else if has_storage(a) && b.has(&Annotation::BlockNumber) {
                    (b, a)
                } else {
                    return Ok(None);
                };
                number.annotate(Annotation::Comparison(ComparedItem::BlockNumber));
                stored.annotate(Annotation::Comparison(ComparedItem::Storage));
                Ok(None)
            }
            Opcode::JUMPI => {
                let condition = state.peek(1)?;
                if !condition.has_all(&BLOCK_CONDITION) {
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
