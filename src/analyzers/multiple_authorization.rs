use alloy_primitives::U256;
use anyhow::Result;

use super::{executed, loaded_slot, plain_storage_index, Analyzer, Annotation, Finding, HookAnalyzer, Hooks};
use crate::engine::{HookEvent, HookPhase, Opcode};

pub const PATTERN_NAME: &str = "MULTIPLE_AUTHORIZATION";

/// Detects branches on an ordering comparison between two stored values, such
/// as a confirmation counter checked against a required threshold.
pub struct MultipleAuthorization {
    storage_ceiling: U256,
}

impl MultipleAuthorization {
    pub fn new(storage_ceiling: U256) -> Self {
        MultipleAuthorization { storage_ceiling }
    }
}

impl Analyzer for MultipleAuthorization {
    fn pattern_name(&self) -> &'static str {
        PATTERN_NAME
    }

    fn name(&self) -> &'static str {
        "Multiple Authorization"
    }

    fn description(&self) -> &'static str {
        "This pattern requires several accounts to approve an action before it is executed. \
         Approvals are counted in contract storage and the protected logic only runs once \
         the stored count reaches a stored threshold."
    }
}

impl HookAnalyzer for MultipleAuthorization {
    fn hooks(&self) -> Hooks {
        Hooks {
            pre: &[Opcode::JUMPI, Opcode::SSTORE],
            post: &[Opcode::SLOAD, Opcode::LT, Opcode::GT],
        }
    }

    fn observe(&mut self, event: &HookEvent<'_>) -> Result<Option<Finding>> {
        let state = &event.state;

        match (event.phase, event.previous) {
            (HookPhase::Post, Some(previous)) => {
                match executed(event) {
                    Some(Opcode::SLOAD) => {
                        if let Some(slot) = loaded_slot(event)?.filter(|slot| *slot < self.storage_ceiling) {
                            state.peek(0)?.annotate(Annotation::Storage(Some(slot)));
                        }
                    }
                    Some(Opcode::LT) | Some(Opcode::GT) => {
                        let left = plain_storage_index(previous.peek(0)?, self.storage_ceiling);
                        let right = plain_storage_index(previous.peek(1)?, self.storage_ceiling);
                        if let (Some(left), Some(right)) = (left, right) {
                            let result = state.peek(0)?;
                            result.discard(&Annotation::Storage(Some(left)));
                            result.discard(&Annotation::Storage(Some(right)));
                            result.annotate(Annotation::StorageComparison { left, right });
                        }
                    }
                    _ => {}
                }
                Ok(None)
            }
            (HookPhase::Pre, _) if state.opcode() == Opcode::JUMPI => {
                let compared = state
                    .peek(1)?
                    .annotations()
                    .iter()
                    .any(|a| matches!(a, Annotation::StorageComparison { .. }));
                Ok(compared.then(|| Finding::new(state.function_name)))
            }
            _ => Ok(None),
        }
    }
}
