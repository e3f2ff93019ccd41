use alloy_primitives::U256;
use anyhow::Result;

use super::{executed, loaded_slot, plain_storage_index, Actor, Analyzer, Annotation, Finding, HookAnalyzer, Hooks};
use crate::engine::{HookEvent, HookPhase, Opcode};

pub const PATTERN_NAME: &str = "OWNERSHIP";

/// Detects `require(msg.sender == owner)` guards where `owner` lives in a
/// plain storage slot.
pub struct Ownership {
    storage_ceiling: U256,
}

impl Ownership {
    pub fn new(storage_ceiling: U256) -> Self {
        Ownership { storage_ceiling }
    }
}

impl Analyzer for Ownership {
    fn pattern_name(&self) -> &'static str {
        PATTERN_NAME
    }

    fn name(&self) -> &'static str {
        "Ownership"
    }

    fn description(&self) -> &'static str {
        "This pattern aims at restricting functions to specific addresses. For example \
         the owner of the contract is specified in the constructor and only that account \
         is allowed to access a function and change the contract's state."
    }
}

impl HookAnalyzer for Ownership {
    fn hooks(&self) -> Hooks {
        Hooks {
            pre: &[Opcode::EQ, Opcode::JUMPI],
            post: &[Opcode::CALLER, Opcode::SLOAD],
        }
    }

    fn observe(&mut self, event: &HookEvent<'_>) -> Result<Option<Finding>> {
        let state = &event.state;

        if event.phase == HookPhase::Post {
            match executed(event) {
                Some(Opcode::CALLER) => state.peek(0)?.annotate(Annotation::Caller),
                Some(Opcode::SLOAD) => {
                    if let Some(slot) = loaded_slot(event)? {
                        state.peek(0)?.annotate(Annotation::Storage(Some(slot)));
                    }
                }
                _ => {}
            }
            return Ok(None);
        }

        match state.opcode() {
            Opcode::EQ => {
                let (a, b) = (state.peek(0)?, state.peek(1)?);
                let ceiling = self.storage_ceiling;
                if a.has(&Annotation::Caller) && plain_storage_index(b, ceiling).is_some() {
                    a.annotate(Annotation::Equality(Actor::Sender));
                    b.annotate(Annotation::Equality(Actor::Owner));
                } else if b.has(&Annotation::Caller) && plain_storage_index(a, ceiling).is_some() {
                    b.annotate(Annotation::Equality(Actor::Sender));
                    a.annotate(Annotation::Equality(Actor::Owner));
                }
                Ok(None)
            }
            Opcode::JUMPI => {
                let condition = state.peek(1)?;
                let guarded = condition.has_all(&[
                    Annotation::Equality(Actor::Owner),
                    Annotation::Equality(Actor::Sender),
                ]);
                if !guarded {
                    return Ok(None);
                }
                let slot = plain_storage_index(condition, self.storage_ceiling);
                Ok(Some(Finding::new(state.function_name).with_storage_address(slot)))
            }
            _ => Ok(None),
        }
    }
}
