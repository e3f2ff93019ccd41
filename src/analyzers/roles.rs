use alloy_primitives::{hex, U256};
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use tracing::info;

use super::{executed, Analyzer, Annotation, Finding, HookAnalyzer, Hooks};
use crate::engine::memory::MEMORY_LIMIT;
use crate::engine::value::to_usize;
use crate::engine::{HookEvent, HookPhase, Opcode, StateView};

pub const PATTERN_NAME: &str = "ROLES";

const WORD: usize = 32;

/// Detects `hasRole(role, msg.sender)` style checks: a storage lookup keyed by
/// both a hashed role identifier and the hashed caller guards a branch.
///
/// Concrete words lose their annotations once written to memory, so concrete
/// role identifiers (and hashes derived from them) are tracked by value in a
/// side cache and matched again when memory is hashed.
#[derive(Debug, Default)]
pub struct RoleBasedAccessControl {
    sha3_should_forward: bool,
    /// First concrete role seen per function.
    role_cache: HashMap<String, U256>,
    concrete_memory_cache: HashSet<U256>,
}

impl Analyzer for RoleBasedAccessControl {
    fn pattern_name(&self) -> &'static str {
        PATTERN_NAME
    }

    fn name(&self) -> &'static str {
        "Role Based Access Control"
    }

    fn description(&self) -> &'static str {
        "This pattern restricts functions to accounts that were granted a specific role. \
         Role memberships are kept in a mapping keyed by the role identifier and the account, \
         and a function only proceeds when the caller holds the required role."
    }
}

impl HookAnalyzer for RoleBasedAccessControl {
    fn hooks(&self) -> Hooks {
        Hooks {
            pre: &[Opcode::ADD, Opcode::JUMPDEST, Opcode::JUMPI, Opcode::SHA3],
            post: &[Opcode::CALLER, Opcode::SHA3, Opcode::SLOAD],
        }
    }

    fn observe(&mut self, event: &HookEvent<'_>) -> Result<Option<Finding>> {
        let state = &event.state;

        if event.phase == HookPhase::Post {
            match (executed(event), event.previous) {
                (Some(Opcode::CALLER), _) => state.peek(0)?.annotate(Annotation::Caller),
                (Some(Opcode::SHA3), _) => self.forward_hash_annotations(state)?,
                (Some(Opcode::SLOAD), Some(previous)) => {
                    let key = previous.peek(0)?;
                    if key.has_all(&[Annotation::HashedCaller, Annotation::HashedRole]) {
                        let result = state.peek(0)?;
                        result.annotate(Annotation::HashedCaller);
                        result.annotate(Annotation::HashedRole);
                    }
                }
                _ => {}
            }
            return Ok(None);
        }

        match state.opcode() {
            Opcode::JUMPDEST => self.mark_role(state)?,
            Opcode::ADD => self.shift_cached_roles(state)?,
            Opcode::SHA3 => self.match_hashed_memory(state)?,
            Opcode::JUMPI => {
                let condition = state.peek(1)?;
                if condition.has_all(&[Annotation::HashedCaller, Annotation::HashedRole]) {
                    if let Some(role) = self.role_cache.remove(state.function_name) {
                        info!("Role checked by {}: 0x{:x}", state.function_name, role);
                        info!("Role as text: {}", role_text(role));
                    }
                    self.concrete_memory_cache.clear();
                    return Ok(Some(Finding::new(state.function_name)));
                }
            }
            _ => {}
        }
        Ok(None)
    }

    fn clear(&mut self) {
        self.sha3_should_forward = false;
        self.role_cache.clear();
        self.concrete_memory_cache.clear();
    }
}

impl RoleBasedAccessControl {
    /// A jump destination with the caller on top of the stack may be the entry of
    /// a role check, the other top item then being the role.
    fn mark_role(&mut self, state: &StateView<'_>) -> Result<()> {
        if state.stack.len() < 2 {
            return Ok(());
        }
        let (top, second) = (state.peek(0)?, state.peek(1)?);
        let role = if top.has(&Annotation::Caller) {
            second
        } else if second.has(&Annotation::Caller) {
            top
        } else {
            return Ok(());
        };

        match role.value() {
            None => role.annotate(Annotation::Role),
            Some(value) => {
                self.concrete_memory_cache.insert(value);
                self.role_cache
                    .entry(state.function_name.to_string())
                    .or_insert(value);
            }
        }
        Ok(())
    }

    /// Roles stored in structs are looked up at an offset from the hashed slot.
    fn shift_cached_roles(&mut self, state: &StateView<'_>) -> Result<()> {
        let (top, second) = (state.peek(0)?, state.peek(1)?);
        let role_taints = [Annotation::Role, Annotation::HashedRole];
        let increment = if top.has_any(&role_taints) {
            second.value()
        } else if second.has_any(&role_taints) {
            top.value()
        } else {
            return Ok(());
        };

        if let Some(increment) = increment {
            self.concrete_memory_cache = self
                .concrete_memory_cache
                .iter()
                .map(|value| value.wrapping_add(increment))
                .collect();
        }
        Ok(())
    }

    fn match_hashed_memory(&mut self, state: &StateView<'_>) -> Result<()> {
        let offset = state.peek(0)?.value().and_then(to_usize);
        let length = state.peek(1)?.value().and_then(to_usize);
        let (Some(offset), Some(length)) = (offset, length) else {
            return Ok(());
        };
        if length < WORD {
            return Ok(());
        }
        // Same region bound the engine applies when it hashes memory.
        let Some(end) = offset.checked_add(length).filter(|end| *end <= MEMORY_LIMIT) else {
            return Ok(());
        };

        for position in (offset..end).step_by(WORD) {
            if let Some(word) = state.memory.concrete_word(position) {
                if self.concrete_memory_cache.remove(&word) {
                    self.sha3_should_forward = true;
                }
            }
        }
        Ok(())
    }

    fn forward_hash_annotations(&mut self, state: &StateView<'_>) -> Result<()> {
        let result = state.peek(0)?;
        if self.sha3_should_forward {
            result.annotate(Annotation::HashedRole);
            self.sha3_should_forward = false;
            if let Some(value) = result.value() {
                self.concrete_memory_cache.insert(value);
            }
        }
        if result.has(&Annotation::Role) {
            result.annotate(Annotation::HashedRole);
        }
        if result.has(&Annotation::Caller) {
            result.annotate(Annotation::HashedCaller);
        }
        Ok(())
    }
}

/// Role identifier rendered as text, e.g. `ADMIN` for a short string constant.
fn role_text(role: U256) -> String {
    let bytes = role.to_be_bytes::<32>();
    let significant: Vec<u8> = bytes.iter().copied().skip_while(|b| *b == 0).collect();
    if significant.is_empty() {
        return hex::encode_prefixed(bytes);
    }
    significant
        .iter()
        .map(|&b| if b.is_ascii() { b as char } else { char::REPLACEMENT_CHARACTER })
        .collect()
}
