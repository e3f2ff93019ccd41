use anyhow::Result;
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::{debug, info};

use super::{Analyzer, Finding, GraphAnalyzer};
use crate::engine::{ConstraintOracle, Node, Opcode, Query, StackValue, StateSpace};

pub const PATTERN_NAME: &str = "SINGLE_OWNER";

/// Finds storage slots compared with the caller, where the constraint oracle
/// proves that the compared operands are exactly the caller and the loaded
/// value.
pub struct SingleOwner;

impl Analyzer for SingleOwner {
    fn pattern_name(&self) -> &'static str {
        PATTERN_NAME
    }

    fn name(&self) -> &'static str {
        "Single Owner"
    }

    fn description(&self) -> &'static str {
        "A single account whose address is kept in contract storage is allowed to access \
         a function. The comparison between the caller and the stored account is proven \
         by the constraint solver rather than inferred from taints."
    }
}

impl GraphAnalyzer for SingleOwner {
    fn analyze(&self, space: &StateSpace, oracle: &dyn ConstraintOracle) -> Result<Vec<Finding>> {
        info!("Analyzing nodes of symbolic execution");
        let mut findings: BTreeMap<&str, Finding> = BTreeMap::new();
        for node in &space.nodes {
            if findings.contains_key(node.function_name.as_str()) {
                continue;
            }
            if let Some(finding) = inspect_node(node, oracle)? {
                findings.insert(node.function_name.as_str(), finding);
            }
        }
        info!(
            "Found {} potential storage addresses that might contain administrator accounts",
            findings.values().filter(|f| f.storage_address.is_some()).count()
        );
        Ok(findings.into_values().collect())
    }
}

/// Top of the stack right after the instruction at `index` executed.
fn result_of(node: &Node, index: usize) -> Option<&Rc<StackValue>> {
    node.frames.get(index + 1).and_then(|frame| frame.stack.last())
}

fn inspect_node(node: &Node, oracle: &dyn ConstraintOracle) -> Result<Option<Finding>> {
    let mut caller = None;
    let mut stored = None;

    for (index, frame) in node.frames.iter().enumerate() {
        match frame.instruction.opcode {
            Opcode::CALLER => {
                caller = result_of(node, index);
                debug!("Found CALLER in node {} at {}", node.uid, frame.instruction.address);
            }
            Opcode::SLOAD => {
                stored = result_of(node, index).map(|value| (value, frame.peek(0).ok()));
                debug!("Found SLOAD in node {} at {}", node.uid, frame.instruction.address);
            }
            Opcode::EQ => {
                // CALLER and SLOAD must both have happened in this block.
                let (Some(caller), Some((stored, slot))) = (caller, stored) else {
                    continue;
                };
                let (a, b) = (frame.peek(0)?.word(), frame.peek(1)?.word());
                let caller_first = Query::new(&node.constraints)
                    .distinct(a, caller.word())
                    .distinct(b, stored.word());
                let stored_first = Query::new(&node.constraints)
                    .distinct(a, stored.word())
                    .distinct(b, caller.word());
                if oracle.proves_unsat(&caller_first) || oracle.proves_unsat(&stored_first) {
                    let slot = slot.and_then(|slot| slot.value());
                    return Ok(Some(Finding::new(&node.function_name).with_storage_address(slot)));
                }
            }
            _ => {}
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzers::test_utils::{run_detector, Asm};
    use crate::analyzers::Strategy;
    use crate::engine::{OracleError, Satisfiability};
    use alloy_primitives::U256;

    struct Undecided;

    impl ConstraintOracle for Undecided {
        fn check(&self, _query: &Query) -> std::result::Result<Satisfiability, OracleError> {
            Err(OracleError::Solver("gave up".to_string()))
        }
    }

    fn owner_compare() -> Vec<u8> {
        Asm::new()
            .push(0)
            .op(Opcode::SLOAD)
            .op(Opcode::CALLER)
            .op(Opcode::EQ)
            .require()
            .op(Opcode::STOP)
            .build()
    }

    #[test]
    fn test_proven_owner_comparison() {
        let findings = run_detector(Strategy::SingleOwner(SingleOwner), owner_compare());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].storage_address, Some(U256::ZERO));
    }

    #[test]
    fn test_unrelated_comparison_is_ignored() {
        let code = Asm::new()
            .push(0)
            .op(Opcode::SLOAD)
            .op(Opcode::POP)
            .op(Opcode::CALLER)
            .op(Opcode::POP)
            .push(4)
            .op(Opcode::CALLDATALOAD)
            .push(1)
            .op(Opcode::EQ)
            .require()
            .op(Opcode::STOP)
            .build();
        assert!(run_detector(Strategy::SingleOwner(SingleOwner), code).is_empty());
    }

    #[test]
    fn test_oracle_failure_is_not_a_proof() {
        use crate::engine::{Explorer, SymbolicEngine};
        use crate::analyzers::test_utils::runtime_target;

        struct Silent;
        impl crate::engine::HookDispatcher for Silent {
            fn dispatch(&mut self, _: usize, _: &crate::engine::HookEvent<'_>) -> Result<()> {
                Ok(())
            }
        }

        let space = Explorer::default()
            .explore(&runtime_target(owner_compare()), &mut Silent)
            .unwrap();
        assert!(SingleOwner.analyze(&space, &Undecided).unwrap().is_empty());
    }
}
