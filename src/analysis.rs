use alloy_primitives::hex;
use anyhow::Result;
use tracing::{info, warn};

use crate::analyzers::DetectorRegistry;
use crate::config::{AnalysisConfig, Target};
use crate::engine::{ConstraintOracle, Explorer, StorageReader, StructuralOracle, SymbolicEngine};
use crate::error::AnalysisError;
use crate::models::{timestamp, Report};

/// Drives one engine over targets with the detectors of a registry.
pub struct SymbolicAnalysis {
    config: AnalysisConfig,
    engine: Box<dyn SymbolicEngine>,
    oracle: Box<dyn ConstraintOracle>,
}

impl SymbolicAnalysis {
    /// Analysis backed by the bundled explorer and structural oracle.
    pub fn new(config: AnalysisConfig) -> Self {
        let engine = Box::new(Explorer::from_config(&config));
        let oracle = Box::new(StructuralOracle::new(config.solver_timeout()));
        SymbolicAnalysis { config, engine, oracle }
    }

    pub fn with_engine(
        config: AnalysisConfig,
        engine: Box<dyn SymbolicEngine>,
        oracle: Box<dyn ConstraintOracle>,
    ) -> Self {
        SymbolicAnalysis { config, engine, oracle }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Explores `target` and collects what the registry's detectors found.
    ///
    /// The registry is reset first, so one registry can serve a whole batch.
    /// Storage contents are only resolved for deployed targets and only when a
    /// reader is given.
    pub fn execute(
        &mut self,
        target: &Target,
        registry: &mut DetectorRegistry,
        storage: Option<&dyn StorageReader>,
    ) -> Result<Report> {
        let start_time = timestamp();
        registry.reset();

        self.engine.clear_hooks();
        registry.register_hooks(self.engine.as_mut());

        info!("Starting symbolic execution with {} detector(s)", registry.len());
        let space = self.engine.explore(target, registry)?;
        if !space.complete {
            warn!("Exploration stopped early, results are partial");
        }
        info!(
            "Explored {} node(s) across {} function(s)",
            space.nodes.len(),
            space.function_names().len()
        );

        registry.inspect_state_space(&space, self.oracle.as_ref())?;

        let mut report = Report::new(start_time);
        report.contract_address = target.address().map(|address| address.to_string());
        report.contract_code = Some(hex::encode_prefixed(target.code()));
        for item in registry.generate_reports() {
            report.add_item(item);
        }

        if let (Some(address), Some(reader)) = (target.address(), storage) {
            resolve_storage(&mut report, address, reader)?;
        }

        report.end_time = timestamp();
        info!(
            "Analysis finished in {:.2}s with {} finding(s)",
            report.end_time - report.start_time,
            report.findings_count()
        );
        Ok(report)
    }
}

/// Fills `storage_content` of every finding that names a storage slot.
fn resolve_storage(
    report: &mut Report,
    address: alloy_primitives::Address,
    reader: &dyn StorageReader,
) -> Result<(), AnalysisError> {
    for finding in report.items.iter_mut().flat_map(|item| item.findings.iter_mut()) {
        let Some(slot) = finding.storage_address else {
            continue;
        };
        let value = reader
            .read_storage(address, slot)
            .map_err(|e| AnalysisError::StorageRead {
                address,
                slot: format!("0x{:x}", slot),
                reason: e.to_string(),
            })?;
        finding.storage_content = Some(hex::encode_prefixed(value.to_be_bytes::<32>()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzers::test_utils::{creation_code, runtime_target, Asm};
    use crate::analyzers::{Detector, Ownership, Strategy};
    use crate::engine::{
        HookDispatcher, HookEvent, HookPhase, Instruction, Memory, Opcode, StateSpace, StateView, StaticStorage,
    };
    use alloy_primitives::{Address, U256};

    struct BrokenStorage;

    impl StorageReader for BrokenStorage {
        fn read_storage(&self, _address: Address, _slot: U256) -> Result<U256> {
            anyhow::bail!("node unreachable")
        }
    }

    /// Engine that hands every `JUMPI` subscriber a state with an empty stack.
    #[derive(Default)]
    struct ShortStackEngine {
        subscribers: Vec<usize>,
    }

    impl SymbolicEngine for ShortStackEngine {
        fn register_hook(&mut self, phase: HookPhase, opcode: Opcode, subscriber: usize) {
            if phase == HookPhase::Pre && opcode == Opcode::JUMPI {
                self.subscribers.push(subscriber);
            }
        }

        fn clear_hooks(&mut self) {
            self.subscribers.clear();
        }

        fn explore(&mut self, _target: &Target, dispatcher: &mut dyn HookDispatcher) -> Result<StateSpace> {
            let instruction = Instruction::new(0, Opcode::JUMPI, None);
            let memory = Memory::new();
            let event = HookEvent {
                phase: HookPhase::Pre,
                state: StateView {
                    instruction: &instruction,
                    stack: &[],
                    memory: &memory,
                    function_name: "fallback",
                    constraints: &[],
                },
                previous: None,
            };
            for &subscriber in &self.subscribers {
                dispatcher.dispatch(subscriber, &event)?;
            }
            Ok(StateSpace { complete: true, ..StateSpace::default() })
        }
    }

    fn ownership_registry() -> DetectorRegistry {
        DetectorRegistry::new(vec![Detector::new(Strategy::Ownership(Ownership::new(U256::from(
            0x1_0000_0000u64,
        ))))])
    }

    fn guarded() -> Vec<u8> {
        Asm::new().owner_guard(3, true).op(Opcode::STOP).build()
    }

    #[test]
    fn test_report_carries_target_metadata() {
        let mut analysis = SymbolicAnalysis::new(AnalysisConfig::default());
        let mut registry = ownership_registry();
        let report = analysis.execute(&runtime_target(guarded()), &mut registry, None).unwrap();
        assert_eq!(report.contract_address.as_deref(), Some(Address::ZERO.to_string().as_str()));
        assert!(report.contract_code.as_deref().unwrap().starts_with("0x"));
        assert!(report.end_time >= report.start_time);
        assert_eq!(report.findings_count(), 1);
        assert_eq!(report.items[0].findings[0].storage_content, None);
    }

    #[test]
    fn test_storage_content_is_resolved() {
        let storage = StaticStorage::new().with_slot(U256::from(3), U256::from(0xbeef));
        let mut analysis = SymbolicAnalysis::new(AnalysisConfig::default());
        let mut registry = ownership_registry();
        let report = analysis
            .execute(&runtime_target(guarded()), &mut registry, Some(&storage))
            .unwrap();
        let content = report.items[0].findings[0].storage_content.clone().unwrap();
        assert_eq!(content.len(), 66);
        assert!(content.ends_with("beef"));
    }

    #[test]
    fn test_storage_failure_is_reported() {
        let mut analysis = SymbolicAnalysis::new(AnalysisConfig::default());
        let mut registry = ownership_registry();
        let error = analysis
            .execute(&runtime_target(guarded()), &mut registry, Some(&BrokenStorage))
            .unwrap_err();
        assert!(matches!(
            error.downcast_ref::<AnalysisError>(),
            Some(AnalysisError::StorageRead { .. })
        ));
    }

    #[test]
    fn test_stack_underflow_in_hook_aborts_run() {
        let config = AnalysisConfig::default();
        let oracle = Box::new(StructuralOracle::new(config.solver_timeout()));
        let mut analysis = SymbolicAnalysis::with_engine(config, Box::new(ShortStackEngine::default()), oracle);
        let mut registry = ownership_registry();
        let error = analysis
            .execute(&runtime_target(guarded()), &mut registry, None)
            .unwrap_err();
        assert!(matches!(
            error.downcast_ref::<AnalysisError>(),
            Some(AnalysisError::StackUnderflow { opcode: "JUMPI", .. })
        ));
    }

    #[test]
    fn test_creation_target_skips_storage() {
        let storage = StaticStorage::new().with_slot(U256::from(3), U256::from(1));
        let mut analysis = SymbolicAnalysis::new(AnalysisConfig::default());
        let mut registry = ownership_registry();
        let target = Target::Creation { code: creation_code(&guarded()) };
        let report = analysis.execute(&target, &mut registry, Some(&storage)).unwrap();
        assert_eq!(report.contract_address, None);
        assert_eq!(report.findings_count(), 1);
        assert_eq!(report.items[0].findings[0].storage_content, None);
    }

    #[test]
    fn test_registry_is_reset_between_runs() {
        let mut analysis = SymbolicAnalysis::new(AnalysisConfig::default());
        let mut registry = ownership_registry();
        let first = analysis.execute(&runtime_target(guarded()), &mut registry, None).unwrap();
        let clean = Asm::new().push(1).op(Opcode::POP).op(Opcode::STOP).build();
        let second = analysis.execute(&runtime_target(clean), &mut registry, None).unwrap();
        let third = analysis.execute(&runtime_target(guarded()), &mut registry, None).unwrap();
        assert_eq!(first.findings_count(), 1);
        assert_eq!(second.findings_count(), 0);
        assert_eq!(third.items, first.items);
    }
}
