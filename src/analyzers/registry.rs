use anyhow::{bail, Result};
use tracing::debug;

use super::{Detector, ReportItem, PATTERN_NAMES};
use crate::config::AnalysisConfig;
use crate::engine::{ConstraintOracle, HookDispatcher, HookEvent, StateSpace, SymbolicEngine};

/// The detectors taking part in an analysis. Hook subscribers are indices into
/// the registry.
pub struct DetectorRegistry {
    detectors: Vec<Detector>,
}

impl DetectorRegistry {
    pub fn new(detectors: Vec<Detector>) -> Self {
        DetectorRegistry { detectors }
    }

    /// Every known detector, in report order.
    pub fn with_all(config: &AnalysisConfig) -> Self {
        let detectors = PATTERN_NAMES
            .iter()
            .filter_map(|name| Detector::from_pattern(name, config))
            .collect();
        Self::new(detectors)
    }

    /// Detectors for the given pattern identifiers, in the order given.
    pub fn with_patterns<S: AsRef<str>>(patterns: &[S], config: &AnalysisConfig) -> Result<Self> {
        let mut detectors = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let pattern = pattern.as_ref();
            match Detector::from_pattern(pattern, config) {
                Some(detector) => detectors.push(detector),
                None => bail!("Unknown pattern '{}', expected one of: {}", pattern, PATTERN_NAMES.join(", ")),
            }
        }
        Ok(Self::new(detectors))
    }

    pub fn detectors(&self) -> &[Detector] {
        &self.detectors
    }

    pub fn len(&self) -> usize {
        self.detectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }

    pub fn register_hooks(&self, engine: &mut dyn SymbolicEngine) {
        for (subscriber, detector) in self.detectors.iter().enumerate() {
            for (phase, opcode) in detector.hooks().iter() {
                debug!("Registering {:?} hook on {} for {}", phase, opcode, detector.pattern_name());
                engine.register_hook(phase, opcode, subscriber);
            }
        }
    }

    /// Prepares every detector for a new run.
    pub fn reset(&mut self) {
        for detector in &mut self.detectors {
            detector.reset();
        }
    }

    pub fn inspect_state_space(&mut self, space: &StateSpace, oracle: &dyn ConstraintOracle) -> Result<()> {
        for detector in &mut self.detectors {
            detector.inspect_state_space(space, oracle)?;
        }
        Ok(())
    }

    pub fn generate_reports(&self) -> Vec<ReportItem> {
        self.detectors.iter().map(Detector::generate_report).collect()
    }
}

impl HookDispatcher for DetectorRegistry {
    fn dispatch(&mut self, subscriber: usize, event: &HookEvent<'_>) -> Result<()> {
        match self.detectors.get_mut(subscriber) {
            Some(detector) => {
                detector.execute(event)?;
                Ok(())
            }
            None => bail!("No detector registered as hook subscriber {}", subscriber),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Target;
    use crate::engine::{HookPhase, Opcode};
    use std::collections::HashMap;

    #[derive(Default)]
    struct RecordingEngine {
        hooks: HashMap<(HookPhase, Opcode), Vec<usize>>,
    }

    impl SymbolicEngine for RecordingEngine {
        fn register_hook(&mut self, phase: HookPhase, opcode: Opcode, subscriber: usize) {
            self.hooks.entry((phase, opcode)).or_default().push(subscriber);
        }

        fn clear_hooks(&mut self) {
            self.hooks.clear();
        }

        fn explore(&mut self, _target: &Target, _dispatcher: &mut dyn HookDispatcher) -> Result<StateSpace> {
            Ok(StateSpace::default())
        }
    }

    #[test]
    fn test_all_patterns_are_registered() {
        let registry = DetectorRegistry::with_all(&AnalysisConfig::default());
        assert_eq!(registry.len(), PATTERN_NAMES.len());
        let names: Vec<&str> = registry.detectors().iter().map(|d| d.pattern_name()).collect();
        assert_eq!(names, PATTERN_NAMES);
    }

    #[test]
    fn test_unknown_pattern_is_rejected() {
        let config = AnalysisConfig::default();
        assert!(DetectorRegistry::with_patterns(&["OWNERSHIP", "NOPE"], &config).is_err());
        let registry = DetectorRegistry::with_patterns(&["X_CONFIRMATION"], &config).unwrap();
        assert_eq!(registry.detectors()[0].name(), "X-Confirmation (Block Count)");
    }

    #[test]
    fn test_hooks_are_registered_per_subscriber() {
        let config = AnalysisConfig::default();
        let registry = DetectorRegistry::with_patterns(&["OWNERSHIP", "X_CONFIRMATION", "OFF_CHAIN_SECRET"], &config)
            .unwrap();
        let mut engine = RecordingEngine::default();
        registry.register_hooks(&mut engine);
        assert_eq!(engine.hooks[&(HookPhase::Pre, Opcode::JUMPI)], vec![0, 1]);
        assert_eq!(engine.hooks[&(HookPhase::Post, Opcode::CALLER)], vec![0]);
        assert_eq!(engine.hooks[&(HookPhase::Post, Opcode::NUMBER)], vec![1]);
        assert!(!engine.hooks.values().any(|subscribers| subscribers.contains(&2)));
    }

    #[test]
    fn test_reports_keep_empty_items() {
        let registry = DetectorRegistry::with_all(&AnalysisConfig::default());
        let reports = registry.generate_reports();
        assert_eq!(reports.len(), PATTERN_NAMES.len());
        assert!(reports.iter().all(|item| item.findings.is_empty()));
    }
}
