pub mod annotation;
pub mod hash_lock;
pub mod multiple_authorization;
pub mod off_chain_secret;
pub mod ownership;
pub mod registry;
pub mod roles;
pub mod single_owner;
pub mod x_confirmation;

#[cfg(test)]
pub mod test_utils;

pub use annotation::{Actor, Annotation, AnnotationSet, ComparedItem};
pub use hash_lock::HashLock;
pub use multiple_authorization::MultipleAuthorization;
pub use off_chain_secret::OffChainSecret;
pub use ownership::Ownership;
pub use registry::DetectorRegistry;
pub use roles::RoleBasedAccessControl;
pub use single_owner::SingleOwner;
pub use x_confirmation::XConfirmation;

// Common traits and types for analyzers
use alloy_primitives::U256;
use anyhow::Result;
use std::collections::HashSet;
use tracing::{debug, info};

use crate::config::AnalysisConfig;
use crate::engine::{ConstraintOracle, HookEvent, HookPhase, Opcode, StackValue, StateSpace};
pub use crate::models::{Finding, ReportItem};

/// Static identity of a detector.
pub trait Analyzer {
    /// Stable identifier, e.g. `OWNERSHIP`.
    fn pattern_name(&self) -> &'static str;
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
}

/// Opcodes a detector observes before and after they execute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Hooks {
    pub pre: &'static [Opcode],
    pub post: &'static [Opcode],
}

impl Hooks {
    pub fn iter(&self) -> impl Iterator<Item = (HookPhase, Opcode)> + '_ {
        let pre = self.pre.iter().map(|op| (HookPhase::Pre, *op));
        let post = self.post.iter().map(|op| (HookPhase::Post, *op));
        pre.chain(post)
    }
}

/// Detector fed by opcode hooks while the engine explores.
pub trait HookAnalyzer: Analyzer {
    fn hooks(&self) -> Hooks;

    /// Runs once per explored state per declared hook. Returns a finding when
    /// the pattern was recognized in the current function.
    fn observe(&mut self, event: &HookEvent<'_>) -> Result<Option<Finding>>;

    /// Drops scratch state accumulated during a run.
    fn clear(&mut self) {}
}

/// Detector scanning the explored state space after exploration.
pub trait GraphAnalyzer: Analyzer {
    fn analyze(&self, space: &StateSpace, oracle: &dyn ConstraintOracle) -> Result<Vec<Finding>>;
}

pub enum Strategy {
    Ownership(Ownership),
    HashLock(HashLock),
    Roles(RoleBasedAccessControl),
    MultipleAuthorization(MultipleAuthorization),
    XConfirmation(XConfirmation),
    OffChainSecret(OffChainSecret),
    SingleOwner(SingleOwner),
}

impl Strategy {
    fn analyzer(&self) -> &dyn Analyzer {
        match self {
            Strategy::Ownership(s) => s,
            Strategy::HashLock(s) => s,
            Strategy::Roles(s) => s,
            Strategy::MultipleAuthorization(s) => s,
            Strategy::XConfirmation(s) => s,
            Strategy::OffChainSecret(s) => s,
            Strategy::SingleOwner(s) => s,
        }
    }

    fn hook_analyzer(&mut self) -> Option<&mut dyn HookAnalyzer> {
        match self {
            Strategy::Ownership(s) => Some(s),
            Strategy::HashLock(s) => Some(s),
            Strategy::Roles(s) => Some(s),
            Strategy::MultipleAuthorization(s) => Some(s),
            Strategy::XConfirmation(s) => Some(s),
            Strategy::OffChainSecret(_) | Strategy::SingleOwner(_) => None,
        }
    }

    fn graph_analyzer(&self) -> Option<&dyn GraphAnalyzer> {
        match self {
            Strategy::OffChainSecret(s) => Some(s),
            Strategy::SingleOwner(s) => Some(s),
            _ => None,
        }
    }
}

/// Identifiers of every pattern the crate detects, in report order.
pub const PATTERN_NAMES: &[&str] = &[
    ownership::PATTERN_NAME,
    hash_lock::PATTERN_NAME,
    roles::PATTERN_NAME,
    multiple_authorization::PATTERN_NAME,
    x_confirmation::PATTERN_NAME,
    off_chain_secret::PATTERN_NAME,
    single_owner::PATTERN_NAME,
];

/// A strategy together with the results of the current run.
///
/// Each function is reported at most once: after the first finding in a
/// function, further states of that function are skipped.
pub struct Detector {
    strategy: Strategy,
    cache: HashSet<String>,
    findings: Vec<Finding>,
}

impl Detector {
    pub fn new(strategy: Strategy) -> Self {
        Detector {
            strategy,
            cache: HashSet::new(),
            findings: Vec::new(),
        }
    }

    pub fn from_pattern(pattern_name: &str, config: &AnalysisConfig) -> Option<Self> {
        let strategy = match pattern_name {
            ownership::PATTERN_NAME => Strategy::Ownership(Ownership::new(config.storage_index_ceiling)),
            hash_lock::PATTERN_NAME => Strategy::HashLock(HashLock::new(config.hash_lock_max_length)),
            roles::PATTERN_NAME => Strategy::Roles(RoleBasedAccessControl::default()),
            multiple_authorization::PATTERN_NAME => {
                Strategy::MultipleAuthorization(MultipleAuthorization::new(config.storage_index_ceiling))
            }
            x_confirmation::PATTERN_NAME => Strategy::XConfirmation(XConfirmation),
            off_chain_secret::PATTERN_NAME => Strategy::OffChainSecret(OffChainSecret),
            single_owner::PATTERN_NAME => Strategy::SingleOwner(SingleOwner),
            _ => return None,
        };
        Some(Self::new(strategy))
    }

    pub fn pattern_name(&self) -> &'static str {
        self.strategy.analyzer().pattern_name()
    }

    pub fn name(&self) -> &'static str {
        self.strategy.analyzer().name()
    }

    pub fn description(&self) -> &'static str {
        self.strategy.analyzer().description()
    }

    pub fn hooks(&self) -> Hooks {
        match &self.strategy {
            Strategy::Ownership(s) => s.hooks(),
            Strategy::HashLock(s) => s.hooks(),
            Strategy::Roles(s) => s.hooks(),
            Strategy::MultipleAuthorization(s) => s.hooks(),
            Strategy::XConfirmation(s) => s.hooks(),
            Strategy::OffChainSecret(_) | Strategy::SingleOwner(_) => Hooks::default(),
        }
    }

    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    /// Feeds one hook invocation to the strategy.
    pub fn execute(&mut self, event: &HookEvent<'_>) -> Result<Option<Finding>> {
        if self.cache.contains(event.state.function_name) {
            return Ok(None);
        }
        let name = self.name();
        let Some(strategy) = self.strategy.hook_analyzer() else {
            return Ok(None);
        };
        debug!("Executing analysis strategy {}", name);
        let finding = strategy.observe(event)?;
        if let Some(finding) = &finding {
            self.record(finding.clone());
        }
        Ok(finding)
    }

    /// Runs graph-level strategies over the explored state space.
    pub fn inspect_state_space(&mut self, space: &StateSpace, oracle: &dyn ConstraintOracle) -> Result<()> {
        let Some(strategy) = self.strategy.graph_analyzer() else {
            return Ok(());
        };
        debug!("Executing analysis strategy {}", strategy.name());
        for finding in strategy.analyze(space, oracle)? {
            if !self.cache.contains(&finding.function_name) {
                self.record(finding);
            }
        }
        Ok(())
    }

    fn record(&mut self, finding: Finding) {
        info!(
            "Analysis strategy {} got a hit in function {}",
            self.name(),
            finding.function_name
        );
        self.cache.insert(finding.function_name.clone());
        self.findings.push(finding);
    }

    /// Clears everything a run accumulated. Static metadata is kept.
    pub fn reset(&mut self) {
        self.cache.clear();
        self.findings.clear();
        if let Some(strategy) = self.strategy.hook_analyzer() {
            strategy.clear();
        }
    }

    pub fn generate_report(&self) -> ReportItem {
        let mut item = ReportItem::new(self.name(), self.description(), self.pattern_name());
        for finding in &self.findings {
            item.add_finding(finding.clone());
        }
        item
    }
}

/// Slot of the first `Storage` annotation of `value` with a known index.
pub(crate) fn storage_index(value: &StackValue) -> Option<U256> {
    value.find_map(Annotation::storage_index)
}

/// Like [`storage_index`], restricted to slots below `ceiling`. Slots above it
/// are derived from hashes and belong to mappings or dynamic arrays.
pub(crate) fn plain_storage_index(value: &StackValue, ceiling: U256) -> Option<U256> {
    value.find_map(|a| a.storage_index().filter(|index| *index < ceiling))
}

pub(crate) fn has_storage(value: &StackValue) -> bool {
    value.annotations().iter().any(Annotation::is_storage)
}

/// Slot read by the `SLOAD` a post hook follows, when it was concrete.
pub(crate) fn loaded_slot(event: &HookEvent<'_>) -> Result<Option<U256>> {
    match event.previous {
        Some(frame) => Ok(frame.peek(0)?.value()),
        None => Ok(None),
    }
}

/// Opcode whose execution a post hook follows.
pub(crate) fn executed(event: &HookEvent<'_>) -> Option<Opcode> {
    event.previous.map(|frame| frame.instruction.opcode)
}
