use alloy_primitives::{Address, U256};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::engine::disasm::parse_hex;
use crate::error::AnalysisError;

/// Name of the environment variable switching on debug output.
pub const DEBUG_ENV: &str = "EVM_FENDER_DEBUG";

/// Tunables of one analysis run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalysisConfig {
    /// Exploration timeout in seconds.
    pub timeout: u64,
    /// Maximum number of blocks along one path.
    pub max_depth: usize,
    /// How often one jump edge may be taken along a path.
    pub loop_bound: usize,
    /// Per-query budget of the constraint oracle, in seconds.
    pub solver_timeout: u64,
    /// Storage slots at or above this index are treated as hash-derived
    /// (mapping or dynamic array) and never tainted as plain slots.
    pub storage_index_ceiling: U256,
    /// Longest hashed input, in bytes, still considered a secret rather than a
    /// mapping key.
    pub hash_lock_max_length: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            timeout: 60,
            max_depth: 128,
            loop_bound: 3,
            solver_timeout: 10,
            storage_index_ceiling: U256::from(0x1_0000_0000u64),
            hash_lock_max_length: 32,
        }
    }
}

impl AnalysisConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn solver_timeout(&self) -> Duration {
        Duration::from_secs(self.solver_timeout)
    }
}

/// Whether debug output was requested through [`DEBUG_ENV`].
pub fn debug_mode() -> bool {
    std::env::var(DEBUG_ENV)
        .unwrap_or_else(|_| "false".to_string())
        .parse::<bool>()
        .unwrap_or(false)
}

/// What to analyze.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Creation bytecode; the constructor runs first, then the code it returns.
    Creation { code: Vec<u8> },
    /// Runtime code of a contract deployed at `address`.
    Deployed { address: Address, code: Vec<u8> },
}

impl Target {
    /// Validates the caller's choice before anything is explored.
    pub fn resolve(
        creation_code: Option<Vec<u8>>,
        address: Option<Address>,
        runtime_code: Option<Vec<u8>>,
    ) -> Result<Target, AnalysisError> {
        match (creation_code, address) {
            (Some(_), Some(_)) => Err(AnalysisError::AmbiguousTarget),
            (None, None) => Err(AnalysisError::MissingTarget),
            (Some(code), None) if code.is_empty() => {
                Err(AnalysisError::InvalidBytecode("empty creation code".to_string()))
            }
            (Some(code), None) => Ok(Target::Creation { code }),
            (None, Some(address)) => match runtime_code {
                Some(code) if !code.is_empty() => Ok(Target::Deployed { address, code }),
                _ => Err(AnalysisError::MissingRuntimeCode(address)),
            },
        }
    }

    pub fn creation_hex(text: &str) -> Result<Target, AnalysisError> {
        Self::resolve(Some(parse_hex(text)?), None, None)
    }

    pub fn deployed_hex(address: Address, text: &str) -> Result<Target, AnalysisError> {
        Self::resolve(None, Some(address), Some(parse_hex(text)?))
    }

    pub fn code(&self) -> &[u8] {
        match self {
            Target::Creation { code } | Target::Deployed { code, .. } => code,
        }
    }

    pub fn address(&self) -> Option<Address> {
        match self {
            Target::Deployed { address, .. } => Some(*address),
            Target::Creation { .. } => None,
        }
    }
}
