use alloy_primitives::{Address, U256};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;

/// Reads live storage of a deployed contract.
pub trait StorageReader {
    fn read_storage(&self, address: Address, slot: U256) -> Result<U256>;
}

/// Storage snapshot held in memory, e.g. dumped from a node beforehand.
#[derive(Debug, Clone, Default)]
pub struct StaticStorage {
    slots: HashMap<U256, U256>,
}

impl StaticStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_slot(mut self, slot: U256, value: U256) -> Self {
        self.slots.insert(slot, value);
        self
    }

    /// Loads a JSON object mapping slots to values, both given as decimal or
    /// `0x`-prefixed hex strings.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read storage snapshot {}", path.display()))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let raw: HashMap<String, String> =
            serde_json::from_str(content).context("Storage snapshot must be a JSON object of strings")?;
        let mut storage = Self::new();
        for (slot, value) in raw {
            storage
                .slots
                .insert(parse_word(&slot)?, parse_word(&value)?);
        }
        Ok(storage)
    }
}

fn parse_word(text: &str) -> Result<U256> {
    let text = text.trim();
    let parsed = match text.strip_prefix("0x") {
        Some(hex) => U256::from_str_radix(hex, 16),
        None => U256::from_str_radix(text, 10),
    };
    parsed.map_err(|e| anyhow::anyhow!("Invalid storage word '{}': {}", text, e))
}

impl StorageReader for StaticStorage {
    fn read_storage(&self, _address: Address, slot: U256) -> Result<U256> {
        Ok(self.slots.get(&slot).copied().unwrap_or(U256::ZERO))
    }
}
