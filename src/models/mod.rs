pub mod markdown;

use alloy_primitives::U256;
use anyhow::{Context, Result};
use serde::{Serialize, Serializer};
use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

/// One function exhibiting a pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub function_name: String,
    /// Storage slot holding the guarding value, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_address: Option<U256>,
    /// Content of `storage_address` on the deployed contract, as hex.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_content: Option<String>,
}

impl Finding {
    pub fn new(function_name: &str) -> Self {
        Finding {
            function_name: function_name.to_string(),
            storage_address: None,
            storage_content: None,
        }
    }

    pub fn with_storage_address(mut self, storage_address: Option<U256>) -> Self {
        self.storage_address = storage_address;
        self
    }
}

/// Findings of one detector.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportItem {
    pub pattern_name: String,
    pub title: String,
    pub description: String,
    pub findings: Vec<Finding>,
}

impl ReportItem {
    pub fn new(title: &str, description: &str, pattern_name: &str) -> Self {
        ReportItem {
            pattern_name: pattern_name.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            findings: Vec::new(),
        }
    }

    pub fn add_finding(&mut self, finding: Finding) {
        self.findings.push(finding);
    }
}

/// Outcome of one analysis run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    /// Seconds since the Unix epoch.
    pub start_time: f64,
    pub end_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract_code: Option<String>,
    /// Items without findings are kept here and left out when serializing.
    #[serde(serialize_with = "serialize_non_empty")]
    pub items: Vec<ReportItem>,
}

fn serialize_non_empty<S: Serializer>(items: &[ReportItem], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(items.iter().filter(|item| !item.findings.is_empty()))
}

/// Current wall-clock time as fractional seconds since the Unix epoch.
pub fn timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

impl Report {
    pub fn new(start_time: f64) -> Self {
        Report {
            start_time,
            end_time: start_time,
            contract_address: None,
            contract_code: None,
            items: Vec::new(),
        }
    }

    pub fn add_item(&mut self, item: ReportItem) {
        self.items.push(item);
    }

    pub fn findings_count(&self) -> usize {
        self.items.iter().map(|item| item.findings.len()).sum()
    }

    pub fn has_findings(&self) -> bool {
        self.findings_count() > 0
    }

    /// Items that carry at least one finding.
    pub fn reported_items(&self) -> impl Iterator<Item = &ReportItem> {
        self.items.iter().filter(|item| !item.findings.is_empty())
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize report")
    }

    pub fn to_text(&self) -> String {
        let mut output = String::new();
        if let Some(address) = &self.contract_address {
            let _ = writeln!(output, "Contract: {}", address);
        }
        let _ = writeln!(output, "Analysis time: {:.2}s", self.end_time - self.start_time);

        if !self.has_findings() {
            output.push_str("No patterns detected.\n");
            return output;
        }
        for item in self.reported_items() {
            let _ = writeln!(output, "\n{} [{}]", item.title, item.pattern_name);
            for finding in &item.findings {
                let _ = write!(output, "  - {}", finding.function_name);
                if let Some(slot) = finding.storage_address {
                    let _ = write!(output, " (storage slot 0x{:x}", slot);
                    if let Some(content) = &finding.storage_content {
                        let _ = write!(output, " = {}", content);
                    }
                    output.push(')');
                }
                output.push('\n');
            }
        }
        output
    }
}
