pub mod analysis;
pub mod analyzers;
pub mod config;
pub mod engine;
pub mod error;
pub mod models;

use alloy_primitives::Address;
use anyhow::{Context, Result};
use colored::*;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::engine::StorageReader;

// Re-export types that users of the crate will need
pub use crate::analysis::SymbolicAnalysis;
pub use crate::analyzers::{Detector, DetectorRegistry, PATTERN_NAMES};
pub use crate::config::{AnalysisConfig, Target};
pub use crate::error::AnalysisError;
pub use crate::models::{Finding, Report, ReportItem};

/// Registry with the detectors for `patterns`, or every detector when empty.
pub fn build_registry(config: &AnalysisConfig, patterns: &[String]) -> Result<DetectorRegistry> {
    if patterns.is_empty() {
        Ok(DetectorRegistry::with_all(config))
    } else {
        DetectorRegistry::with_patterns(patterns, config)
    }
}

/// Analyze a file holding hex-encoded creation bytecode
///
/// Returns a Result containing either:
/// - Ok(Report) - The report of the run, items without findings included
/// - Err(anyhow::Error) - An error if the file could not be read or analysis failed
pub fn analyze_bytecode_file(path: &Path, config: &AnalysisConfig, patterns: &[String]) -> Result<Report> {
    let target = Target::creation_hex(&read_hex_file(path)?)
        .with_context(|| format!("Invalid bytecode in {}", path.display()))?;
    let mut registry = build_registry(config, patterns)?;
    let mut analysis = SymbolicAnalysis::new(config.clone());
    analysis.execute(&target, &mut registry, None)
}

/// Analyze the runtime code of a contract deployed at `address`
///
/// When `storage` is given, every finding naming a storage slot gets the
/// slot's content.
pub fn analyze_deployed_file(
    path: &Path,
    address: Address,
    config: &AnalysisConfig,
    patterns: &[String],
    storage: Option<&dyn StorageReader>,
) -> Result<Report> {
    let target = Target::deployed_hex(address, &read_hex_file(path)?)
        .with_context(|| format!("Invalid runtime code in {}", path.display()))?;
    let mut registry = build_registry(config, patterns)?;
    let mut analysis = SymbolicAnalysis::new(config.clone());
    analysis.execute(&target, &mut registry, storage)
}

/// Analyze every `*.bin` file below `dir` as creation bytecode
///
/// One registry serves the whole batch and is reset before every file.
pub fn analyze_bytecode_dir(dir: &Path, config: &AnalysisConfig, patterns: &[String]) -> Result<Vec<(PathBuf, Report)>> {
    let mut registry = build_registry(config, patterns)?;
    let mut analysis = SymbolicAnalysis::new(config.clone());
    let mut reports = Vec::new();

    for path in find_bytecode_files(dir) {
        let target = Target::creation_hex(&read_hex_file(&path)?)
            .with_context(|| format!("Invalid bytecode in {}", path.display()))?;
        let report = analysis.execute(&target, &mut registry, None)?;
        reports.push((path, report));
    }

    Ok(reports)
}

fn read_hex_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

// Helper function to find all bytecode files in a directory
fn find_bytecode_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.path().extension().map_or(false, |ext| ext == "bin"))
        .map(|entry| entry.path().to_path_buf())
        .collect();
    files.sort();
    files
}

/// Print a status line per detector of `report`, with the findings of those
/// that got a hit
pub fn print_summary(report: &Report) {
    let debug_mode = config::debug_mode();

    for item in &report.items {
        if debug_mode {
            println!("\nRan {} ({})", item.title.bold(), item.pattern_name);
            println!("{}", item.description);
        }

        if item.findings.is_empty() {
            if debug_mode {
                println!("{}", "✓ No issues found".green());
            } else {
                println!("{} {}: {}", "✓".green(), item.title, "No issues found".green());
            }
            continue;
        }

        println!("{} {}: {} issues found", "❌".red(), item.title, item.findings.len());
        for (i, finding) in item.findings.iter().enumerate() {
            match (finding.storage_address, &finding.storage_content) {
                (Some(slot), Some(content)) => println!(
                    "  {}. {} guarded by storage slot 0x{:x} = {}",
                    i + 1,
                    finding.function_name.yellow(),
                    slot,
                    content
                ),
                (Some(slot), None) => println!(
                    "  {}. {} guarded by storage slot 0x{:x}",
                    i + 1,
                    finding.function_name.yellow(),
                    slot
                ),
                _ => println!("  {}. {}", i + 1, finding.function_name.yellow()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzers::test_utils::{creation_code, Asm};
    use crate::engine::Opcode;
    use alloy_primitives::hex;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("evm_fender_{}_{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn guarded_creation() -> String {
        let runtime = Asm::new().owner_guard(0, true).op(Opcode::STOP).build();
        hex::encode(creation_code(&runtime))
    }

    #[test]
    fn test_unknown_pattern_is_an_error() {
        let result = analyze_bytecode_file(
            Path::new("missing.bin"),
            &AnalysisConfig::default(),
            &["NOT_A_PATTERN".to_string()],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_bytecode_file() {
        let dir = temp_dir("file");
        let path = dir.join("owned.bin");
        std::fs::write(&path, format!("0x{}\n", guarded_creation())).unwrap();

        let report = analyze_bytecode_file(&path, &AnalysisConfig::default(), &["OWNERSHIP".to_string()]).unwrap();
        assert_eq!(report.items.len(), 1);
        assert_eq!(report.findings_count(), 1);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_bytecode_dir_only_reads_bin_files() {
        let dir = temp_dir("dir");
        std::fs::create_dir_all(dir.join("nested")).unwrap();
        std::fs::write(dir.join("a.bin"), guarded_creation()).unwrap();
        std::fs::write(dir.join("nested").join("b.bin"), "600060005500").unwrap();
        std::fs::write(dir.join("notes.txt"), "not bytecode").unwrap();

        let reports = analyze_bytecode_dir(&dir, &AnalysisConfig::default(), &[]).unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports[0].0.ends_with("a.bin"));
        assert!(reports[0].1.has_findings());
        assert!(!reports[1].1.has_findings());
        std::fs::remove_dir_all(dir).unwrap();
    }
}
