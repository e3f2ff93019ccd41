use alloy_primitives::Address;
use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use colored::*;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

use evm_fender::config::DEBUG_ENV;
use evm_fender::engine::{StaticStorage, StorageReader};
use evm_fender::models::markdown::create_analysis_report;
use evm_fender::{
    analyze_bytecode_dir, analyze_bytecode_file, analyze_deployed_file, print_summary, AnalysisConfig, Report,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
/// Access-control pattern detector for EVM bytecode
///
/// Explores the bytecode symbolically and reports functions guarded by
/// ownership checks, hash locks, roles, multiple authorization, block
/// confirmations and off-chain secrets.
struct Args {
    /// Hex-encoded creation bytecode to analyze
    #[arg(short, long, group = "target")]
    bin: Option<PathBuf>,

    /// Hex-encoded runtime code of a deployed contract, requires --address
    #[arg(short, long, group = "target", requires = "address")]
    runtime: Option<PathBuf>,

    /// Directory whose *.bin files are analyzed as creation bytecode
    #[arg(short, long, group = "target")]
    dir: Option<PathBuf>,

    /// Address the runtime code is deployed at
    #[arg(short, long)]
    address: Option<Address>,

    /// JSON object mapping storage slots to values of the deployed contract
    #[arg(short, long, requires = "runtime")]
    storage: Option<PathBuf>,

    /// JSON file with analysis settings
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Only run the given pattern(s), e.g. OWNERSHIP
    #[arg(short, long = "pattern", action = ArgAction::Append)]
    patterns: Vec<String>,

    /// Exploration timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Maximum number of blocks along one path
    #[arg(long)]
    max_depth: Option<usize>,

    /// Print the report as JSON instead of status lines
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,

    /// Write a Markdown report to this file (a directory with --dir)
    #[arg(long)]
    markdown: Option<PathBuf>,

    /// Show detailed debug output
    #[arg(long, action = ArgAction::SetTrue)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Set the debug mode for the library
    if args.debug {
        std::env::set_var(DEBUG_ENV, "true");
    }
    init_tracing(evm_fender::config::debug_mode());

    let mut config = match &args.config {
        Some(path) => AnalysisConfig::from_json_file(path)?,
        None => AnalysisConfig::default(),
    };
    if let Some(timeout) = args.timeout {
        config.timeout = timeout;
    }
    if let Some(max_depth) = args.max_depth {
        config.max_depth = max_depth;
    }

    let reports: Vec<(PathBuf, Report)> = if let Some(path) = &args.bin {
        vec![(path.clone(), analyze_bytecode_file(path, &config, &args.patterns)?)]
    } else if let Some(path) = &args.runtime {
        let Some(address) = args.address else {
            bail!("--runtime requires --address");
        };
        let storage = args.storage.as_deref().map(StaticStorage::from_json_file).transpose()?;
        let reader = storage.as_ref().map(|s| s as &dyn StorageReader);
        vec![(path.clone(), analyze_deployed_file(path, address, &config, &args.patterns, reader)?)]
    } else if let Some(dir) = &args.dir {
        analyze_bytecode_dir(dir, &config, &args.patterns)?
    } else {
        eprintln!("Error: One of --bin, --runtime or --dir must be specified");
        std::process::exit(1);
    };

    if args.json {
        print_json(&reports, args.dir.is_some())?;
    } else {
        for (path, report) in &reports {
            println!("\n{} {}", "Analyzed".bold(), path.display());
            print_summary(report);
        }
    }

    if let Some(markdown) = &args.markdown {
        write_markdown(markdown, &reports, args.dir.as_deref())?;
    }

    // Return success if no findings, otherwise exit with error code
    if reports.iter().any(|(_, report)| report.has_findings()) {
        std::process::exit(1);
    }
    Ok(())
}

fn init_tracing(debug: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "evm_fender=debug" } else { "evm_fender=info" }));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json(reports: &[(PathBuf, Report)], batch: bool) -> Result<()> {
    if batch {
        let by_file: serde_json::Map<String, serde_json::Value> = reports
            .iter()
            .map(|(path, report)| Ok((path.display().to_string(), serde_json::to_value(report)?)))
            .collect::<Result<_, serde_json::Error>>()?;
        println!("{}", serde_json::to_string_pretty(&by_file)?);
    } else {
        for (_, report) in reports {
            println!("{}", report.to_json()?);
        }
    }
    Ok(())
}

fn contract_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// File name of a batch report: the path below `root` without its
/// extension, directories joined by `_`, so equal stems in different
/// directories stay apart.
fn batch_report_name(path: &Path, root: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path).with_extension("");
    let parts: Vec<String> = relative
        .components()
        .map(|part| part.as_os_str().to_string_lossy().into_owned())
        .collect();
    format!("{}.md", parts.join("_"))
}

/// Writes one report to `output`, or with `batch_root` one file per report
/// into the directory `output`.
fn write_markdown(output: &Path, reports: &[(PathBuf, Report)], batch_root: Option<&Path>) -> Result<()> {
    if batch_root.is_some() {
        std::fs::create_dir_all(output)
            .with_context(|| format!("Failed to create report directory {}", output.display()))?;
    }
    for (path, report) in reports {
        let destination = match batch_root {
            Some(root) => output.join(batch_report_name(path, root)),
            None => output.to_path_buf(),
        };
        create_analysis_report(&contract_name(path), report, Some(&destination))?;
        info!("Markdown report written to {}", destination.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_report_names_keep_directories_apart() {
        let root = Path::new("build");
        let first = batch_report_name(&root.join("a").join("Vault.bin"), root);
        let second = batch_report_name(&root.join("b").join("Vault.bin"), root);
        assert_eq!(first, "a_Vault.md");
        assert_eq!(second, "b_Vault.md");
        assert_eq!(batch_report_name(&root.join("Token.bin"), root), "Token.md");
    }

    #[test]
    fn test_batch_markdown_writes_one_file_per_contract() {
        let root = std::env::temp_dir().join(format!("evm_fender_batch_{}", std::process::id()));
        let output = root.join("reports");
        let reports = vec![
            (root.join("a").join("Vault.bin"), Report::new(0.0)),
            (root.join("b").join("Vault.bin"), Report::new(0.0)),
        ];
        write_markdown(&output, &reports, Some(&root)).unwrap();
        assert!(output.join("a_Vault.md").is_file());
        assert!(output.join("b_Vault.md").is_file());
        std::fs::remove_dir_all(root).unwrap();
    }
}
