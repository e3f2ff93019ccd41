use anyhow::{bail, Context, Result};
use std::path::Path;

use super::Report;

/// Represents a markdown document with sections and content
pub struct MarkdownDocument {
    title: String,
    sections: Vec<MarkdownSection>,
}

/// Represents a section in a markdown document
pub struct MarkdownSection {
    heading: String,
    level: usize,
    content: String,
    subsections: Vec<MarkdownSection>,
}

/// Represents a table in markdown format
pub struct MarkdownTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl MarkdownDocument {
    /// Empty document rendered under a level one `title` heading.
    pub fn new(title: &str) -> Self {
        MarkdownDocument {
            title: title.to_string(),
            sections: Vec::new(),
        }
    }

    /// Appends a top-level section; sections render in insertion order.
    pub fn add_section(&mut self, section: MarkdownSection) {
        self.sections.push(section);
    }

    /// Markdown text of the title and every section.
    pub fn render(&self) -> String {
        let mut output = format!("# {}\n\n", self.title);
        for section in &self.sections {
            output.push_str(&section.render());
            output.push_str("\n\n");
        }
        output
    }

    /// Writes the rendered document to `path`, replacing any existing file.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.render())
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

impl MarkdownSection {
    /// Section whose heading gets `level` leading `#`s.
    pub fn new(heading: &str, level: usize) -> Self {
        MarkdownSection {
            heading: heading.to_string(),
            level,
            content: String::new(),
            subsections: Vec::new(),
        }
    }

    /// Appends a paragraph, separated from earlier content by a blank line.
    pub fn add_content(&mut self, content: &str) {
        if !self.content.is_empty() {
            self.content.push_str("\n\n");
        }
        self.content.push_str(content);
    }

    /// Appends a fenced code block tagged with `language`.
    pub fn add_code_block(&mut self, code: &str, language: &str) {
        let code_block = format!("```{}\n{}\n```", language, code);
        self.add_content(&code_block);
    }

    /// Nests `subsection` after this section's own content. Its level is kept
    /// as given.
    pub fn add_subsection(&mut self, subsection: MarkdownSection) {
        self.subsections.push(subsection);
    }

    /// Heading, content and subsections, without trailing blank lines.
    pub fn render(&self) -> String {
        let heading_prefix = "#".repeat(self.level);
        let mut output = format!("{} {}\n\n", heading_prefix, self.heading);

        if !self.content.is_empty() {
            output.push_str(&self.content);
            output.push_str("\n\n");
        }

        for subsection in &self.subsections {
            output.push_str(&subsection.render());
            output.push_str("\n\n");
        }

        output.trim_end().to_string()
    }
}

impl MarkdownTable {
    /// Table with the given column headers and no rows.
    pub fn new(headers: Vec<String>) -> Self {
        MarkdownTable {
            headers,
            rows: Vec::new(),
        }
    }

    /// Appends a row. Fails unless it has one cell per column.
    pub fn add_row(&mut self, row: Vec<String>) -> Result<()> {
        if row.len() != self.headers.len() {
            bail!("Row has {} cells, table has {} columns", row.len(), self.headers.len());
        }
        self.rows.push(row);
        Ok(())
    }

    /// Pipe table text, or an empty string for a table without columns.
    pub fn render(&self) -> String {
        if self.headers.is_empty() {
            return String::new();
        }

        let mut output = String::from("|");
        for header in &self.headers {
            output.push_str(&format!(" {} |", header));
        }
        output.push_str("\n|");
        for _ in &self.headers {
            output.push_str(" --- |");
        }
        output.push('\n');

        for row in &self.rows {
            output.push('|');
            for cell in row {
                output.push_str(&format!(" {} |", cell));
            }
            output.push('\n');
        }

        output
    }
}

/// Renders `report` as a markdown document, optionally saving it to `output_path`.
pub fn create_analysis_report(contract_name: &str, report: &Report, output_path: Option<&Path>) -> Result<String> {
    let mut doc = MarkdownDocument::new(&format!("EVM Fender Analysis: {}", contract_name));

    let mut summary = MarkdownSection::new("Summary", 2);
    if let Some(address) = &report.contract_address {
        summary.add_content(&format!("**Contract**: `{}`", address));
    }
    summary.add_content(&format!(
        "Analysis time: {:.2}s. Total findings: {}",
        report.end_time - report.start_time,
        report.findings_count()
    ));

    if report.has_findings() {
        let mut table = MarkdownTable::new(vec!["Pattern".to_string(), "Functions".to_string()]);
        for item in report.reported_items() {
            table.add_row(vec![item.title.clone(), item.findings.len().to_string()])?;
        }
        summary.add_content(&table.render());
    }
    doc.add_section(summary);

    let mut details = MarkdownSection::new("Detected Patterns", 2);
    if !report.has_findings() {
        details.add_content("No patterns detected.");
    }
    for item in report.reported_items() {
        let mut section = MarkdownSection::new(&format!("{} (`{}`)", item.title, item.pattern_name), 3);
        section.add_content(&item.description);

        let mut table = MarkdownTable::new(vec![
            "Function".to_string(),
            "Storage slot".to_string(),
            "Storage content".to_string(),
        ]);
        for finding in &item.findings {
            table.add_row(vec![
                format!("`{}`", finding.function_name),
                finding
                    .storage_address
                    .map(|slot| format!("0x{:x}", slot))
                    .unwrap_or_else(|| "-".to_string()),
                finding.storage_content.clone().unwrap_or_else(|| "-".to_string()),
            ])?;
        }
        section.add_content(&table.render());
        details.add_subsection(section);
    }
    doc.add_section(details);

    if let Some(code) = &report.contract_code {
        let mut contract = MarkdownSection::new("Analyzed Bytecode", 2);
        contract.add_code_block(code, "text");
        doc.add_section(contract);
    }

    if let Some(path) = output_path {
        doc.save_to_file(path)?;
    }

    Ok(doc.render())
}
