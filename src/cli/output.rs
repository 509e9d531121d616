//! Output formatting for CLI commands.
//!
//! Every formatter returns a string; the binary decides where it goes.

use colored::Colorize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{ConfigHasher, ValidationResult};
use crate::drivers::ResourceSummary;
use crate::planner::{DiffResult, DiffType};
use crate::reconciler::ReconciliationResult;
use crate::state::ReconcileState;

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan row for table display.
#[derive(Tabled)]
struct PlanRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Remote object row for table display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "ID")]
    id: i64,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Owner")]
    owner: String,
    #[tabled(rename = "Mode")]
    permissions: String,
    #[tabled(rename = "Status")]
    status: String,
}

/// State record row for table display.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Resource")]
    key: String,
    #[tabled(rename = "ID")]
    id: i64,
    #[tabled(rename = "Hash")]
    hash: String,
    #[tabled(rename = "Pending")]
    pending: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true for machine-readable output.
    #[must_use]
    pub const fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &DiffResult, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(plan).unwrap_or_default(),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    fn format_plan_text(plan: &DiffResult, detailed: bool) -> String {
        if !plan.has_changes() {
            return format!(
                "{} No changes required - resources match the configuration.\n",
                "✓".green()
            );
        }

        let mut output = String::from("\nPlan\n\n");

        let rows: Vec<PlanRow> = plan
            .actionable_diffs()
            .iter()
            .enumerate()
            .map(|(i, d)| PlanRow {
                index: i + 1,
                action: Self::format_diff_type(d.diff_type),
                resource: d.key.clone(),
                id: d.id.map_or_else(|| String::from("-"), |id| id.to_string()),
                reason: if detailed {
                    d.details.join(", ")
                } else {
                    Self::truncate(&d.details.join(", "), 40)
                },
            })
            .collect();

        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to destroy\n",
            plan.creates.to_string().green(),
            plan.updates.to_string().yellow(),
            plan.replaces.to_string().magenta(),
            plan.deletes.to_string().red()
        );

        output
    }

    /// Formats a reconciliation result.
    #[must_use]
    pub fn format_reconciliation(&self, result: &ReconciliationResult) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(result).unwrap_or_default(),
            OutputFormat::Text => {
                let status = if result.success {
                    format!("{} Reconciliation successful", "✓".green())
                } else {
                    format!("{} Reconciliation failed", "✗".red())
                };

                let mut output = format!("{status}\n\n");
                let _ = writeln!(output, "   Created: {}", result.created);
                let _ = writeln!(output, "   Updated: {}", result.updated);
                let _ = writeln!(output, "   Replaced: {}", result.replaced);
                let _ = writeln!(output, "   Deleted: {}", result.deleted);
                let _ = writeln!(output, "   Unchanged: {}", result.unchanged);

                if !result.resources.is_empty() {
                    output.push('\n');
                    output.push_str(&Self::resource_table(&result.resources));
                    output.push('\n');
                }

                if !result.errors.is_empty() {
                    let _ = write!(output, "\n{} Errors:\n", "⚠".yellow());
                    for error in &result.errors {
                        let _ = writeln!(output, "   - {error}");
                    }
                }

                output
            }
        }
    }

    /// Formats remote objects, e.g. the result of `read` or account lookups.
    #[must_use]
    pub fn format_resources(&self, resources: &[ResourceSummary]) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(resources).unwrap_or_default(),
            OutputFormat::Text if resources.is_empty() => String::from("   Nothing found.\n"),
            OutputFormat::Text => {
                let mut output = Self::resource_table(resources);
                output.push('\n');
                output
            }
        }
    }

    fn resource_table(resources: &[ResourceSummary]) -> String {
        let rows: Vec<ResourceRow> = resources
            .iter()
            .map(|r| ResourceRow {
                kind: r.kind.label().to_string(),
                id: r.id,
                name: Self::truncate(&r.name, 30),
                owner: if r.uname.is_empty() {
                    r.gname.clone()
                } else {
                    format!("{}:{}", r.uname, r.gname)
                },
                permissions: r.permissions.clone().unwrap_or_else(|| String::from("-")),
                status: if r.needs_replacement {
                    r.status.red().to_string()
                } else {
                    r.status.clone()
                },
            })
            .collect();

        Table::new(rows).to_string()
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::json!({
                "valid": result.is_valid(),
                "errors": result.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "warnings": result.warnings,
            })
            .to_string(),
            OutputFormat::Text => {
                let mut output = if result.is_valid() {
                    format!("{} Configuration is valid.\n", "✓".green())
                } else {
                    format!("{} Configuration is invalid:\n", "✗".red())
                };
                for error in &result.errors {
                    let _ = writeln!(output, "   - {error}");
                }
                if show_warnings && result.warning_count() > 0 {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }
                output
            }
        }
    }

    /// Formats applied state.
    #[must_use]
    pub fn format_state(&self, state: &ReconcileState) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(state).unwrap_or_default(),
            OutputFormat::Text => {
                let hasher = ConfigHasher::new();
                let mut output = String::new();

                let _ = write!(output, "\nState: {}\n\n", state.endpoint);
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Config hash: {}", hasher.short_hash(&state.config_hash));
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Resources: {}", state.resources.len());

                if !state.resources.is_empty() {
                    let rows: Vec<RecordRow> = state
                        .resources
                        .iter()
                        .map(|(key, r)| RecordRow {
                            key: key.clone(),
                            id: r.id,
                            hash: hasher.short_hash(&r.config_hash),
                            pending: r.pending.as_ref().map_or_else(
                                || String::from("-"),
                                |p| {
                                    p.applied
                                        .iter()
                                        .map(ToString::to_string)
                                        .collect::<Vec<_>>()
                                        .join(", ")
                                        .yellow()
                                        .to_string()
                                },
                            ),
                            updated: r.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                        })
                        .collect();
                    output.push('\n');
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓" } else { "✗" };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({})",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.resources.join(", ")
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats a diff type with color.
    fn format_diff_type(diff_type: DiffType) -> String {
        match diff_type {
            DiffType::Create => "+create".green().to_string(),
            DiffType::Update => "~update".yellow().to_string(),
            DiffType::Replace => "-/+replace".magenta().to_string(),
            DiffType::Delete => "-delete".red().to_string(),
            DiffType::NoChange => "noop".dimmed().to_string(),
        }
    }

    /// Truncates a string to at most `max_len` characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::ResourceKind;

    fn summary() -> ResourceSummary {
        ResourceSummary {
            kind: ResourceKind::Image,
            id: 7,
            name: String::from("base"),
            uname: String::from("oneadmin"),
            gname: String::from("oneadmin"),
            permissions: Some(String::from("640")),
            status: String::from("ready"),
            needs_replacement: false,
            attributes: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_truncate() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("a-very-long-name", 8), "a-ver...");
    }

    #[test]
    fn test_empty_plan_text() {
        colored::control::set_override(false);
        let output = OutputFormatter::new(OutputFormat::Text)
            .format_plan(&DiffResult::default(), false);
        assert!(output.contains("No changes required"));
    }

    #[test]
    fn test_resources_as_json() {
        let output = OutputFormatter::new(OutputFormat::Json).format_resources(&[summary()]);
        let parsed: serde_json::Value = serde_json::from_str(&output).expect("json");
        assert_eq!(parsed[0]["id"], 7);
        assert_eq!(parsed[0]["kind"], "image");
    }

    #[test]
    fn test_resources_as_table() {
        colored::control::set_override(false);
        let output = OutputFormatter::new(OutputFormat::Text).format_resources(&[summary()]);
        assert!(output.contains("oneadmin:oneadmin"));
        assert!(output.contains("640"));
    }
}
