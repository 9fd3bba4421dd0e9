//! Output formatting for CLI commands.
//!
//! This module renders plans, convergence results, state, and outputs for
//! the terminal in text or JSON form.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::planner::{ActionType, ApplyPlan};
use crate::reconciler::ConvergenceResult;
use crate::state::StackState;
use crate::template::ValidationResult;

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan action row for table display.
#[derive(Tabled)]
struct PlanActionRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Resource state row for table display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Resource")]
    address: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Provider ID")]
    provider_id: String,
    #[tabled(rename = "Hash")]
    hash: String,
}

/// JSON shape for a plan.
#[derive(Serialize)]
struct PlanJson {
    template_hash: String,
    actions: Vec<PlanActionJson>,
    warnings: Vec<String>,
}

/// JSON shape for a single planned action.
#[derive(Serialize)]
struct PlanActionJson {
    action: String,
    resource: String,
    reason: String,
    depends_on: Vec<usize>,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats an apply plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &ApplyPlan) -> String {
        match self.format {
            OutputFormat::Json => {
                serde_json::to_string_pretty(&PlanJson::from(plan)).unwrap_or_default()
            }
            OutputFormat::Text => Self::format_plan_text(plan),
        }
    }

    /// Formats a plan as text.
    fn format_plan_text(plan: &ApplyPlan) -> String {
        if plan.is_converged() {
            return format!(
                "{} No changes required - infrastructure is converged.\n",
                "✓".green()
            );
        }

        let mut output = String::new();

        let _ = write!(output, "\nApply plan\n");
        let _ = write!(output, "   Template hash: {}\n\n", &plan.template_hash[..8.min(plan.template_hash.len())]);

        let rows: Vec<PlanActionRow> = plan
            .actions
            .iter()
            .enumerate()
            .filter(|(_, a)| a.action_type != ActionType::Noop)
            .map(|(i, a)| PlanActionRow {
                index: i + 1,
                action: Self::format_action_type(a.action_type),
                resource: a.address.clone(),
                reason: Self::truncate(&a.reason, 40),
            })
            .collect();

        if !rows.is_empty() {
            let table = Table::new(rows).to_string();
            output.push_str(&table);
            output.push('\n');
        }

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to delete\n",
            plan.count_of(ActionType::Create).to_string().green(),
            plan.count_of(ActionType::Update).to_string().yellow(),
            plan.count_of(ActionType::Delete).to_string().red()
        );

        if !plan.warnings.is_empty() {
            let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
            for warning in &plan.warnings {
                let _ = writeln!(output, "   - {warning}");
            }
        }

        output
    }

    /// Formats a convergence result for display.
    #[must_use]
    pub fn format_convergence(&self, result: &ConvergenceResult) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(result).unwrap_or_default(),
            OutputFormat::Text => Self::format_convergence_text(result),
        }
    }

    /// Formats a convergence result as text.
    fn format_convergence_text(result: &ConvergenceResult) -> String {
        let mut output = String::new();

        if result.success {
            let _ = write!(
                output,
                "\n{} Converged: {} created, {} updated, {} deleted, {} unchanged\n",
                "✓".green(),
                result.created,
                result.updated,
                result.deleted,
                result.unchanged
            );
        } else {
            let _ = write!(
                output,
                "\n{} Apply failed: {} created, {} updated, {} deleted\n",
                "✗".red(),
                result.created,
                result.updated,
                result.deleted
            );
            let _ = writeln!(output, "\nFailures:");
            for failure in &result.failures {
                let _ = writeln!(
                    output,
                    "   - {} [{}] {}: {}",
                    failure.resource.red(),
                    failure.kind,
                    failure.operation,
                    failure.message
                );
            }
        }

        if !result.outputs.is_empty() {
            let _ = writeln!(output, "\nOutputs:");
            for (name, value) in &result.outputs {
                let _ = writeln!(output, "   {name} = {value}");
            }
        }

        output
    }

    /// Formats recorded state for display.
    #[must_use]
    pub fn format_state(&self, state: &StackState) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(state).unwrap_or_default(),
            OutputFormat::Text => Self::format_state_text(state),
        }
    }

    /// Formats state as text.
    fn format_state_text(state: &StackState) -> String {
        let mut output = String::new();

        let _ = write!(
            output,
            "\nStack: {}/{}\n",
            state.project, state.environment
        );
        let _ = write!(
            output,
            "   Last updated: {}\n\n",
            state.last_updated.to_rfc3339()
        );

        if state.resources.is_empty() {
            let _ = writeln!(output, "No resources recorded.");
            return output;
        }

        let mut rows: Vec<ResourceRow> = state
            .resources
            .values()
            .map(|r| ResourceRow {
                address: r.address.clone(),
                status: r.status.to_string(),
                provider_id: Self::truncate(&r.provider_id, 48),
                hash: r.spec_hash.chars().take(8).collect(),
            })
            .collect();
        rows.sort_by(|a, b| a.address.cmp(&b.address));

        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        output
    }

    /// Formats output values for display.
    #[must_use]
    pub fn format_outputs(&self, outputs: &std::collections::BTreeMap<String, String>) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(outputs).unwrap_or_default(),
            OutputFormat::Text => {
                if outputs.is_empty() {
                    return String::from("No outputs recorded. Run apply first.\n");
                }
                let mut output = String::new();
                for (name, value) in outputs {
                    let _ = writeln!(output, "{name} = {value}");
                }
                output
            }
        }
    }

    /// Formats a validation result for display.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, show_warnings: bool) -> String {
        let mut output = String::new();

        if result.is_valid() {
            let _ = writeln!(output, "{} Template is valid.", "✓".green());
        } else {
            let _ = writeln!(
                output,
                "{} Template has {} error(s):",
                "✗".red(),
                result.error_count()
            );
            for error in &result.errors {
                let _ = writeln!(output, "   - {error}");
            }
        }

        if show_warnings && result.warning_count() > 0 {
            let _ = writeln!(output, "\n{} Warnings:", "⚠".yellow());
            for warning in &result.warnings {
                let _ = writeln!(output, "   - {warning}");
            }
        }

        output
    }

    /// Renders an action type with color.
    fn format_action_type(action_type: ActionType) -> String {
        match action_type {
            ActionType::Create => "create".green().to_string(),
            ActionType::Update => "update".yellow().to_string(),
            ActionType::Delete => "delete".red().to_string(),
            ActionType::Resolve => "resolve".blue().to_string(),
            ActionType::Noop => "noop".to_string(),
        }
    }

    /// Truncates a string for table display.
    fn truncate(s: &str, max: usize) -> String {
        if s.len() <= max {
            s.to_string()
        } else {
            format!("{}...", &s[..max.saturating_sub(3)])
        }
    }
}

impl From<&ApplyPlan> for PlanJson {
    fn from(plan: &ApplyPlan) -> Self {
        Self {
            template_hash: plan.template_hash.clone(),
            actions: plan
                .actions
                .iter()
                .map(|a| PlanActionJson {
                    action: a.action_type.to_string(),
                    resource: a.address.clone(),
                    reason: a.reason.clone(),
                    depends_on: a.dependencies.clone(),
                })
                .collect(),
            warnings: plan.warnings.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(
            OutputFormatter::truncate("a-very-long-reason-string", 10),
            "a-very-..."
        );
    }

    #[test]
    fn test_converged_plan_text() {
        let formatter = OutputFormatter::new(OutputFormat::Text);
        let plan = ApplyPlan::empty("abcdef1234");
        let text = formatter.format_plan(&plan);
        assert!(text.contains("No changes required"));
    }

    #[test]
    fn test_outputs_text() {
        let formatter = OutputFormatter::new(OutputFormat::Text);
        let outputs = std::collections::BTreeMap::from([(
            String::from("storage_id"),
            String::from("/providers/storage.account/main"),
        )]);
        let text = formatter.format_outputs(&outputs);
        assert!(text.contains("storage_id = /providers/storage.account/main"));
    }
}
