use clap::{ArgAction, Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "devalloc")]
#[command(about = "Allocate devices to resource claims, one candidate node at a time")]
#[command(version)]
pub struct Args {
    /// Path to the scenario file (JSON, JSONC or YAML)
    #[arg(required = true)]
    pub scenario_file: PathBuf,

    /// Only try these nodes (repeatable); default is every node in the scenario
    #[arg(short, long = "node", value_name = "NAME")]
    pub nodes: Vec<String>,

    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Dry-run mode: validate the scenario and summarize it without allocating
    #[arg(long)]
    pub dry_run: bool,

    /// Output format for allocation outcomes
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Json)]
    pub output: OutputFormat,

    /// Cancel the whole run after this many seconds
    #[arg(long, value_name = "SECS", env = "DEVALLOC_TIMEOUT")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Yaml,
}

/// Errors surfaced by the command line front end
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Node '{0}' is not defined in the scenario")]
    UnknownNode(String),

    #[error("Failed to render JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to render YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

use crate::allocator::{AllocationError, Allocator};
use crate::config::Scenario;
use crate::model::{AllocationResult, Node};

/// What happened on one node
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum NodeOutcome {
    Allocated { results: Vec<AllocationResult> },
    Unschedulable,
    Error { message: String },
}

impl From<Result<Option<Vec<AllocationResult>>, AllocationError>> for NodeOutcome {
    fn from(outcome: Result<Option<Vec<AllocationResult>>, AllocationError>) -> Self {
        match outcome {
            Ok(Some(results)) => NodeOutcome::Allocated { results },
            Ok(None) => NodeOutcome::Unschedulable,
            Err(e) => NodeOutcome::Error {
                message: e.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeReport {
    pub node: String,
    #[serde(flatten)]
    pub outcome: NodeOutcome,
}

/// Resolve `--node` arguments against the scenario, keeping their order.
/// Without arguments every scenario node is selected.
pub fn select_nodes<'a>(scenario: &'a Scenario, names: &[String]) -> Result<Vec<&'a Node>, CliError> {
    if names.is_empty() {
        return Ok(scenario.nodes.iter().collect());
    }
    names
        .iter()
        .map(|name| {
            scenario
                .node_by_name(name)
                .ok_or_else(|| CliError::UnknownNode(name.clone()))
        })
        .collect()
}

/// Run the allocator against each node in turn
pub fn allocate_on_nodes(
    allocator: &Allocator,
    nodes: &[&Node],
    ctx: &CancellationToken,
) -> Vec<NodeReport> {
    nodes
        .iter()
        .map(|node| NodeReport {
            node: node.name().to_string(),
            outcome: allocator.allocate(ctx, node).into(),
        })
        .collect()
}

// ============================================================================
// SBIO: Pure display logic (no I/O - returns formatted strings)
// ============================================================================

/// Render node reports in the requested format.
/// Pure function - returns a formatted string.
pub fn format_outcomes(reports: &[NodeReport], format: OutputFormat) -> Result<String, CliError> {
    Ok(match format {
        OutputFormat::Json => serde_json::to_string_pretty(reports)?,
        OutputFormat::Yaml => serde_yaml::to_string(reports)?,
    })
}

/// Format a dry-run output summarizing the scenario.
/// Pure function - returns a formatted string.
pub fn format_dry_run(scenario: &Scenario, args: &Args) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "devalloc v{} - Dry Run Mode\n\n",
        env!("CARGO_PKG_VERSION")
    ));
    output.push_str(&format!("Scenario: {}\n\n", args.scenario_file.display()));

    output.push_str(&format!(
        "Settings: admin access {}, at most {} devices per claim\n\n",
        if scenario.settings.admin_access_enabled {
            "enabled"
        } else {
            "disabled"
        },
        scenario.settings.max_devices_per_claim
    ));

    output.push_str(&format!("Device Classes ({}):\n", scenario.classes.len()));
    for class in &scenario.classes {
        output.push_str(&format!(
            "  - {} [{} selectors, {} config]\n",
            class.name(),
            class.spec.selectors.len(),
            class.spec.config.len()
        ));
    }
    output.push('\n');

    output.push_str(&format!("Claims ({}):\n", scenario.claims.len()));
    for claim in &scenario.claims {
        output.push_str(&format!("  [{}]\n", claim.key()));
        for request in claim.requests() {
            let mode = match request.allocation_mode {
                crate::model::AllocationMode::ExactCount => format!("{} x", request.count()),
                crate::model::AllocationMode::All => "all".to_string(),
                crate::model::AllocationMode::Unsupported => "unsupported".to_string(),
            };
            output.push_str(&format!(
                "    {}: {} {}",
                request.name, mode, request.device_class_name
            ));
            if request.is_admin_access() {
                output.push_str(" (admin access)");
            }
            output.push('\n');
        }
        for constraint in claim.constraints() {
            if let Some(attribute) = &constraint.match_attribute {
                let scope = if constraint.requests.is_empty() {
                    "all requests".to_string()
                } else {
                    constraint.requests.join(", ")
                };
                output.push_str(&format!("    match {} across {}\n", attribute, scope));
            }
        }
    }
    output.push('\n');

    let devices: usize = scenario.slices.iter().map(|s| s.devices.len()).sum();
    output.push_str(&format!(
        "Slices: {} with {} devices, {} already allocated\n",
        scenario.slices.len(),
        devices,
        scenario.allocated_devices.len()
    ));

    output.push_str(&format!("Nodes ({}):\n", scenario.nodes.len()));
    for node in &scenario.nodes {
        let selected = args.nodes.is_empty() || args.nodes.iter().any(|n| n == node.name());
        output.push_str(&format!(
            "  - {}{}\n",
            node.name(),
            if selected { "" } else { " (skipped)" }
        ));
    }

    output.push_str("\nValidation: PASSED\n");
    output.push_str("Ready to allocate. Remove --dry-run to execute.\n");

    output
}
