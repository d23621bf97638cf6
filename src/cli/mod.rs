//! Command line.
//!
//! - `run` (default): reconcile on an interval until ctrl-c
//! - `once`: a single applying pass
//! - `plan`: print what a pass would do without changing anything

use std::fmt::Write as _;
use std::path::PathBuf;

use clap::{ColorChoice, Parser, Subcommand};

use crate::models::ReconciliationDecision;

#[derive(Parser, Debug)]
#[command(name = "kapellmeister-agent")]
#[command(about = "Keep this host's Docker containers in line with the management server")]
#[command(version)]
#[command(color = ColorChoice::Auto)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Environment file to load before reading configuration (defaults to ./.env if present)
    #[arg(long, global = true)]
    pub env_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Reconcile on an interval until interrupted (default)
    Run,

    /// Run a single reconciliation pass and exit
    Once,

    /// Show the actions the next pass would take, without applying them
    Plan,
}

impl Cli {
    /// The subcommand to run, `run` when none was given.
    pub fn selected(&self) -> Command {
        self.command.unwrap_or(Command::Run)
    }
}

/// Human-readable rendering of a decision for `plan`.
pub fn render_plan(decision: &ReconciliationDecision) -> String {
    if decision.is_empty() {
        return "Nothing to do: running containers match the desired state.\n".to_string();
    }

    let mut out = String::new();
    for name in &decision.remove {
        let _ = writeln!(out, "- remove  {name}");
    }
    for spec in &decision.create {
        let _ = writeln!(out, "+ create  {} ({})", spec.name(), spec.image());
    }
    for spec in &decision.update {
        let _ = writeln!(out, "~ update  {} ({})", spec.name(), spec.image());
    }
    let _ = writeln!(
        out,
        "\n{} to create, {} to update, {} to remove",
        decision.create.len(),
        decision.update.len(),
        decision.remove.len()
    );
    out
}
