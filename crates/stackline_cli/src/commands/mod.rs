//! CLI command definitions.
//!
//! This module defines the command structure for the stackline CLI and the
//! pieces every command shares: loading the environment config, building
//! the environment and the orchestrator.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::warn;

use stackline_core::{
    DeploymentOrchestrator, Parameters, ProvisioningBackend, ReferenceRegistry, RunReport,
    RunState, StackId,
};
use stackline_env::{Environment, EnvironmentConfig};

pub mod deploy;
pub mod destroy;
pub mod list;
pub mod synth;

/// stackline - dependency-ordered stack deployment
#[derive(Parser)]
#[command(name = "stackline")]
#[command(version, about = "stackline - dependency-ordered stack deployment")]
#[command(long_about = r#"
stackline deploys an application environment made of interdependent stacks
in dependency order, passing values between stacks through named exports.

COMMANDS:
  deploy   → Deploy the selected stacks and everything they depend on
  destroy  → Destroy the selected stacks and everything depending on them
  list     → Show stacks, deployment order, exports and imports
  synth    → Write resolved stack templates without deploying

EXAMPLES:
  stackline deploy --parameters Rds:databasePassword=secret123 Rds Service01
  stackline deploy --all -p Rds:databasePassword=secret123 --parallelism 3
  stackline destroy Service01

EXIT CODES:
  0 - Success
  1 - General error
  2 - Invalid arguments
  3 - Validation failure
  4 - Provisioning failure
"#)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Deploy stacks
    Deploy(deploy::DeployArgs),

    /// Destroy stacks
    Destroy(destroy::DestroyArgs),

    /// List stacks and their order
    List(list::ListArgs),

    /// Write resolved templates without deploying
    Synth(synth::SynthArgs),
}

/// Options shared by every command.
#[derive(Args, Clone)]
pub struct EnvArgs {
    /// Environment config file (defaults to ./stackline.yaml if present)
    #[arg(short, long, env = "STACKLINE_CONFIG")]
    pub config: Option<PathBuf>,
}

impl EnvArgs {
    /// Load the config and build the environment.
    pub fn load(&self) -> Result<Environment> {
        let current_dir = std::env::current_dir()?;
        let config = EnvironmentConfig::discover(self.config.as_deref(), &current_dir)
            .context("Failed to load environment config")?
            .rooted_at(&current_dir);
        Ok(Environment::build(config)?)
    }
}

/// Stack selection shared by deploy, destroy and synth.
#[derive(Args, Clone)]
pub struct SelectionArgs {
    /// Stacks to act on (deploy adds their dependencies, destroy their dependents)
    pub stacks: Vec<String>,

    /// Act on every stack
    #[arg(long, conflicts_with = "stacks")]
    pub all: bool,
}

impl SelectionArgs {
    /// Resolve the selection; `None` means every stack.
    pub fn resolve(&self, env: &Environment, require: bool) -> Result<Option<Vec<StackId>>> {
        if require && !self.all && self.stacks.is_empty() {
            anyhow::bail!("invalid arguments: name the stacks to act on, or pass --all");
        }
        Ok(env.selection(&self.stacks)?)
    }
}

/// Parse `--parameters` values.
pub fn parameters(values: &[String]) -> Result<Parameters> {
    Ok(Parameters::parse(values)?)
}

/// Build an orchestrator for `env` on the process-wide registry.
pub fn orchestrator(
    env: &Environment,
    backend: Arc<dyn ProvisioningBackend>,
    parameters: Parameters,
) -> DeploymentOrchestrator {
    let orchestrator = DeploymentOrchestrator::new(backend)
        .with_registry(ReferenceRegistry::global().clone())
        .with_policies(env.policies.clone())
        .with_parameters(parameters)
        .with_options(env.config.deploy.clone());

    let cancel = orchestrator.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; stopping after the current stack");
            cancel.cancel();
        }
    });
    orchestrator
}

/// Print the per-stack outcome of a run.
pub fn print_report(report: &RunReport) {
    for outcome in &report.outcomes {
        if outcome.success {
            let exports = if outcome.exports.is_empty() {
                String::new()
            } else {
                format!(" (exports: {})", outcome.exports.join(", "))
            };
            println!("   ✅ {}{}", outcome.stack, exports);
        } else {
            let phase = outcome.phase.map(|p| format!(" during {}", p)).unwrap_or_default();
            println!(
                "   ❌ {}{}: {}",
                outcome.stack,
                phase,
                outcome.message.as_deref().unwrap_or("failed")
            );
        }
    }
    for pending in report.pending() {
        println!("   ⏸️  {} (not started)", pending);
    }

    match report.state {
        RunState::Completed => println!("\n✅ {} completed: {} stack(s)", report.action, report.outcomes.len()),
        RunState::Cancelled => println!("\n⚠️  {} cancelled", report.action),
        _ => {
            if let Some(stack) = &report.failed_stack {
                println!("\n❌ {} failed at stack {}", report.action, stack);
            }
        }
    }
    if let Some(path) = report.log_path() {
        println!("   Run log: {}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_deploy() {
        let cli = Cli::try_parse_from([
            "stackline",
            "deploy",
            "--parameters",
            "Rds:databasePassword=secret123",
            "Rds",
            "Service01",
        ])
        .unwrap();

        match cli.command {
            Commands::Deploy(args) => {
                assert_eq!(args.selection.stacks, vec!["Rds", "Service01"]);
                assert_eq!(args.parameters, vec!["Rds:databasePassword=secret123"]);
            }
            _ => panic!("expected deploy"),
        }
    }

    #[test]
    fn test_all_conflicts_with_stacks() {
        assert!(Cli::try_parse_from(["stackline", "destroy", "--all", "Vpc"]).is_err());
    }

    #[test]
    fn test_parameters() {
        let params = parameters(&["Rds:databasePassword=x".to_string()]).unwrap();
        assert_eq!(params.get(&StackId::new("Rds"), "databasePassword"), Some("x"));
        assert!(parameters(&["oops".to_string()]).is_err());
    }
}
