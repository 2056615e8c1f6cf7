//! Synth command - Write resolved stack templates without deploying.
//!
//! Runs the same ordered walk as deploy so imports resolve, but the local
//! backend only writes templates and records nothing as deployed. Secret
//! parameters that are not given are filled with a placeholder.

use std::sync::Arc;

use anyhow::Result;
use clap::Args;

use stackline_core::Parameters;
use stackline_env::{Environment, LocalBackend};

use super::{orchestrator, parameters, EnvArgs, SelectionArgs};

#[derive(Args)]
pub struct SynthArgs {
    #[command(flatten)]
    pub selection: SelectionArgs,

    /// Stack parameter as Stack:name=value, or name=value for every stack
    #[arg(short, long = "parameters", value_name = "PARAM")]
    pub parameters: Vec<String>,

    #[command(flatten)]
    pub env: EnvArgs,
}

pub async fn execute(args: SynthArgs) -> Result<()> {
    let mut env = args.env.load()?;
    // Synth runs leave no run log behind.
    env.config.deploy.log_dir = None;

    let selection = args.selection.resolve(&env, false)?;
    let backend = Arc::new(LocalBackend::new(&env.config)?.synth_only());

    let params = synth_parameters(&env, &args.parameters)?;
    let report = orchestrator(&env, backend.clone(), params)
        .deploy(&env.graph, selection.as_deref())
        .await?;

    println!("📄 Synthesized {} stack(s):", report.outcomes.len());
    for outcome in &report.outcomes {
        println!("   • {}", backend.template_path(outcome.stack.as_str()).display());
    }
    Ok(())
}

/// Parameters for a synth run, with placeholders for missing secrets.
fn synth_parameters(env: &Environment, values: &[String]) -> Result<Parameters> {
    Ok(parameters(values)?.with_placeholders(env.graph.stacks()))
}
