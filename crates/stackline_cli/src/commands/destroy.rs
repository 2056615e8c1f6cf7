//! Destroy command - Tear stacks down in reverse dependency order.

use std::sync::Arc;

use anyhow::Result;
use clap::Args;

use stackline_core::{Parameters, RunAction, RunReport};
use stackline_env::LocalBackend;

use super::{orchestrator, print_report, EnvArgs, SelectionArgs};

#[derive(Args)]
pub struct DestroyArgs {
    #[command(flatten)]
    pub selection: SelectionArgs,

    #[command(flatten)]
    pub env: EnvArgs,
}

pub async fn execute(args: DestroyArgs) -> Result<()> {
    let env = args.env.load()?;
    let selection = args.selection.resolve(&env, true)?;
    let backend = Arc::new(LocalBackend::new(&env.config)?);

    let plan = env.graph.teardown_order_for(selection.as_deref())?;
    println!("🧹 Destroying {} stack(s) in {}:", plan.len(), env.config.name);
    for stack in &plan {
        let note = if backend.is_deployed(stack.id.as_str()) { "" } else { " (not deployed)" };
        println!("   • {}{}", stack.id, note);
    }
    println!();

    let orchestrator = orchestrator(&env, backend, Parameters::new());
    let mut report = RunReport::new(RunAction::Destroy, selection.clone().unwrap_or_default());
    if let Some(dir) = &env.config.deploy.log_dir {
        report = report.with_log_dir(dir);
    }

    let result = orchestrator
        .destroy_with_report(&env.graph, selection.as_deref(), &mut report)
        .await;
    print_report(&report);
    Ok(result?)
}
