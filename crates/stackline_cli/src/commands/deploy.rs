//! Deploy command - Deploy stacks in dependency order.

use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use tracing::info;

use stackline_core::{RunAction, RunReport};
use stackline_env::LocalBackend;

use super::{orchestrator, parameters, print_report, EnvArgs, SelectionArgs};

#[derive(Args)]
pub struct DeployArgs {
    #[command(flatten)]
    pub selection: SelectionArgs,

    /// Stack parameter as Stack:name=value, or name=value for every stack
    #[arg(short, long = "parameters", value_name = "PARAM")]
    pub parameters: Vec<String>,

    /// Deploy up to N independent stacks at the same time
    #[arg(long, value_name = "N")]
    pub parallelism: Option<usize>,

    /// Fail if a stack imports from a stack it does not depend on
    #[arg(long)]
    pub strict_imports: bool,

    #[command(flatten)]
    pub env: EnvArgs,
}

pub async fn execute(args: DeployArgs) -> Result<()> {
    let mut env = args.env.load()?;
    if let Some(n) = args.parallelism {
        if n == 0 {
            anyhow::bail!("invalid arguments: --parallelism must be at least 1");
        }
        env.config.deploy.parallelism = n;
    }
    if args.strict_imports {
        env.config.deploy.strict_imports = true;
    }

    let selection = args.selection.resolve(&env, true)?;
    let params = parameters(&args.parameters)?;
    let backend = Arc::new(LocalBackend::new(&env.config)?);

    let plan = env.graph.deployment_order_for(selection.as_deref())?;
    println!("🚀 Deploying {} stack(s) to {}:", plan.len(), env.config.name);
    for stack in &plan {
        println!("   • {}", stack.id);
    }
    println!();

    let orchestrator = orchestrator(&env, backend, params);
    let mut report = RunReport::new(RunAction::Deploy, selection.clone().unwrap_or_default());
    if let Some(dir) = &env.config.deploy.log_dir {
        report = report.with_log_dir(dir);
    }

    let result = orchestrator
        .deploy_with_report(&env.graph, selection.as_deref(), &mut report)
        .await;
    print_report(&report);
    result?;

    for record in orchestrator.registry().records() {
        info!("Export {}", record);
    }
    Ok(())
}
