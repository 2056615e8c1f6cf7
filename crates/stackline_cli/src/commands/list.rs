//! List command - Show stacks, order and cross-stack references.

use anyhow::Result;
use clap::Args;

use stackline_env::LocalBackend;

use super::EnvArgs;

#[derive(Args)]
pub struct ListArgs {
    /// Print as JSON
    #[arg(long)]
    pub json: bool,

    #[command(flatten)]
    pub env: EnvArgs,
}

pub async fn execute(args: ListArgs) -> Result<()> {
    let env = args.env.load()?;
    let backend = LocalBackend::new(&env.config)?;
    let waves = env.graph.deployment_waves();

    if args.json {
        let stacks: Vec<_> = env
            .graph
            .deployment_order()
            .into_iter()
            .map(|stack| {
                let deps = env.graph.dependencies(&stack.id).unwrap_or_default();
                serde_json::json!({
                    "id": stack.id,
                    "kind": stack.kind.as_str(),
                    "dependsOn": deps,
                    "exports": stack.exports.iter().map(|e| &e.name).collect::<Vec<_>>(),
                    "imports": stack.imports,
                    "deployed": backend.is_deployed(stack.id.as_str()),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&stacks)?);
        return Ok(());
    }

    println!("📦 Environment {} ({}):", env.config.name, env.config.region);
    for (i, wave) in waves.iter().enumerate() {
        println!("\n   Wave {}:", i + 1);
        for stack in wave {
            let status = if backend.is_deployed(stack.id.as_str()) { "deployed" } else { "not deployed" };
            println!("   • {} [{}] - {}", stack.id, stack.kind.as_str(), status);

            let deps = env.graph.dependencies(&stack.id)?;
            if !deps.is_empty() {
                let deps: Vec<_> = deps.iter().map(|d| d.as_str()).collect();
                println!("       depends on: {}", deps.join(", "));
            }
            if !stack.exports.is_empty() {
                let names: Vec<_> = stack.exports.iter().map(|e| e.name.as_str()).collect();
                println!("       exports:    {}", names.join(", "));
            }
            if !stack.imports.is_empty() {
                println!("       imports:    {}", stack.imports.join(", "));
            }
        }
    }

    let issues = env.graph.check_imports();
    if !issues.is_empty() {
        println!("\n⚠️  Import issues:");
        for issue in issues {
            println!("   - {}", issue);
        }
    }
    Ok(())
}
