//! stackline CLI - Main entry point.
//!
//! Exit codes:
//! - 0: Success
//! - 1: General error
//! - 2: Invalid arguments
//! - 3: Validation failure
//! - 4: Provisioning failure

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stackline_core::CoreError;
use stackline_env::EnvError;

mod commands;

use commands::{Cli, Commands};

/// CI-friendly exit codes
pub struct ExitCodes;

impl ExitCodes {
    pub const SUCCESS: u8 = 0;
    pub const GENERAL_ERROR: u8 = 1;
    pub const INVALID_ARGS: u8 = 2;
    pub const VALIDATION_FAILURE: u8 = 3;
    pub const PROVISIONING_FAILURE: u8 = 4;
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        "stackline=debug"
    } else if cli.quiet {
        "stackline=warn"
    } else {
        "stackline=info"
    };
    let mut filter = EnvFilter::from_default_env().add_directive("warn".parse().expect("static directive"));
    if let Ok(directive) = level.parse() {
        filter = filter.add_directive(directive);
    }
    // Logging may already be initialized, which is fine
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .try_init();

    let result = match cli.command {
        Commands::Deploy(args) => commands::deploy::execute(args).await,
        Commands::Destroy(args) => commands::destroy::execute(args).await,
        Commands::List(args) => commands::list::execute(args).await,
        Commands::Synth(args) => commands::synth::execute(args).await,
    };

    match result {
        Ok(()) => ExitCode::from(ExitCodes::SUCCESS),
        Err(e) => {
            let exit_code = categorize_error(&e);
            eprintln!("❌ Error: {:#}", e);
            ExitCode::from(exit_code)
        }
    }
}

/// Find the engine error behind an anyhow error, if any.
fn core_error(e: &anyhow::Error) -> Option<&CoreError> {
    e.chain().find_map(|cause| {
        cause.downcast_ref::<CoreError>().or_else(|| match cause.downcast_ref::<EnvError>() {
            Some(EnvError::Core(inner)) => Some(inner),
            _ => None,
        })
    })
}

/// Categorize error to determine exit code
fn categorize_error(e: &anyhow::Error) -> u8 {
    if let Some(core) = core_error(e) {
        return match core.root() {
            CoreError::UnknownStack(_) | CoreError::InvalidParameter(_) => ExitCodes::INVALID_ARGS,
            CoreError::Cancelled(_) => ExitCodes::GENERAL_ERROR,
            _ if core.is_validation() => ExitCodes::VALIDATION_FAILURE,
            CoreError::Io(_) | CoreError::Serialization(_) if core.failing_stack().is_none() => {
                ExitCodes::GENERAL_ERROR
            }
            _ => ExitCodes::PROVISIONING_FAILURE,
        };
    }

    match e.downcast_ref::<EnvError>() {
        Some(EnvError::InvalidConfig(_) | EnvError::InvalidResource { .. }) => {
            ExitCodes::VALIDATION_FAILURE
        }
        Some(EnvError::Yaml(_)) => ExitCodes::INVALID_ARGS,
        _ if e.to_string().contains("argument") => ExitCodes::INVALID_ARGS,
        _ => ExitCodes::GENERAL_ERROR,
    }
}
