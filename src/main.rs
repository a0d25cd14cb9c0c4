use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use envconfig::Envconfig;

use turnos_entrypoint::config::Config;
use turnos_entrypoint::orchestrator::Orchestrator;

#[derive(Parser)]
#[command(version, about = "Container entrypoint: SSH tunnel, application, proxy")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the startup sequence and wait on the application (default)
    Run {
        /// Print the resolved startup plan and exit
        #[arg(long)]
        print_plan: bool,
    },
    /// Keep the SSH tunnel alive and publish readiness through the signal file
    Monitor,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Run { print_plan: false });

    let result = match command {
        Command::Run { print_plan } => run(print_plan),
        Command::Monitor => monitor(),
    };

    match result {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(print_plan: bool) -> Result<i32> {
    let config = Config::init_from_env().context("invalid configuration")?;
    let monitor_program =
        std::env::current_exe().context("cannot locate the entrypoint binary")?;
    let plan = config.startup_plan(monitor_program)?;

    if print_plan {
        println!("{:#?}", plan);
        return Ok(0);
    }

    smol::block_on(async {
        match Orchestrator::new(plan).run().await {
            Ok(code) => Ok(code),
            // Already logged by the orchestrator
            Err(e) => Ok(e.exit_code()),
        }
    })
}

fn monitor() -> Result<i32> {
    let config = Config::init_from_env().context("invalid configuration")?;
    let monitor = config.tunnel_monitor()?;
    smol::block_on(monitor.run())?;
    Ok(0)
}
