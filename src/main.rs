use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

use request_lens::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = cli::Cli::parse();
    let command = args.get_command();

    // `start` installs its own subscriber once the pipeline exists
    if !matches!(command, cli::Commands::Start) {
        init_tracing();
    }

    // Dispatch to appropriate command handler
    match command {
        cli::Commands::Start => {
            commands::start::execute(&args.config).await?;
        }
        cli::Commands::Test => {
            commands::test::execute(&args.config)?;
        }
        cli::Commands::Config { action } => match action {
            cli::ConfigCommands::Show => commands::config::show(&args.config)?,
            cli::ConfigCommands::Validate => commands::config::validate(&args.config)?,
        },
        cli::Commands::Sessions(sessions_args) => {
            commands::sessions::execute(&args.config, sessions_args).await?;
        }
        cli::Commands::Recent(recent_args) => {
            commands::recent::execute(&args.config, recent_args).await?;
        }
        cli::Commands::Trace(trace_args) => {
            commands::trace::execute(&args.config, trace_args).await?;
        }
        cli::Commands::Version => {
            println!("request-lens v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
