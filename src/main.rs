use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use muster::cli::{Cli, Commands, ConfigAction, Display};
use muster::config::{OrchConfig, OrchPaths};
use muster::error::Result;
use muster::orchestrator::Engine;
use muster::server;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            Display::new().print_error(&e.to_string());
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("muster=debug,tower_http=debug")
    } else {
        EnvFilter::new("muster=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let display = Display::new();
    let state_dir = cli
        .state_dir
        .clone()
        .unwrap_or_else(OrchPaths::default_state_dir);

    match cli.command {
        Commands::Init => {
            let config = OrchConfig::default();
            let paths = OrchPaths::new(state_dir.clone(), &config);
            paths.ensure_dirs().await?;
            config.save(&state_dir).await?;
            display.print_success("Initialized orchestrator state.");
            display.print_info(&format!(
                "Configuration: {}",
                state_dir.join("config.toml").display()
            ));
            display.print_info(&format!("Registry: {}", paths.registry_file.display()));
            Ok(())
        }
        Commands::Serve { bind } => {
            let config = OrchConfig::load(&state_dir).await?;
            let bind = bind.unwrap_or_else(|| config.server.bind.clone());
            let paths = OrchPaths::new(state_dir, &config);

            let engine = Engine::new(config, paths);
            engine.start().await?;

            let serve_engine = engine.clone();
            let result = tokio::select! {
                result = server::serve(serve_engine, &bind) => result,
                _ = tokio::signal::ctrl_c() => {
                    display.print_info("Interrupt received, shutting down.");
                    Ok(())
                }
            };

            engine.shutdown().await;
            result
        }
        Commands::Status => {
            let config = OrchConfig::load(&state_dir).await?;
            let paths = OrchPaths::new(state_dir, &config);
            let engine = Engine::new(config, paths);
            engine.registry().load().await?;

            display.print_header("Workers");
            display.print_workers_table(&engine.registry().list());
            Ok(())
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let config = OrchConfig::load(&state_dir).await?;
                let toml = toml::to_string_pretty(&config)
                    .map_err(|e| muster::MusterError::Config(e.to_string()))?;
                println!("{toml}");
                Ok(())
            }
            ConfigAction::Reset => {
                let config = OrchConfig::default();
                let paths = OrchPaths::new(state_dir.clone(), &config);
                paths.ensure_dirs().await?;
                config.save(&state_dir).await?;
                display.print_success("Configuration reset to defaults.");
                Ok(())
            }
        },
    }
}
