use std::path::PathBuf;

use clap::{Parser, Subcommand};
use console::style;

use crate::registry::Worker;

#[derive(Debug, Parser)]
#[command(name = "muster", about = "Parallel agent orchestrator", version)]
pub struct Cli {
    /// Verbose logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Override the state directory (default: ~/.config/orchestrator).
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create the state directory and write the default configuration.
    Init,
    /// Run the orchestrator with its HTTP transport surface.
    Serve {
        /// Bind address, e.g. 127.0.0.1:7620.
        #[arg(long)]
        bind: Option<String>,
    },
    /// Show the registered workers.
    Status,
    /// Show or reset the configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    Show,
    Reset,
}

/// Terminal output helpers.
pub struct Display;

impl Display {
    pub fn new() -> Self {
        Self
    }

    pub fn print_success(&self, message: &str) {
        println!("{} {}", style("✓").green().bold(), message);
    }

    pub fn print_error(&self, message: &str) {
        eprintln!("{} {}", style("✗").red().bold(), message);
    }

    pub fn print_info(&self, message: &str) {
        println!("{} {}", style("·").dim(), message);
    }

    pub fn print_warning(&self, message: &str) {
        println!("{} {}", style("!").yellow().bold(), message);
    }

    pub fn print_header(&self, title: &str) {
        println!("\n{}", style(title).bold().underlined());
    }

    pub fn print_workers_table(&self, workers: &[Worker]) {
        if workers.is_empty() {
            self.print_info("No workers registered.");
            return;
        }

        println!(
            "{:<10} {:<20} {:<12} {:<24} {}",
            style("ID").bold(),
            style("NAME").bold(),
            style("STATUS").bold(),
            style("BRANCH").bold(),
            style("PID").bold()
        );
        for worker in workers {
            let status = match worker.status.as_str() {
                "active" => style(worker.status.as_str()).green(),
                "failed" => style(worker.status.as_str()).red(),
                "completed" => style(worker.status.as_str()).cyan(),
                other => style(other).dim(),
            };
            println!(
                "{:<10} {:<20} {:<12} {:<24} {}",
                crate::utils::short_id(&worker.id),
                worker.name,
                status,
                worker.branch,
                worker
                    .pid
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".into()),
            );
        }
    }
}

impl Default for Display {
    fn default() -> Self {
        Self::new()
    }
}
