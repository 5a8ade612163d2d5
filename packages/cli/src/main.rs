// ABOUTME: Entry point for the sandpit command-line tool
// ABOUTME: Parses arguments, installs logging and dispatches to the command handlers

use clap::{Parser, Subcommand};
use colored::*;
use sandpit_config::constants::RUST_LOG;
use std::path::PathBuf;
use std::process;

mod commands;

use commands::run::RunArgs;

#[derive(Parser)]
#[command(name = "sandpit")]
#[command(about = "Sandpit - ephemeral sandboxes for running untrusted code")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the runtime templates sandboxes can be started from
    Templates {
        /// Load templates from a JSON catalog instead of the builtin one
        #[arg(long, value_name = "FILE")]
        catalog: Option<PathBuf>,
    },
    /// Run a command in a fresh sandbox, then tear the sandbox down
    Run(RunArgs),
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env(RUST_LOG)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing();

    match handle_command(cli.command).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            process::exit(1);
        }
    }
}

async fn handle_command(command: Commands) -> anyhow::Result<i32> {
    match command {
        Commands::Templates { catalog } => {
            commands::templates::list_templates(catalog.as_deref())?;
            Ok(0)
        }
        Commands::Run(args) => commands::run::run(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_with_trailing_command() {
        let cli = Cli::try_parse_from([
            "sandpit",
            "run",
            "--template",
            "node",
            "--upload",
            "./app",
            "--download",
            "dist=./out",
            "--",
            "npm",
            "run",
            "build",
        ])
        .unwrap();

        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.template, "node");
        assert_eq!(args.upload, Some(PathBuf::from("./app")));
        assert_eq!(args.download.len(), 1);
        assert_eq!(args.download[0].sandbox_path, "dist");
        assert_eq!(args.download[0].host_dir, PathBuf::from("./out"));
        assert!(!args.keep_stdin);
        assert_eq!(args.command, vec!["npm", "run", "build"]);
    }

    #[test]
    fn test_run_requires_a_command() {
        assert!(Cli::try_parse_from(["sandpit", "run", "--template", "node"]).is_err());
    }

    #[test]
    fn test_templates_takes_optional_catalog() {
        let cli = Cli::try_parse_from(["sandpit", "templates"]).unwrap();
        assert!(matches!(cli.command, Commands::Templates { catalog: None }));
    }
}
