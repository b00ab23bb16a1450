pub mod commands;
pub mod utils;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "scopectl")]
#[command(about = "Install row policies and audit the organization hierarchy")]
#[command(version)]
pub struct Cli {
    #[arg(long, global = true, help = "Output in JSON format")]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Install schema, helper functions and row policies")]
    Migrate {
        #[arg(long, help = "Print the SQL instead of applying it")]
        dry_run: bool,
    },

    #[command(about = "Check that the application role cannot bypass row policies")]
    Guard,

    #[command(about = "Organization hierarchy maintenance")]
    Tree {
        #[command(subcommand)]
        cmd: commands::tree::TreeCommands,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    pub fn from_cli(cli: &Cli) -> Self {
        if cli.json {
            OutputFormat::Json
        } else {
            OutputFormat::Text
        }
    }
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let output_format = OutputFormat::from_cli(&cli);

    match cli.command {
        Commands::Migrate { dry_run } => commands::migrate::handle(dry_run, output_format).await,
        Commands::Guard => commands::guard::handle(output_format).await,
        Commands::Tree { cmd } => commands::tree::handle(cmd, output_format).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_migrate_dry_run_with_global_json() {
        let cli = Cli::try_parse_from(["scopectl", "migrate", "--dry-run", "--json"]).unwrap();
        assert_eq!(OutputFormat::from_cli(&cli), OutputFormat::Json);
        assert!(matches!(cli.command, Commands::Migrate { dry_run: true }));
    }

    #[test]
    fn parses_tree_verify() {
        let cli = Cli::try_parse_from(["scopectl", "tree", "verify"]).unwrap();
        assert_eq!(OutputFormat::from_cli(&cli), OutputFormat::Text);
        assert!(matches!(
            cli.command,
            Commands::Tree {
                cmd: commands::tree::TreeCommands::Verify
            }
        ));
    }

    #[test]
    fn rejects_unknown_subcommand() {
        assert!(Cli::try_parse_from(["scopectl", "login"]).is_err());
    }
}
