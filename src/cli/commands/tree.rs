use anyhow::bail;
use clap::Subcommand;
use serde_json::json;

use crate::authz::hierarchy::HierarchyResolver;
use crate::cli::utils::{output_error, output_success};
use crate::cli::OutputFormat;
use crate::database::manager::DatabaseManager;

#[derive(Subcommand)]
pub enum TreeCommands {
    #[command(about = "Check every materialized path against the parent links")]
    Verify,
}

pub async fn handle(cmd: TreeCommands, output_format: OutputFormat) -> anyhow::Result<()> {
    match cmd {
        TreeCommands::Verify => verify(output_format).await,
    }
}

/// Reads as the migration (owner) role; the application role would only
/// see what its row policies allow
async fn verify(output_format: OutputFormat) -> anyhow::Result<()> {
    let pool = DatabaseManager::migration_pool().await?;
    let mut conn = pool.acquire().await?;

    let resolver = HierarchyResolver::from_config();
    let tree = resolver.load_tree(&mut conn).await?;
    let problems: Vec<String> = tree.verify().iter().map(ToString::to_string).collect();

    if problems.is_empty() {
        return output_success(
            output_format,
            &format!("{} organizations, all paths consistent", tree.len()),
            Some(json!({ "organizations": tree.len() })),
        );
    }

    if output_format == OutputFormat::Text {
        for problem in &problems {
            println!("  {}", problem);
        }
    }
    output_error(
        output_format,
        &format!("{} inconsistencies in {} organizations", problems.len(), tree.len()),
        Some(json!({ "organizations": tree.len(), "problems": problems })),
    )?;
    bail!("hierarchy verification failed")
}
