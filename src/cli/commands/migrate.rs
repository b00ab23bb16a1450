use serde_json::json;

use crate::cli::utils::{output_success, to_value};
use crate::cli::OutputFormat;
use crate::database::manager::DatabaseManager;
use crate::database::migrate::PolicyMigrator;

pub async fn handle(dry_run: bool, output_format: OutputFormat) -> anyhow::Result<()> {
    let migrator = PolicyMigrator::from_config();

    if dry_run {
        let (plan, report) = migrator.dry_run()?;
        return match output_format {
            OutputFormat::Json => output_success(
                output_format,
                "Dry run; nothing applied",
                Some(json!({ "report": to_value(&report)?, "sql": plan.full_sql() })),
            ),
            OutputFormat::Text => {
                println!("{}", plan.full_sql());
                println!("-- fingerprint {}", plan.fingerprint);
                Ok(())
            }
        };
    }

    let pool = DatabaseManager::migration_pool().await?;
    let report = migrator.apply(&pool).await?;

    let message = match &report.previous_fingerprint {
        Some(previous) if *previous == report.fingerprint => {
            format!("Row policies already at {}", short(&report.fingerprint))
        }
        _ => format!(
            "Applied row policies {} to {} tables",
            short(&report.fingerprint),
            report.tables.len()
        ),
    };
    if output_format == OutputFormat::Text {
        for finding in &report.findings {
            println!("  ! {:?} {}: {}", finding.kind, finding.subject, finding.detail);
        }
    }
    output_success(output_format, &message, Some(json!({ "report": to_value(&report)? })))
}

fn short(fingerprint: &str) -> &str {
    fingerprint.get(..12).unwrap_or(fingerprint)
}
