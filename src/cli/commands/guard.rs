use anyhow::bail;
use serde_json::json;

use crate::authz::guard::{PrivilegeGuard, Severity};
use crate::cli::utils::{output_error, output_success, to_value};
use crate::cli::OutputFormat;
use crate::database::manager::DatabaseManager;

/// Runs the guard through the application pool, so `SET ROLE` applies
pub async fn handle(output_format: OutputFormat) -> anyhow::Result<()> {
    let pool = DatabaseManager::app_pool().await?;
    let report = PrivilegeGuard::default().verify(&pool).await?;
    let data = Some(json!({ "report": to_value(&report)? }));

    if output_format == OutputFormat::Text {
        println!("role {} (session user {}), {} tables checked", report.role, report.session_user, report.checked_tables);
        for finding in &report.findings {
            let marker = match finding.severity {
                Severity::Critical => "CRITICAL",
                Severity::Warning => "warning",
            };
            println!("  {:<8} {:?} {}: {}", marker, finding.kind, finding.subject, finding.detail);
        }
    }

    if report.safe {
        output_success(output_format, "Row policies cannot be bypassed", data)
    } else {
        output_error(output_format, "Privilege guard found critical issues", data)?;
        bail!("{} critical finding(s)", report.critical())
    }
}
