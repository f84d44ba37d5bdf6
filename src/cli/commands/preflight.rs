//! CLI command implementation for `romtools preflight`
//!
//! Exits non-zero when the assessment finds critical issues.

use anyhow::{bail, Result};

use super::Session;
use crate::cli::output::{self, status};
use crate::core::bootloader::GatedOperation;

pub async fn execute(session: &Session, operation: GatedOperation) -> Result<()> {
    let result = session.manager().preflight(operation).await?;

    if output::is_json() {
        output::print_json(&result)?;
    } else if !output::is_quiet() {
        for issue in &result.critical_issues {
            println!("{} {issue}", status::ERROR);
        }
        for warning in &result.warnings {
            println!("{} {warning}", status::WARNING);
        }
    }

    if !result.passed {
        bail!(
            "Device not ready for {}: {} critical issue(s)",
            operation,
            result.critical_issues.len()
        );
    }
    output::success(&format!("Device ready for {operation}"));
    Ok(())
}
