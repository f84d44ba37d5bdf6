//! CLI command implementation for `romtools unlock`
//!
//! Unlocking is never performed by this tool; the command exists so the
//! refusal and its reason are visible.

use anyhow::Result;

use super::Session;

pub async fn execute(session: &Session) -> Result<()> {
    session.manager().request_unlock().await?;
    Ok(())
}
