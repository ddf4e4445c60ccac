//! `tokenkeeper refresh`

use super::{CredentialSummary, build_orchestrator, cancel_on_signal};
use crate::config::AppConfig;
use crate::error::{ClientError, ClientResult};

/// Runs the interactive reauthorization even if the credential is still valid.
pub async fn refresh(config: &AppConfig) -> ClientResult<()> {
    let orchestrator = build_orchestrator(config)?;
    cancel_on_signal(&orchestrator);

    let credential = orchestrator
        .force_refresh()
        .await
        .ok_or_else(|| ClientError::NoCredential("authorization did not complete".to_string()))?;

    CredentialSummary::new(
        Some(&credential),
        orchestrator.engine().store().path().to_path_buf(),
    )
    .print(false)
}
