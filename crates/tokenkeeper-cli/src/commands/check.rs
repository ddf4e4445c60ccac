//! `tokenkeeper check`

use tracing::info;

use super::{CredentialSummary, build_orchestrator, cancel_on_signal};
use crate::config::AppConfig;
use crate::error::{ClientError, ClientResult};

/// Obtains a valid credential once, reauthorizing interactively if needed.
pub async fn check(config: &AppConfig, json: bool) -> ClientResult<()> {
    let orchestrator = build_orchestrator(config)?;
    cancel_on_signal(&orchestrator);

    let credential = orchestrator.get_valid_credentials().await;
    let summary = CredentialSummary::new(
        credential.as_ref(),
        orchestrator.engine().store().path().to_path_buf(),
    );
    summary.print(json)?;

    match credential {
        Some(_) => {
            info!("credential check passed");
            Ok(())
        }
        None => Err(ClientError::NoCredential(
            "refresh failed or nobody authorized in time, retry later".to_string(),
        )),
    }
}
