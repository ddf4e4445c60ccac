//! `tokenkeeper status`: offline view of the stored credential.
//!
//! Only reads the token file. Client secrets are not needed and nothing is
//! sent over the network.

use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokenkeeper_oauth::{AuthErrorCode, TokenStore};

use super::format_secs;
use crate::config::AppConfig;
use crate::error::{ClientError, ClientResult};

/// Result of the offline expiry check.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct StatusReport {
    pub token_path: PathBuf,
    pub credential_present: bool,
    /// Why the token file could not be used, if it exists but is unreadable.
    pub problem: Option<String>,
    pub expiry: Option<DateTime<Utc>>,
    pub needs_refresh: bool,
    pub refreshable: bool,
    pub scopes: Vec<String>,
}

impl StatusReport {
    /// Applies the same expiry policy as the refresh engine.
    pub fn collect(store: &TokenStore, buffer: Duration, refresh_when_unknown: bool) -> Self {
        let token_path = store.path().to_path_buf();
        match store.load() {
            Ok(credential) => Self {
                token_path,
                credential_present: true,
                problem: None,
                expiry: credential.expiry,
                needs_refresh: credential
                    .expires_within(buffer)
                    .unwrap_or(refresh_when_unknown),
                refreshable: credential.can_refresh(),
                scopes: credential.scopes,
            },
            Err(e) => Self {
                token_path,
                credential_present: false,
                problem: (e.code() != AuthErrorCode::TokenNotFound).then(|| e.to_string()),
                expiry: None,
                needs_refresh: true,
                refreshable: false,
                scopes: Vec::new(),
            },
        }
    }
}

pub fn status(config: &AppConfig, json: bool) -> ClientResult<()> {
    let store = TokenStore::new(config.oauth.token_path());
    let report = StatusReport::collect(
        &store,
        config.monitor.refresh_buffer(),
        config.oauth.refresh_when_expiry_unknown,
    );

    if json {
        let out = serde_json::to_string_pretty(&report)
            .map_err(|e| ClientError::Auth(format!("failed to serialize status: {}", e)))?;
        println!("{}", out);
        return Ok(());
    }

    println!("token:         {}", report.token_path.display());
    if !report.credential_present {
        match &report.problem {
            Some(problem) => println!("credential:    unusable ({})", problem),
            None => println!("credential:    none"),
        }
        println!("needs refresh: yes");
        return Ok(());
    }

    match report.expiry {
        Some(expiry) => println!(
            "expires:       {} ({})",
            expiry.to_rfc3339(),
            format_secs((expiry - Utc::now()).num_seconds())
        ),
        None => println!("expires:       unknown"),
    }
    println!(
        "needs refresh: {}",
        if report.needs_refresh { "yes" } else { "no" }
    );
    println!(
        "refreshable:   {}",
        if report.refreshable { "yes" } else { "no, reauthorization required" }
    );
    println!("scopes:        {}", report.scopes.join(" "));
    Ok(())
}
