//! Secret references in `config.toml`.
//!
//! Client secrets, SMTP passwords and webhook URLs should not live in the
//! config file in clear text. A value can instead point at where the secret
//! is kept:
//!
//! - `env::VAR` reads `$VAR`
//! - `file::/run/secrets/smtp` reads the first line of a file
//! - `pass::mail/smtp` runs `pass show mail/smtp` and keeps the first line
//!
//! Anything else is used verbatim.

use std::path::PathBuf;
use std::process::Command;

/// Where a configured secret comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretRef {
    Plain(String),
    Env(String),
    File(PathBuf),
    Pass(String),
}

impl SecretRef {
    pub fn parse(value: &str) -> Self {
        if let Some(var) = value.strip_prefix("env::") {
            Self::Env(var.to_string())
        } else if let Some(path) = value.strip_prefix("file::") {
            Self::File(PathBuf::from(path))
        } else if let Some(entry) = value.strip_prefix("pass::") {
            Self::Pass(entry.to_string())
        } else {
            Self::Plain(value.to_string())
        }
    }

    /// Reads the secret. Empty secrets are an error.
    pub fn read(&self) -> Result<String, String> {
        let value = match self {
            Self::Plain(value) => return Ok(value.clone()),
            Self::Env(var) => std::env::var(var)
                .map_err(|_| format!("environment variable `{}` is not set", var))?,
            Self::File(path) => {
                let content = std::fs::read_to_string(path)
                    .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
                first_line(&content)
                    .ok_or_else(|| format!("{} is empty", path.display()))?
            }
            Self::Pass(entry) => read_pass(entry)?,
        };

        if value.is_empty() {
            return Err(format!("{} resolved to an empty value", self.describe()));
        }
        Ok(value)
    }

    /// A printable description that never contains the secret itself.
    pub fn describe(&self) -> String {
        match self {
            Self::Plain(_) => "inline value".to_string(),
            Self::Env(var) => format!("env::{}", var),
            Self::File(path) => format!("file::{}", path.display()),
            Self::Pass(entry) => format!("pass::{}", entry),
        }
    }
}

/// Resolves a possibly-referenced secret value.
pub fn resolve(value: &str) -> Result<String, String> {
    SecretRef::parse(value).read()
}

fn first_line(content: &str) -> Option<String> {
    content
        .lines()
        .next()
        .map(|line| line.trim_end().to_string())
        .filter(|line| !line.is_empty())
}

fn read_pass(entry: &str) -> Result<String, String> {
    let output = Command::new("pass")
        .args(["show", entry])
        .output()
        .map_err(|e| format!("failed to run `pass show {}`: {}", entry, e))?;

    if !output.status.success() {
        return Err(format!(
            "`pass show {}` exited with {}: {}",
            entry,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }

    first_line(&String::from_utf8_lossy(&output.stdout))
        .ok_or_else(|| format!("`pass show {}` printed nothing", entry))
}
