//! Shared helpers for the CLI: tracing setup, password input, cancellation.

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

pub const PASSWORD_ENV: &str = "KEYWARD_PASSWORD";
pub const NEW_PASSWORD_ENV: &str = "KEYWARD_NEW_PASSWORD";
pub const BACKUP_PASSWORD_ENV: &str = "KEYWARD_BACKUP_PASSWORD";
pub const USER_PASSWORD_ENV: &str = "KEYWARD_USER_PASSWORD";

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` wins over `default_level`.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

/// Read a password from `env_var`, or prompt for it on the terminal.
pub fn read_password(env_var: &str, prompt: &str) -> Result<String> {
    if let Ok(value) = std::env::var(env_var) {
        if !value.is_empty() {
            return Ok(value);
        }
    }
    rpassword::prompt_password(prompt).with_context(|| format!("failed to read {prompt}"))
}

/// Like [`read_password`] but asks twice when prompting.
pub fn read_new_password(env_var: &str, prompt: &str) -> Result<String> {
    if let Ok(value) = std::env::var(env_var) {
        if !value.is_empty() {
            return Ok(value);
        }
    }
    let first = rpassword::prompt_password(prompt).context("failed to read password")?;
    let second = rpassword::prompt_password("Confirm: ").context("failed to read password")?;
    if first != second {
        bail!("passwords do not match");
    }
    if first.is_empty() {
        bail!("password must not be empty");
    }
    Ok(first)
}

/// A token cancelled on the first Ctrl-C.
pub fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            child.cancel();
        }
    });
    token
}
