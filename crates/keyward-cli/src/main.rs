//! CLI entry point for keyward.
//!
//! This binary provides the `keyward` command for administering a vault
//! from the terminal.

mod cli;
mod helpers;

use anyhow::{Context, Result, bail};
use clap::Parser;
use keyward_vault::{Vault, VaultConfig};
use tracing::{debug, info};

use crate::cli::{Cli, Commands, UserAction};
use crate::helpers::{
    BACKUP_PASSWORD_ENV, NEW_PASSWORD_ENV, PASSWORD_ENV, USER_PASSWORD_ENV, cancel_on_ctrl_c,
    init_tracing, read_new_password, read_password,
};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("warning: failed to load .env: {e}");
        }
    }

    let cli = Cli::parse();
    init_tracing(if cli.verbose { "debug" } else { "info" });

    let config = VaultConfig::load(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;
    debug!(data_dir = %config.data_dir.display(), "configuration loaded");

    let vault = Vault::open(config).await.context("failed to open vault")?;

    let result = match cli.command {
        Commands::Init => cmd_init(&vault).await,
        Commands::Status { json } => cmd_status(&vault, json).await,
        Commands::RotatePassword => cmd_rotate_password(&vault).await,
        Commands::RotateDataKey => cmd_rotate_data_key(&vault).await,
        Commands::User { action } => cmd_user(&vault, action).await,
        Commands::Credentials { credential_type } => {
            cmd_credentials(&vault, credential_type.as_deref()).await
        }
        Commands::ApiKeys { service } => cmd_api_keys(&vault, service.as_deref()).await,
        Commands::Backup { out } => cmd_backup(&vault, &out).await,
        Commands::Restore { from } => cmd_restore(&vault, &from).await,
        Commands::Audit { limit } => cmd_audit(&vault, limit).await,
    };

    vault.close().await;
    result
}

/// Unlock with the password from the environment or a prompt.
async fn unlock(vault: &Vault) -> Result<()> {
    if !vault.is_initialized() {
        bail!("vault is not initialized; run `keyward init` first");
    }
    let password = read_password(PASSWORD_ENV, "Vault password: ")?;
    vault.unlock(&password).await.context("failed to unlock vault")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

async fn cmd_init(vault: &Vault) -> Result<()> {
    if vault.is_initialized() {
        bail!("vault is already initialized");
    }
    let password = read_new_password(PASSWORD_ENV, "New vault password: ")?;
    vault.initialize(&password).await.context("failed to initialize vault")?;
    info!("vault initialized");
    println!("Vault initialized at {}", vault.config().data_dir.display());
    Ok(())
}

async fn cmd_status(vault: &Vault, json: bool) -> Result<()> {
    let stats = vault.stats().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("  Data dir:          {}", vault.config().data_dir.display());
    println!("  Initialized:       {}", stats.initialized);
    match stats.active_key_version {
        Some(version) => println!("  Active data key:   v{version}"),
        None => println!("  Active data key:   none"),
    }
    println!("  Credentials:       {}", stats.credentials);
    println!("  API keys:          {}", stats.api_keys);
    println!("  Users:             {}", stats.users);
    println!("  Active sessions:   {}", stats.sessions);
    println!("  Audit events/24h:  {}", stats.audit_events_24h);
    Ok(())
}

async fn cmd_rotate_password(vault: &Vault) -> Result<()> {
    let old = read_password(PASSWORD_ENV, "Current vault password: ")?;
    let new = read_new_password(NEW_PASSWORD_ENV, "New vault password: ")?;
    vault
        .rotate_master_key(&old, &new)
        .await
        .context("failed to change vault password")?;
    println!("Vault password changed");
    Ok(())
}

async fn cmd_rotate_data_key(vault: &Vault) -> Result<()> {
    unlock(vault).await?;
    let version = vault.rotate_data_key().await.context("data key rotation failed")?;
    println!("Records re-encrypted under data key v{version}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

async fn cmd_user(vault: &Vault, action: UserAction) -> Result<()> {
    match action {
        UserAction::Add {
            username,
            email,
            role,
        } => {
            let password = read_new_password(USER_PASSWORD_ENV, "User password: ")?;
            let user = vault
                .register_user(&username, &email, &password, role.into())
                .await
                .context("failed to register user")?;
            println!("Registered {} ({}) as {}", user.username, user.id, user.role);
        }
        UserAction::Deactivate { id } => {
            vault
                .deactivate_user(&id)
                .await
                .with_context(|| format!("failed to deactivate user {id}"))?;
            println!("Deactivated user {id}");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

async fn cmd_credentials(vault: &Vault, credential_type: Option<&str>) -> Result<()> {
    unlock(vault).await?;
    let credentials = vault.list_credentials(credential_type).await?;
    if credentials.is_empty() {
        println!("No credentials stored.");
        return Ok(());
    }
    for c in credentials {
        let expires = c
            .expires_at
            .map(|t| t.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "never".into());
        println!(
            "  {:<24} {:<12} v{} reads={} expires={} [{}]",
            c.name,
            c.credential_type,
            c.key_version,
            c.access_count,
            expires,
            c.tags.join(",")
        );
    }
    Ok(())
}

async fn cmd_api_keys(vault: &Vault, service: Option<&str>) -> Result<()> {
    unlock(vault).await?;
    let keys = vault.list_api_keys(service).await?;
    if keys.is_empty() {
        println!("No API keys stored.");
        return Ok(());
    }
    for k in keys {
        let last_used = k
            .last_used
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".into());
        println!(
            "  {:<24} {:<12} uses={} last_used={} perms={}",
            k.name,
            k.service,
            k.usage_count,
            last_used,
            k.permissions.join(",")
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Backup
// ---------------------------------------------------------------------------

async fn cmd_backup(vault: &Vault, out: &std::path::Path) -> Result<()> {
    unlock(vault).await?;
    let password = read_new_password(BACKUP_PASSWORD_ENV, "Backup password: ")?;
    let cancel = cancel_on_ctrl_c();
    let summary = vault
        .backup_with_cancel(&password, out, &cancel)
        .await
        .context("backup failed")?;
    println!(
        "Backup written to {}: {} users, {} credentials, {} API keys, {} audit events",
        summary.path.display(),
        summary.users,
        summary.credentials,
        summary.api_keys,
        summary.audit_events
    );
    Ok(())
}

async fn cmd_restore(vault: &Vault, from: &std::path::Path) -> Result<()> {
    unlock(vault).await?;
    let password = read_password(BACKUP_PASSWORD_ENV, "Backup password: ")?;
    let cancel = cancel_on_ctrl_c();
    let summary = vault
        .restore_with_cancel(from, &password, &cancel)
        .await
        .context("restore failed")?;
    println!(
        "Restored backup from {} (created {}): {} users, {} credentials, {} API keys",
        from.display(),
        summary.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
        summary.users,
        summary.credentials,
        summary.api_keys
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

async fn cmd_audit(vault: &Vault, limit: usize) -> Result<()> {
    let events = vault.recent_audit_events(limit).await?;
    for e in events {
        println!(
            "  {} {:<22} {:<4} user={} target={}{}",
            e.timestamp.format("%Y-%m-%d %H:%M:%S"),
            e.action.as_str(),
            if e.success { "ok" } else { "FAIL" },
            e.user_id.as_deref().unwrap_or("-"),
            e.target_name.as_deref().unwrap_or("-"),
            e.detail.map(|d| format!(" ({d})")).unwrap_or_default()
        );
    }
    Ok(())
}
