//! CLI argument definitions for keyward.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use keyward_vault::UserRole;

/// keyward -- an encrypted credential vault.
#[derive(Parser)]
#[command(
    name = "keyward",
    version,
    about = "keyward -- encrypted credential vault",
    long_about = "Administer a keyward vault: initialize it, rotate its keys, manage users, \
                  and take or restore encrypted backups.\n\n\
                  Passwords are read from KEYWARD_PASSWORD, KEYWARD_NEW_PASSWORD and \
                  KEYWARD_BACKUP_PASSWORD when set, and prompted for otherwise."
)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, short, global = true, default_value = "config/keyward.toml")]
    pub config: PathBuf,

    /// Log at debug level (overridden by RUST_LOG).
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a new vault and set its password.
    Init,

    /// Show vault state and record counts.
    Status {
        /// Print machine-readable JSON.
        #[arg(long)]
        json: bool,
    },

    /// Change the vault password (re-wraps the master key).
    RotatePassword,

    /// Re-encrypt every record under a fresh data key.
    RotateDataKey,

    /// Manage user accounts.
    User {
        #[command(subcommand)]
        action: UserAction,
    },

    /// List stored credentials (metadata only).
    Credentials {
        /// Only show credentials of this type.
        #[arg(long = "type")]
        credential_type: Option<String>,
    },

    /// List stored API keys (metadata only).
    ApiKeys {
        /// Only show keys for this service.
        #[arg(long)]
        service: Option<String>,
    },

    /// Write an encrypted backup archive.
    Backup {
        /// Destination file.
        #[arg(long)]
        out: PathBuf,
    },

    /// Replace the vault contents with a backup archive.
    Restore {
        /// Archive to restore from.
        #[arg(long)]
        from: PathBuf,
    },

    /// Show recent audit events, newest first.
    Audit {
        /// Number of events to show.
        #[arg(long, short, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Subcommand)]
pub enum UserAction {
    /// Register a new user. The password is prompted for.
    Add {
        username: String,
        email: String,
        #[arg(long, value_enum, default_value_t = RoleArg::User)]
        role: RoleArg,
    },

    /// Deactivate a user and end their sessions.
    Deactivate {
        /// User ID.
        id: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum RoleArg {
    Admin,
    User,
    Viewer,
}

impl From<RoleArg> for UserRole {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Admin => UserRole::Admin,
            RoleArg::User => UserRole::User,
            RoleArg::Viewer => UserRole::Viewer,
        }
    }
}
