//! Storegate CLI - operator commands
//!
//! Usage:
//!   storegate purge-sessions
//!   storegate revoke-sessions --user <email|id>
//!   storegate audit [--action <name>] [--user <id>] [--outcome <outcome>] [--limit <n>]
//!   storegate create-admin --email <email> --name <name> [--superadmin]
//!
//! Configuration is read the same way as the server (`STOREGATE_CONFIG`,
//! then environment variables).

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use storegate_api::{auth::validate_password_strength, build_state, purge_expired, state::AppState};
use storegate_core::{
    normalize_email, AppConfig, AuditFilter, AuditOutcome, Identity, NewAuditEntry, PageRequest,
    Role, StorageBackend,
};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "storegate")]
#[command(about = "Storegate session and access-control operator CLI")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Delete expired sessions and one-time tokens
    PurgeSessions,
    /// Revoke every session of a user
    RevokeSessions {
        /// Email address or user ID
        #[arg(long)]
        user: String,
    },
    /// List audit log entries, newest first
    Audit {
        #[arg(long)]
        action: Option<String>,
        /// Acting user ID
        #[arg(long)]
        user: Option<Uuid>,
        /// success, failure or denied
        #[arg(long)]
        outcome: Option<AuditOutcome>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// Create an administrator account
    CreateAdmin {
        #[arg(long)]
        email: String,
        #[arg(long)]
        name: String,
        /// Password; read from STOREGATE_ADMIN_PASSWORD when omitted
        #[arg(long, env = "STOREGATE_ADMIN_PASSWORD", hide_env_values = true)]
        password: String,
        /// Grant superadmin instead of admin
        #[arg(long)]
        superadmin: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "storegate_cli=info,warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load().context("Failed to load configuration")?;
    if config.database.backend == StorageBackend::Memory {
        tracing::warn!("DATABASE_BACKEND is memory; changes will not outlive this command");
    }
    let state = build_state(config).await?;

    match cli.command {
        Commands::PurgeSessions => {
            let (sessions, tokens) = purge_expired(&state).await?;
            println!("Purged {sessions} expired sessions and {tokens} expired tokens");
        }
        Commands::RevokeSessions { user } => {
            let identity = find_identity(&state, &user).await?;
            let revoked = state.stores.sessions.revoke_all(identity.id).await?;
            record(
                &state,
                NewAuditEntry::new("cli.sessions.revoke", AuditOutcome::Success)
                    .target(identity.id.to_string())
                    .detail(format!("sessions_revoked={revoked}")),
            )
            .await?;
            println!("Revoked {revoked} sessions for {}", identity.email);
        }
        Commands::Audit {
            action,
            user,
            outcome,
            limit,
        } => {
            let filter = AuditFilter {
                action,
                actor_id: user,
                outcome,
            };
            let page = state
                .stores
                .audit
                .list(&filter, PageRequest::new(Some(1), Some(limit)))
                .await?;
            for entry in &page.items {
                println!(
                    "{}  {:<8} {:<32} actor={} target={} {}",
                    entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.outcome.as_str(),
                    entry.action,
                    entry.actor_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string()),
                    entry.target.as_deref().unwrap_or("-"),
                    entry.detail.as_deref().unwrap_or(""),
                );
            }
            println!("{} of {} entries", page.items.len(), page.total);
        }
        Commands::CreateAdmin {
            email,
            name,
            password,
            superadmin,
        } => {
            validate_password_strength(&password).map_err(anyhow::Error::msg)?;
            let email = normalize_email(&email);
            if state.stores.identities.find_by_email(&email).await?.is_some() {
                bail!("An account for {email} already exists");
            }

            let role = if superadmin { Role::Superadmin } else { Role::Admin };
            let hash = state.auth.hash_password(&password).await?;
            let mut identity = Identity::new(&email, name, hash, role);
            identity.email_verified = true;
            let identity = state.stores.identities.insert(identity).await?;

            record(
                &state,
                NewAuditEntry::new("cli.admin.create", AuditOutcome::Success)
                    .target(identity.id.to_string())
                    .detail(format!("role={role}")),
            )
            .await?;
            println!("Created {role} {} ({})", identity.email, identity.id);
        }
    }

    Ok(())
}

async fn find_identity(state: &AppState, user: &str) -> anyhow::Result<Identity> {
    let found = match user.parse::<Uuid>() {
        Ok(id) => state.stores.identities.find_by_id(id).await?,
        Err(_) => {
            state
                .stores
                .identities
                .find_by_email(&normalize_email(user))
                .await?
        }
    };
    found.with_context(|| format!("No user matches {user}"))
}

async fn record(state: &Arc<AppState>, entry: NewAuditEntry) -> anyhow::Result<()> {
    state.audit.record(entry).await?;
    Ok(())
}
