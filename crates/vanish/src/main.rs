use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use vanish_server::{
    client::{handle_from_target, ServerClient},
    grant::{AccessGranter, AccessRequest, DatabaseKind},
    issuer::{VaultIssuer, DEFAULT_VAULT_ADDR},
    notify::{LogNotifier, Notifier, SlackNotifier},
    render::format_timestamp,
    store::RedbAuditLog,
    ServerConfig, StoreBackend,
};

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "vanish",
    about = "vanish: short-lived database credentials behind one-time links",
    version
)]
struct Cli {
    /// vanish server URL (default: http://localhost:8080 or $VANISH_SERVER)
    #[arg(long, global = true, env = "VANISH_SERVER", default_value = "http://localhost:8080")]
    server: String,

    /// Bearer token for the management API ($VANISH_API_TOKEN)
    #[arg(long, global = true, env = "VANISH_API_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the vanish HTTP server
    Serve {
        /// Port to listen on
        #[arg(long, env = "VANISH_PORT", default_value = "8080")]
        port: u16,
        /// Host to bind
        #[arg(long, env = "VANISH_HOST", default_value = "0.0.0.0")]
        host: String,
        /// Data directory (default: $VANISH_DATA_DIR or the platform data dir)
        #[arg(long, env = "VANISH_DATA_DIR")]
        data_dir: Option<PathBuf>,
        /// Base URL for one-time links (default: http://{host}:{port})
        #[arg(long, env = "VANISH_PUBLIC_URL")]
        public_url: Option<String>,
        /// Record store backend: file or memory
        #[arg(long, env = "VANISH_STORE", default_value = "file")]
        store: StoreBackend,
        /// Default secret lifetime, e.g. 1h, 30m
        #[arg(long, env = "VANISH_DEFAULT_TTL", default_value = "1h", value_parser = parse_duration)]
        default_ttl: Duration,
        /// Longest lifetime a caller may request
        #[arg(long, env = "VANISH_MAX_TTL", default_value = "24h", value_parser = parse_duration)]
        max_ttl: Duration,
        /// Interval between expiry sweeps
        #[arg(long, env = "VANISH_SWEEP_INTERVAL", default_value = "5m", value_parser = parse_duration)]
        sweep_interval: Duration,
        /// Destroy secrets on first read unless a caller says otherwise
        #[arg(long, env = "VANISH_BURN_AFTER_READING", default_value_t = true, action = clap::ArgAction::Set)]
        burn_after_reading: bool,
        /// Days of audit history to keep
        #[arg(long, env = "VANISH_AUDIT_RETENTION_DAYS", default_value = "30")]
        audit_retention_days: u64,
    },
    /// Issue database credentials and deliver them through a one-time link
    Grant {
        /// Database type: mysql or mongodb
        database: DatabaseKind,
        /// Email of the requesting developer
        requester: String,
        /// Business justification for access
        justification: String,
        #[command(flatten)]
        vault: VaultArgs,
        /// Slack incoming webhook for the notification (logs it when unset)
        #[arg(long, env = "VANISH_SLACK_WEBHOOK")]
        slack_webhook: Option<String>,
        /// HMAC secret for signing webhook bodies
        #[arg(long, env = "VANISH_SLACK_SIGNING_SECRET", hide_env_values = true)]
        slack_signing_secret: Option<String>,
        /// Database host written into the credential bundle
        #[arg(long, env = "VANISH_DB_HOST", default_value = "localhost")]
        db_host: String,
        /// Database name written into the credential bundle
        #[arg(long, env = "VANISH_DB_NAME", default_value = "demo")]
        db_name: String,
        /// Upper bound for the link lifetime
        #[arg(long, default_value = "1h", value_parser = parse_duration)]
        ttl: Duration,
        /// Local redb file for grant audit events
        #[arg(long, env = "VANISH_GRANT_AUDIT_DB")]
        audit_db: Option<PathBuf>,
    },
    /// Revoke a grant early: the issuer lease, the link, or both
    Revoke {
        /// Lease id printed by `grant`
        #[arg(long)]
        lease: Option<String>,
        /// Handle or link printed by `grant`
        #[arg(long)]
        handle: Option<String>,
        #[command(flatten)]
        vault: VaultArgs,
        /// Local redb file for grant audit events
        #[arg(long, env = "VANISH_GRANT_AUDIT_DB")]
        audit_db: Option<PathBuf>,
    },
    /// Open a one-time link and print its content (this consumes it)
    View {
        /// Handle or full link
        target: String,
    },
    /// Delete all expired secrets immediately
    Prune,
    /// Show recent audit events
    Audit {
        /// Only events with this action, e.g. secret.burned
        #[arg(long)]
        action: Option<String>,
        /// Maximum number of events
        #[arg(long, default_value = "50")]
        limit: usize,
    },
}

#[derive(clap::Args)]
struct VaultArgs {
    /// Vault address
    #[arg(long, env = "VAULT_ADDR", default_value = DEFAULT_VAULT_ADDR)]
    vault_addr: String,
    /// Vault token
    #[arg(long, env = "VAULT_TOKEN", hide_env_values = true)]
    vault_token: Option<String>,
}

impl VaultArgs {
    fn issuer(&self) -> Result<VaultIssuer> {
        let token = self
            .vault_token
            .clone()
            .context("--vault-token / VAULT_TOKEN is required for this command")?;
        VaultIssuer::new(&self.vault_addr, token).context("build Vault client")
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if matches!(cli.command, Commands::Serve { .. }) {
        "info"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("VANISH_LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve {
            port,
            host,
            data_dir,
            public_url,
            store,
            default_ttl,
            max_ttl,
            sweep_interval,
            burn_after_reading,
            audit_retention_days,
        } => {
            let cfg = ServerConfig {
                host,
                port,
                api_token: cli.token,
                data_dir,
                public_url,
                store,
                default_ttl,
                max_ttl,
                sweep_interval,
                burn_after_reading,
                audit_retention_days,
            };
            vanish_server::run(cfg).await
        }

        Commands::Grant {
            database,
            requester,
            justification,
            vault,
            slack_webhook,
            slack_signing_secret,
            db_host,
            db_name,
            ttl,
            audit_db,
        } => {
            let notifier: Arc<dyn Notifier> = match slack_webhook {
                Some(url) => Arc::new(
                    SlackNotifier::new(url, slack_signing_secret)
                        .context("build Slack client")?,
                ),
                None => Arc::new(LogNotifier),
            };
            let granter = AccessGranter::new(
                Arc::new(vault.issuer()?),
                Arc::new(client(&cli.server, cli.token)?),
                notifier,
            )
            .with_target(db_host, db_name)
            .with_link_ttl(ttl);
            let granter = with_audit(granter, audit_db.as_ref())?;

            let request = AccessRequest {
                database,
                requester,
                justification,
            };
            let grant = granter.grant(&request).await.context("access grant failed")?;
            println!("{}", serde_json::to_string_pretty(&grant)?);
            Ok(())
        }

        Commands::Revoke {
            lease,
            handle,
            vault,
            audit_db,
        } => {
            if lease.is_none() && handle.is_none() {
                anyhow::bail!("nothing to revoke: pass --lease and/or --handle");
            }
            let granter = AccessGranter::new(
                Arc::new(vault.issuer()?),
                Arc::new(client(&cli.server, cli.token)?),
                Arc::new(LogNotifier),
            );
            let granter = with_audit(granter, audit_db.as_ref())?;

            let handle = handle.as_deref().map(handle_from_target);
            let outcome = granter.revoke(lease.as_deref(), handle).await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if (lease.is_some() && !outcome.lease_revoked)
                || (handle.is_some() && !outcome.link_revoked)
            {
                anyhow::bail!("revocation incomplete");
            }
            Ok(())
        }

        Commands::View { target } => {
            let client = client(&cli.server, None)?;
            match client.view(handle_from_target(&target)).await? {
                Some(revealed) => {
                    println!("{}", revealed.content);
                    eprintln!("expires {}", format_timestamp(revealed.expires_at));
                    if revealed.burned {
                        eprintln!("this link has been destroyed");
                    }
                    Ok(())
                }
                None => anyhow::bail!("this link is no longer available"),
            }
        }

        Commands::Prune => {
            let n = client(&cli.server, cli.token)?.prune().await?;
            println!("swept {n} expired secret(s)");
            Ok(())
        }

        Commands::Audit { action, limit } => {
            let events = client(&cli.server, cli.token)?
                .audit(action.as_deref(), limit)
                .await?;
            if events.is_empty() {
                println!("(no audit events)");
            }
            for e in &events {
                println!(
                    "{:>6}  {}  {:<15} {:<4} {:<12} {}",
                    e.id,
                    format_timestamp(e.timestamp * 1000),
                    e.action,
                    if e.success { "ok" } else { "fail" },
                    e.handle.as_deref().unwrap_or("-"),
                    e.detail.as_deref().unwrap_or(""),
                );
            }
            Ok(())
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn client(server: &str, token: Option<String>) -> Result<ServerClient> {
    ServerClient::new(server, token).context("build HTTP client")
}

fn with_audit(granter: AccessGranter, path: Option<&PathBuf>) -> Result<AccessGranter> {
    match path {
        Some(p) => {
            let log = RedbAuditLog::open(p)
                .with_context(|| format!("open grant audit log: {}", p.display()))?;
            Ok(granter.with_audit(Arc::new(log)))
        }
        None => Ok(granter),
    }
}

/// Parse human duration strings like "1h", "30m", "7d", "5s".
fn parse_duration(s: &str) -> Result<Duration> {
    let d = humantime::parse_duration(s).with_context(|| format!("invalid duration: {s}"))?;
    if d.is_zero() {
        anyhow::bail!("duration must be greater than zero");
    }
    Ok(d)
}
