//! Developer access grants: issue a database login, publish it behind a
//! one-time link, and tell the requester where to find it.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::broker::Broker;
use crate::client::{ClientError, ServerClient};
use crate::error::BrokerError;
use crate::handle::Handle;
use crate::issuer::{CredentialIssuer, IssuedCredential, IssuerError};
use crate::notify::{CredentialNotice, Notifier};
use crate::render::format_timestamp;
use crate::store::audit::{ACTION_GRANT_ISSUE, ACTION_GRANT_REVOKE};
use crate::store::{now_millis, AuditEvent, AuditSink, Payload};

/// Default lifetime of a grant's link when the lease is longer.
pub const DEFAULT_GRANT_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    Mysql,
    Mongodb,
}

impl DatabaseKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mysql => "mysql",
            Self::Mongodb => "mongodb",
        }
    }

    /// Issuer role that mints logins for this database.
    pub fn role(self) -> &'static str {
        match self {
            Self::Mysql => "mysql-role",
            Self::Mongodb => "mongodb-role",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Self::Mysql => 3306,
            Self::Mongodb => 27017,
        }
    }

    fn connection_example(self, host: &str, database: &str, cred: &IssuedCredential) -> String {
        let port = self.default_port();
        match self {
            Self::Mysql => format!(
                "mysql -h {host} -P {port} -u {} -p'{}' {database}",
                cred.username,
                cred.password.as_str()
            ),
            Self::Mongodb => format!(
                "mongodb://{}:{}@{host}:{port}/{database}",
                cred.username,
                cred.password.as_str()
            ),
        }
    }
}

impl fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatabaseKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mysql" => Ok(Self::Mysql),
            "mongodb" | "mongo" => Ok(Self::Mongodb),
            other => Err(format!("unsupported database type: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AccessRequest {
    pub database: DatabaseKind,
    pub requester: String,
    pub justification: String,
}

/// Outcome of a successful grant. Holds the link, never the credentials.
#[derive(Debug, Clone, Serialize)]
pub struct AccessGrant {
    pub request_id: String,
    pub requester: String,
    pub database: DatabaseKind,
    pub justification: String,
    pub lease_id: String,
    pub handle: String,
    pub link: String,
    /// Unix milliseconds.
    pub requested_at: i64,
    /// Unix milliseconds.
    pub expires_at: i64,
    pub notified: bool,
}

/// Result of [`AccessGranter::revoke`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Revocation {
    pub lease_revoked: bool,
    pub link_revoked: bool,
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Remote(#[from] ClientError),
}

#[derive(Debug, Error)]
pub enum GrantError {
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    #[error("credential issue failed: {0}")]
    Issue(#[from] IssuerError),
    #[error("encode credential bundle: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("publishing credentials failed (lease revoked: {lease_revoked}): {source}")]
    Publish {
        #[source]
        source: PublishError,
        lease_revoked: bool,
    },
}

/// A published one-time link.
#[derive(Debug, Clone)]
pub struct Published {
    pub handle: String,
    pub url: String,
    /// Unix milliseconds.
    pub expires_at: i64,
}

/// Where credential bundles are stored. Always burn-after-reading.
#[async_trait]
pub trait SecretPublisher: Send + Sync {
    async fn publish(&self, payload: Payload, ttl: Duration) -> Result<Published, PublishError>;

    async fn unpublish(&self, handle: &str) -> Result<(), PublishError>;
}

/// Publishes through a broker in the same process.
pub struct LocalPublisher {
    broker: Broker,
    public_url: String,
}

impl LocalPublisher {
    pub fn new(broker: Broker, public_url: impl Into<String>) -> Self {
        Self {
            broker,
            public_url: public_url.into().trim_end_matches('/').to_owned(),
        }
    }
}

#[async_trait]
impl SecretPublisher for LocalPublisher {
    async fn publish(&self, payload: Payload, ttl: Duration) -> Result<Published, PublishError> {
        let created = self.broker.create(payload, ttl, true)?;
        Ok(Published {
            url: format!("{}/view/{}", self.public_url, created.handle.as_str()),
            handle: created.handle.as_str().to_owned(),
            expires_at: created.expires_at,
        })
    }

    async fn unpublish(&self, handle: &str) -> Result<(), PublishError> {
        Ok(self.broker.revoke(handle)?)
    }
}

#[async_trait]
impl SecretPublisher for ServerClient {
    async fn publish(&self, payload: Payload, ttl: Duration) -> Result<Published, PublishError> {
        let created = self.create(&payload, Some(ttl), Some(true)).await?;
        Ok(Published {
            handle: created.handle,
            url: created.url,
            expires_at: created.expires_at,
        })
    }

    async fn unpublish(&self, handle: &str) -> Result<(), PublishError> {
        Ok(self.revoke(handle).await?)
    }
}

/// Pretty JSON bundle shown to the requester behind the link.
pub fn format_bundle(
    kind: DatabaseKind,
    host: &str,
    database: &str,
    cred: &IssuedCredential,
    expires_at: i64,
) -> Result<Payload, serde_json::Error> {
    let bundle = json!({
        "database_type": kind.as_str().to_uppercase(),
        "connection_info": {
            "host": host,
            "port": kind.default_port(),
            "database": database,
            "username": cred.username,
            "password": cred.password.as_str(),
        },
        "security_info": {
            "lease_id": cred.lease_id,
            "expires_at": format_timestamp(expires_at),
            "auto_revoked": "yes, the issuer removes this login when the lease ends",
        },
        "connection_example": kind.connection_example(host, database, cred),
        "security_warnings": [
            "These credentials are temporary and expire automatically",
            "This link self-destructs after you view it",
            "Do not save or share these credentials",
            "All database access is logged and audited",
        ],
    });
    Ok(Payload::from(serde_json::to_string_pretty(&bundle)?))
}

fn request_id(now: i64) -> String {
    let mut suffix = [0u8; 4];
    OsRng.fill_bytes(&mut suffix);
    format!("access-{}-{}", now / 1000, hex::encode(suffix))
}

/// Runs the grant flow: issue, publish, notify.
pub struct AccessGranter {
    issuer: Arc<dyn CredentialIssuer>,
    publisher: Arc<dyn SecretPublisher>,
    notifier: Arc<dyn Notifier>,
    audit: Option<Arc<dyn AuditSink>>,
    db_host: String,
    db_name: String,
    link_ttl: Duration,
}

impl AccessGranter {
    pub fn new(
        issuer: Arc<dyn CredentialIssuer>,
        publisher: Arc<dyn SecretPublisher>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            issuer,
            publisher,
            notifier,
            audit: None,
            db_host: "localhost".into(),
            db_name: "demo".into(),
            link_ttl: DEFAULT_GRANT_TTL,
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Host and database name written into credential bundles.
    pub fn with_target(mut self, host: impl Into<String>, database: impl Into<String>) -> Self {
        self.db_host = host.into();
        self.db_name = database.into();
        self
    }

    /// Upper bound for the link lifetime. Never outlives the lease.
    pub fn with_link_ttl(mut self, ttl: Duration) -> Self {
        self.link_ttl = ttl;
        self
    }

    fn record(&self, action: &str, handle: Option<&Handle>, success: bool, detail: String) {
        if let Some(audit) = &self.audit {
            audit.record(AuditEvent::new(action, handle, success, Some(detail)));
        }
    }

    pub async fn grant(&self, request: &AccessRequest) -> Result<AccessGrant, GrantError> {
        if request.requester.trim().is_empty() {
            return Err(GrantError::InvalidRequest("requester must not be empty"));
        }
        if request.justification.trim().is_empty() {
            return Err(GrantError::InvalidRequest("justification must not be empty"));
        }
        if self.link_ttl.is_zero() {
            return Err(GrantError::InvalidRequest("link TTL must be greater than zero"));
        }

        let requested_at = now_millis();
        info!(requester = %request.requester, database = %request.database, "requesting credentials");
        let credential = match self.issuer.issue(request.database.role()).await {
            Ok(c) => c,
            Err(e) => {
                self.record(
                    ACTION_GRANT_ISSUE,
                    None,
                    false,
                    format!("database={} issue failed", request.database),
                );
                return Err(e.into());
            }
        };

        let ttl = if credential.lease_duration.is_zero() {
            self.link_ttl
        } else {
            credential.lease_duration.min(self.link_ttl)
        };

        let published = match self.publish(request.database, &credential, requested_at, ttl).await {
            Ok(p) => p,
            Err(e) => {
                error!(lease_id = %credential.lease_id, error = %e, "publishing credentials failed, revoking lease");
                let lease_revoked = self.issuer.revoke(&credential.lease_id).await;
                self.record(
                    ACTION_GRANT_ISSUE,
                    None,
                    false,
                    format!(
                        "database={} lease_id={} publish failed lease_revoked={lease_revoked}",
                        request.database, credential.lease_id
                    ),
                );
                return Err(match e {
                    GrantError::Publish { source, .. } => GrantError::Publish {
                        source,
                        lease_revoked,
                    },
                    other => other,
                });
            }
        };

        let notice = CredentialNotice {
            requester: request.requester.clone(),
            database: request.database.to_string(),
            link: published.url.clone(),
            expires_at: published.expires_at,
        };
        let notified = match self.notifier.notify(&notice).await {
            Ok(()) => true,
            Err(e) => {
                warn!(requester = %request.requester, error = %e, "notification failed; grant stands");
                false
            }
        };

        let handle = Handle::parse(&published.handle);
        self.record(
            ACTION_GRANT_ISSUE,
            handle.as_ref(),
            true,
            format!(
                "database={} requester={} lease_id={} notified={notified}",
                request.database, request.requester, credential.lease_id
            ),
        );
        info!(
            requester = %request.requester,
            database = %request.database,
            lease_id = %credential.lease_id,
            notified,
            "access granted"
        );

        Ok(AccessGrant {
            request_id: request_id(requested_at),
            requester: request.requester.clone(),
            database: request.database,
            justification: request.justification.clone(),
            lease_id: credential.lease_id.clone(),
            handle: published.handle,
            link: published.url,
            requested_at,
            expires_at: published.expires_at,
            notified,
        })
    }

    async fn publish(
        &self,
        kind: DatabaseKind,
        credential: &IssuedCredential,
        requested_at: i64,
        ttl: Duration,
    ) -> Result<Published, GrantError> {
        let expires_at = requested_at.saturating_add(ttl.as_millis() as i64);
        let bundle = format_bundle(kind, &self.db_host, &self.db_name, credential, expires_at)?;
        self.publisher
            .publish(bundle, ttl)
            .await
            .map_err(|source| GrantError::Publish {
                source,
                lease_revoked: false,
            })
    }

    /// Revoke a grant early: the lease, and the link if its handle is known.
    pub async fn revoke(&self, lease_id: Option<&str>, handle: Option<&str>) -> Revocation {
        let lease_revoked = match lease_id {
            Some(lease) => self.issuer.revoke(lease).await,
            None => false,
        };
        let link_revoked = match handle {
            Some(h) => match self.publisher.unpublish(h).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "failed to revoke link");
                    false
                }
            },
            None => false,
        };

        let parsed = handle.and_then(Handle::parse);
        self.record(
            ACTION_GRANT_REVOKE,
            parsed.as_ref(),
            lease_revoked || link_revoked,
            format!(
                "lease_id={} lease_revoked={lease_revoked} link_revoked={link_revoked}",
                lease_id.unwrap_or("-")
            ),
        );
        Revocation {
            lease_revoked,
            link_revoked,
        }
    }
}
