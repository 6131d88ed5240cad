//! Source of short-lived database credentials.
//!
//! The broker never talks to the issuer; only the grant flow does. Leases are
//! revoked through the issuer when a grant cannot be completed.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};
use zeroize::Zeroizing;

pub const DEFAULT_VAULT_ADDR: &str = "http://localhost:8200";
const VAULT_TOKEN_HEADER: &str = "X-Vault-Token";

#[derive(Debug, Error)]
pub enum IssuerError {
    #[error("issuer request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("issuer rejected request for role {role}: HTTP {status}")]
    Rejected { role: String, status: u16 },
    #[error("malformed issuer response: {0}")]
    Malformed(String),
}

/// A freshly issued database login.
pub struct IssuedCredential {
    pub username: String,
    pub password: Zeroizing<String>,
    pub lease_id: String,
    /// Zero when the issuer did not report one.
    pub lease_duration: Duration,
}

impl fmt::Debug for IssuedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCredential")
            .field("username", &self.username)
            .field("password", &"[redacted]")
            .field("lease_id", &self.lease_id)
            .field("lease_duration", &self.lease_duration)
            .finish()
    }
}

#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    /// Issue credentials for `role`.
    async fn issue(&self, role: &str) -> Result<IssuedCredential, IssuerError>;

    /// Revoke a lease. Failures are logged and reported as `false`.
    async fn revoke(&self, lease_id: &str) -> bool;
}

#[derive(Deserialize)]
struct CredsResponse {
    lease_id: String,
    #[serde(default)]
    lease_duration: u64,
    data: CredsData,
}

#[derive(Deserialize)]
struct CredsData {
    username: String,
    password: String,
}

/// HashiCorp Vault database secrets engine.
pub struct VaultIssuer {
    client: reqwest::Client,
    addr: String,
    token: Zeroizing<String>,
}

impl VaultIssuer {
    pub fn new(addr: impl Into<String>, token: impl Into<String>) -> Result<Self, IssuerError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            addr: addr.into().trim_end_matches('/').to_owned(),
            token: Zeroizing::new(token.into()),
        })
    }
}

#[async_trait]
impl CredentialIssuer for VaultIssuer {
    async fn issue(&self, role: &str) -> Result<IssuedCredential, IssuerError> {
        let resp = self
            .client
            .get(format!("{}/v1/database/creds/{role}", self.addr))
            .header(VAULT_TOKEN_HEADER, self.token.as_str())
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(IssuerError::Rejected {
                role: role.to_owned(),
                status: resp.status().as_u16(),
            });
        }

        let body: CredsResponse = resp
            .json()
            .await
            .map_err(|e| IssuerError::Malformed(e.to_string()))?;

        info!(role, lease_id = %body.lease_id, lease_seconds = body.lease_duration, "issued database credentials");
        Ok(IssuedCredential {
            username: body.data.username,
            password: Zeroizing::new(body.data.password),
            lease_id: body.lease_id,
            lease_duration: Duration::from_secs(body.lease_duration),
        })
    }

    async fn revoke(&self, lease_id: &str) -> bool {
        let result = self
            .client
            .put(format!("{}/v1/sys/leases/revoke", self.addr))
            .header(VAULT_TOKEN_HEADER, self.token.as_str())
            .json(&json!({ "lease_id": lease_id }))
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                info!(lease_id, "lease revoked");
                true
            }
            Ok(resp) => {
                warn!(lease_id, status = %resp.status(), "lease revocation rejected");
                false
            }
            Err(e) => {
                warn!(lease_id, error = %e, "lease revocation request failed");
                false
            }
        }
    }
}
