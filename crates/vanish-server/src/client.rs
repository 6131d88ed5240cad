//! HTTP client for a running vanish server, used by the CLI and the grant flow.

use std::time::Duration;

use reqwest::{header, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::handlers::{CreateRequest, CreateResponse, RevealedBody};
use crate::store::{AuditEvent, Payload};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("secret content must be UTF-8")]
    NotUtf8,
}

#[derive(Deserialize)]
struct AuditResponse {
    events: Vec<AuditEvent>,
}

#[derive(Deserialize)]
struct PruneResponse {
    swept: usize,
}

pub struct ServerClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ServerClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            token,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let req = self
            .client
            .request(method, format!("{}{path}", self.base_url));
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// `POST /secrets`. `None` fields fall back to the server's defaults.
    pub async fn create(
        &self,
        payload: &Payload,
        ttl: Option<Duration>,
        burn_after_reading: Option<bool>,
    ) -> Result<CreateResponse, ClientError> {
        let content = payload.as_str().ok_or(ClientError::NotUtf8)?.to_owned();
        let body = CreateRequest {
            content,
            ttl_seconds: ttl.map(|t| t.as_secs().max(1)),
            burn_after_reading,
        };
        let resp = self.request(Method::POST, "/secrets").json(&body).send().await?;
        Ok(check(resp).await?.json().await?)
    }

    /// `DELETE /secrets/{handle}`.
    pub async fn revoke(&self, handle: &str) -> Result<(), ClientError> {
        let resp = self
            .request(Method::DELETE, &format!("/secrets/{handle}"))
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    /// Open a one-time link. `None` when the secret is not available.
    pub async fn view(&self, handle: &str) -> Result<Option<RevealedBody>, ClientError> {
        let resp = self
            .client
            .get(format!("{}/view/{handle}", self.base_url))
            .header(header::ACCEPT, "application/json")
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(check(resp).await?.json().await?))
    }

    /// `POST /prune`. Returns the number of records swept.
    pub async fn prune(&self) -> Result<usize, ClientError> {
        let resp = self.request(Method::POST, "/prune").send().await?;
        let body: PruneResponse = check(resp).await?.json().await?;
        Ok(body.swept)
    }

    /// `GET /audit`.
    pub async fn audit(
        &self,
        action: Option<&str>,
        limit: usize,
    ) -> Result<Vec<AuditEvent>, ClientError> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(action) = action {
            query.push(("action", action.to_owned()));
        }
        let resp = self
            .request(Method::GET, "/audit")
            .query(&query)
            .send()
            .await?;
        let body: AuditResponse = check(resp).await?.json().await?;
        Ok(body.events)
    }
}

/// Turn a non-success response into [`ClientError::Status`] with the
/// server's `error` message.
async fn check(resp: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body: Value = resp.json().await.unwrap_or_default();
    Err(ClientError::Status {
        status: status.as_u16(),
        message: body["error"].as_str().unwrap_or("unknown error").to_owned(),
    })
}

/// Accept either a bare handle or a full `/view/{handle}` link.
pub fn handle_from_target(target: &str) -> &str {
    let trimmed = target.trim().trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::broker::Broker;
    use crate::server::router;
    use crate::store::{MemoryAuditLog, MemoryStore};
    use crate::{AppState, CreatePolicy};

    async fn spawn_server(token: Option<&str>) -> String {
        let broker = Broker::new(Arc::new(MemoryStore::new()), Arc::new(MemoryAuditLog::new()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let state = AppState {
            broker,
            api_token: token.map(str::to_owned),
            public_url: base.clone(),
            policy: CreatePolicy::default(),
        };
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        base
    }

    #[test]
    fn handle_from_link_or_bare_handle() {
        assert_eq!(handle_from_target("abc123"), "abc123");
        assert_eq!(handle_from_target("https://v.test/view/abc123"), "abc123");
        assert_eq!(handle_from_target(" https://v.test/view/abc123/ "), "abc123");
    }

    #[tokio::test]
    async fn create_view_revoke_over_http() {
        let base = spawn_server(Some("tok")).await;
        let client = ServerClient::new(&base, Some("tok".into())).unwrap();

        let created = client
            .create(&Payload::from("hello"), Some(Duration::from_secs(60)), None)
            .await
            .unwrap();
        assert!(created.url.starts_with(&base));

        let revealed = client.view(&created.handle).await.unwrap().unwrap();
        assert_eq!(revealed.content, "hello");
        assert!(revealed.burned);
        assert!(client.view(&created.handle).await.unwrap().is_none());

        let kept = client
            .create(&Payload::from("kept"), None, Some(false))
            .await
            .unwrap();
        client.revoke(&kept.handle).await.unwrap();
        assert!(client.view(&kept.handle).await.unwrap().is_none());

        let events = client.audit(Some("secret.create"), 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(client.prune().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn wrong_token_surfaces_status() {
        let base = spawn_server(Some("tok")).await;
        let client = ServerClient::new(&base, Some("nope".into())).unwrap();
        let err = client.prune().await.unwrap_err();
        assert!(matches!(err, ClientError::Status { status: 401, ref message } if message == "unauthorized"));
    }
}
