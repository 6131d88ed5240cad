pub mod auth;
pub mod broker;
pub mod client;
pub mod error;
pub mod grant;
pub mod handle;
pub mod handlers;
pub mod issuer;
pub mod notify;
pub mod render;
pub mod server;
pub mod store;

use std::time::Duration;

/// Defaults and bounds applied to secrets created over the management API.
#[derive(Debug, Clone, Copy)]
pub struct CreatePolicy {
    pub default_ttl: Duration,
    pub max_ttl: Duration,
    pub burn_after_reading: bool,
}

impl Default for CreatePolicy {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600),
            max_ttl: Duration::from_secs(86_400),
            burn_after_reading: true,
        }
    }
}

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub broker: broker::Broker,
    /// Bearer token for the management API. `None` leaves it open.
    pub api_token: Option<String>,
    /// Base URL used to build one-time links, without trailing slash.
    pub public_url: String,
    pub policy: CreatePolicy,
}

impl AppState {
    /// One-time link for a handle.
    pub fn view_url(&self, handle: &str) -> String {
        format!("{}/view/{handle}", self.public_url.trim_end_matches('/'))
    }
}

pub use broker::{Absence, Broker, Created, Retrieval};
pub use error::{BrokerError, StoreError};
pub use handle::Handle;
pub use server::{resolve_data_dir, router, run, ServerConfig, StoreBackend};
