//! # Upgrade Authentication
//!
//! Every WebSocket upgrade is checked by an `Authenticator` before the
//! handshake completes. A rejected request never becomes a connection.
//!
//! ## Implementations:
//! - **AllowAllAuthenticator**: accepts everything (authentication disabled)
//! - **ApiKeyAuthenticator**: requires an `x-api-key` header whose value is
//!   known to a `SecretStore`

use crate::config::AuthConfig;
use actix_web::HttpRequest;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

pub const API_KEY_HEADER: &str = "x-api-key";

/// The parts of an upgrade request authenticators look at.
///
/// Header names are stored lowercased.
#[derive(Debug, Clone, Default)]
pub struct UpgradeRequest {
    pub path: String,
    headers: HashMap<String, String>,
}

impl UpgradeRequest {
    #[cfg(test)]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            headers: HashMap::new(),
        }
    }

    #[cfg(test)]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Copy path and UTF-8 headers out of an actix request.
    pub fn from_http(req: &HttpRequest) -> Self {
        let headers = req
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();

        Self {
            path: req.uri().to_string(),
            headers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Verified,
    Rejected(String),
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn verify(&self, request: &UpgradeRequest) -> Verdict;
}

/// Source of valid API keys.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn contains_key(&self, key: &str) -> bool;
}

pub struct AllowAllAuthenticator;

#[async_trait]
impl Authenticator for AllowAllAuthenticator {
    async fn verify(&self, _request: &UpgradeRequest) -> Verdict {
        Verdict::Verified
    }
}

/// Keys listed under `auth.api_keys`.
#[derive(Debug, Clone, Default)]
pub struct ConfigSecretStore {
    keys: HashSet<String>,
}

impl ConfigSecretStore {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys
                .into_iter()
                .map(Into::into)
                .filter(|k: &String| !k.trim().is_empty())
                .collect(),
        }
    }
}

#[async_trait]
impl SecretStore for ConfigSecretStore {
    async fn contains_key(&self, key: &str) -> bool {
        self.keys.contains(key)
    }
}

pub struct ApiKeyAuthenticator<S: SecretStore> {
    store: S,
}

impl<S: SecretStore> ApiKeyAuthenticator<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: SecretStore> Authenticator for ApiKeyAuthenticator<S> {
    async fn verify(&self, request: &UpgradeRequest) -> Verdict {
        let Some(key) = request.header(API_KEY_HEADER) else {
            debug!(path = %request.path, "Upgrade carries no API key");
            return Verdict::Rejected(format!("missing {} header", API_KEY_HEADER));
        };

        if self.store.contains_key(key.trim()).await {
            Verdict::Verified
        } else {
            debug!(path = %request.path, "Upgrade API key not recognised");
            Verdict::Rejected("unknown API key".to_string())
        }
    }
}

pub fn build_authenticator(config: &AuthConfig) -> Arc<dyn Authenticator> {
    if config.enabled {
        Arc::new(ApiKeyAuthenticator::new(ConfigSecretStore::new(
            config.api_keys.iter().cloned(),
        )))
    } else {
        Arc::new(AllowAllAuthenticator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allow_all() {
        let auth = AllowAllAuthenticator;
        assert_eq!(auth.verify(&UpgradeRequest::new("/a/b")).await, Verdict::Verified);
    }

    #[tokio::test]
    async fn test_api_key_verdicts() {
        let auth = ApiKeyAuthenticator::new(ConfigSecretStore::new(["secret", ""]));

        let ok = UpgradeRequest::new("/a/b").with_header("X-API-Key", "secret");
        assert_eq!(auth.verify(&ok).await, Verdict::Verified);

        let wrong = UpgradeRequest::new("/a/b").with_header("x-api-key", "nope");
        assert!(matches!(auth.verify(&wrong).await, Verdict::Rejected(_)));

        let empty = UpgradeRequest::new("/a/b").with_header("x-api-key", "");
        assert!(matches!(auth.verify(&empty).await, Verdict::Rejected(_)));

        let missing = UpgradeRequest::new("/a/b");
        assert_eq!(
            auth.verify(&missing).await,
            Verdict::Rejected("missing x-api-key header".to_string())
        );
    }

    #[tokio::test]
    async fn test_build_from_config() {
        let disabled = build_authenticator(&AuthConfig {
            enabled: false,
            api_keys: vec![],
        });
        assert_eq!(disabled.verify(&UpgradeRequest::new("/a/b")).await, Verdict::Verified);

        let enabled = build_authenticator(&AuthConfig {
            enabled: true,
            api_keys: vec!["k1".to_string()],
        });
        assert!(matches!(
            enabled.verify(&UpgradeRequest::new("/a/b")).await,
            Verdict::Rejected(_)
        ));
    }
}
