//! 🔐 Cloud-style rotating credentials.
//!
//! A provider fetches a bearer token, a store keeps the current one behind a mutex,
//! and a timer (owned by `BulkOutput`) refreshes it. Every successful refresh
//! invalidates the cached connection handle so the next request carries the new token.
//!
//! ⚠️ Request signing (SigV4 and friends) is not done here. The token is sent as
//! `Authorization: Bearer <token>`.

use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::debug;

use crate::common::EventTime;
use crate::output::config::CloudAuthConfig;

/// ⏱️ Refresh no faster than every 15 minutes...
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);
/// ...and no slower than every 12 hours.
pub const MAX_REFRESH_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// 🗂️ The closed registry of providers, by config name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialProviderKind {
    Static,
    TokenFile,
}

impl CredentialProviderKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "static" => Some(CredentialProviderKind::Static),
            "token_file" => Some(CredentialProviderKind::TokenFile),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    pub fetched_at: EventTime,
}

impl Credentials {
    pub fn authorization(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

#[derive(Debug, Clone)]
enum CredentialProvider {
    Static(String),
    TokenFile(PathBuf),
}

impl CredentialProvider {
    async fn fetch(&self) -> Result<Credentials> {
        let token = match self {
            CredentialProvider::Static(token) => token.clone(),
            CredentialProvider::TokenFile(path) => tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("💀 could not read token file '{}'", path.display()))?
                .trim()
                .to_string(),
        };
        if token.is_empty() {
            bail!("💀 credential provider returned an empty token");
        }
        Ok(Credentials {
            token,
            fetched_at: Utc::now(),
        })
    }
}

/// 🗄️ The current credentials, swapped atomically on refresh.
#[derive(Debug)]
pub struct CredentialStore {
    provider: CredentialProvider,
    interval: Duration,
    current: Mutex<Option<Credentials>>,
}

impl CredentialStore {
    /// 🏗️ Build from validated config. Does not fetch; call [`refresh`](Self::refresh).
    pub fn from_config(config: &CloudAuthConfig, kind: CredentialProviderKind) -> Result<Self> {
        let provider = match kind {
            CredentialProviderKind::Static => CredentialProvider::Static(
                config
                    .static_token
                    .clone()
                    .context("💀 cloud_auth provider 'static' needs static_token")?,
            ),
            CredentialProviderKind::TokenFile => CredentialProvider::TokenFile(
                config
                    .token_file
                    .clone()
                    .context("💀 cloud_auth provider 'token_file' needs token_file")?,
            ),
        };
        let interval = Duration::from_secs(config.refresh_interval_secs);
        if !(MIN_REFRESH_INTERVAL..=MAX_REFRESH_INTERVAL).contains(&interval) {
            bail!(
                "💀 credential refresh interval {interval:?} is outside [{MIN_REFRESH_INTERVAL:?}, {MAX_REFRESH_INTERVAL:?}]"
            );
        }
        Ok(Self {
            provider,
            interval,
            current: Mutex::new(None),
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// 🔄 Fetch fresh credentials and swap them in. Old ones stay on failure.
    pub async fn refresh(&self) -> Result<()> {
        let fresh = self.provider.fetch().await?;
        debug!("🔐 credentials refreshed at {}", fresh.fetched_at);
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(fresh);
        Ok(())
    }

    pub fn current(&self) -> Option<Credentials> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn authorization(&self) -> Option<String> {
        self.current().map(|c| c.authorization())
    }
}
