//! 📡 Client manager: one reusable connection handle, rebuilt only when it has to be.
//!
//! 🧠 Knowledge graph:
//! - A [`ConnectionHandle`] wraps a `reqwest::Client` plus the host list it was built for,
//!   the compression flag, and the auth it was built with.
//! - [`ClientManager::connection`] hands out the cached handle as an `Arc`. A caller keeps
//!   the `Arc` it got for the whole request, so a concurrent rebuild never pulls the rug.
//! - Rebuild triggers: host list changed (positional host+port compare), compression flag
//!   flipped, explicit [`invalidate`](ClientManager::invalidate), or credential rotation.
//! - The mutex guarding the handle is a plain `std::sync::Mutex`. It is never held
//!   across an `.await`.
//! - Version detection runs once (bounded retry) and decides whether `_type` is emitted.
//!   Dropping the handle, for whatever reason, never forgets the version.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{TransportErrorKind, TransportFailure, WriteError};
use crate::output::config::{CompressionLevel, OutputConfig};
use crate::output::credentials::CredentialStore;
use crate::output::placeholders::{PlaceholderContext, is_deterministic};
use crate::output::retry::{RetryPolicy, retry_operate};

/// 🏠 One cluster node we can talk to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpec {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl HostSpec {
    pub fn base_url(&self) -> String {
        match &self.path {
            Some(path) => format!("{}://{}:{}/{}", self.scheme, self.host, self.port, path),
            None => format!("{}://{}:{}", self.scheme, self.host, self.port),
        }
    }

    /// 🏷️ `host:port`, the identity used for change detection and logs.
    pub fn label(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn same_node(&self, other: &HostSpec) -> bool {
        self.host == other.host && self.port == other.port
    }
}

/// 🔧 Fallbacks for host entries that leave things out.
#[derive(Debug, Clone)]
struct HostDefaults {
    host: String,
    port: u16,
    scheme: String,
    path: Option<String>,
}

/// 📜 Parse `"https://user:pass@a:9200/prefix, b:9201, c"` into host specs.
fn parse_hosts(hosts: &str, defaults: &HostDefaults) -> Result<Vec<HostSpec>> {
    let mut specs = Vec::new();
    for entry in hosts.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let with_scheme = if entry.contains("://") {
            entry.to_string()
        } else {
            format!("{}://{entry}", defaults.scheme)
        };
        let url = reqwest::Url::parse(&with_scheme)
            .with_context(|| format!("💀 host entry '{entry}' is not a parseable URL"))?;
        let host = url
            .host_str()
            .with_context(|| format!("💀 host entry '{entry}' has no host in it"))?
            .to_string();
        let path = url.path().trim_matches('/');
        specs.push(HostSpec {
            scheme: url.scheme().to_string(),
            host,
            port: url.port().unwrap_or(defaults.port),
            path: if path.is_empty() {
                defaults.path.clone()
            } else {
                Some(path.to_string())
            },
            user: (!url.username().is_empty()).then(|| url.username().to_string()),
            password: url.password().map(str::to_string),
        });
    }
    if specs.is_empty() {
        bail!("💀 host list '{hosts}' resolved to zero hosts. Nowhere to send anything.");
    }
    Ok(specs)
}

pub fn describe_hosts(hosts: &[HostSpec]) -> String {
    hosts.iter().map(HostSpec::label).collect::<Vec<_>>().join(",")
}

/// 🎯 The closed registry of host selectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorKind {
    /// 🔁 Next host every request.
    RoundRobin,
    /// 🧷 Same host until it fails, then the next one.
    Sticky,
}

impl SelectorKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "round_robin" => Some(SelectorKind::RoundRobin),
            "sticky" => Some(SelectorKind::Sticky),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct HostSelector {
    kind: SelectorKind,
    cursor: AtomicUsize,
}

impl HostSelector {
    fn pick(&self, len: usize) -> usize {
        match self.kind {
            SelectorKind::RoundRobin => self.cursor.fetch_add(1, Ordering::Relaxed) % len,
            SelectorKind::Sticky => self.cursor.load(Ordering::Relaxed) % len,
        }
    }

    fn note_failure(&self) {
        if self.kind == SelectorKind::Sticky {
            self.cursor.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// 🔌 A built HTTP client bound to a host list. Cheap to share, never mutated.
#[derive(Debug)]
pub struct ConnectionHandle {
    http: reqwest::Client,
    hosts: Vec<HostSpec>,
    compression: CompressionLevel,
    selector: HostSelector,
    authorization: Option<String>,
    basic_auth: Option<(String, Option<String>)>,
}

impl ConnectionHandle {
    pub fn hosts(&self) -> &[HostSpec] {
        &self.hosts
    }

    pub fn compression(&self) -> CompressionLevel {
        self.compression
    }

    pub fn describe(&self) -> String {
        describe_hosts(&self.hosts)
    }

    fn matches(&self, hosts: &[HostSpec], compression: CompressionLevel) -> bool {
        self.compression.is_enabled() == compression.is_enabled()
            && self.hosts.len() == hosts.len()
            && self.hosts.iter().zip(hosts).all(|(a, b)| a.same_node(b))
    }

    /// 🛠️ A request builder aimed at the selected host, with auth applied.
    ///
    /// Auth priority: rotating credentials / API key header, then credentials embedded in
    /// the host entry, then the configured user/password.
    pub fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let host = &self.hosts[self.selector.pick(self.hosts.len())];
        let url = format!("{}/{}", host.base_url(), path.trim_start_matches('/'));
        let request = self.http.request(method, url);
        if let Some(authorization) = &self.authorization {
            request.header(reqwest::header::AUTHORIZATION, authorization)
        } else if let Some(user) = &host.user {
            request.basic_auth(user, host.password.as_ref())
        } else if let Some((user, password)) = &self.basic_auth {
            request.basic_auth(user, password.as_ref())
        } else {
            request
        }
    }

    /// 🧷 Tell a sticky selector to move on.
    pub fn note_failure(&self) {
        self.selector.note_failure();
    }
}

/// 🏛️ Owner of the connection handle, detected version, and credentials.
#[derive(Debug)]
pub struct ClientManager {
    hosts_template: Option<String>,
    defaults: HostDefaults,
    user: Option<String>,
    password: Option<String>,
    api_key: Option<String>,
    custom_headers: HeaderMap,
    request_timeout: Duration,
    compression: CompressionLevel,
    selector: SelectorKind,
    credentials: Option<Arc<CredentialStore>>,
    handle: Mutex<Option<Arc<ConnectionHandle>>>,
    version: Mutex<Option<u32>>,
    default_version: u32,
    version_detection: bool,
    retry: RetryPolicy,
}

impl ClientManager {
    pub fn new(config: &OutputConfig, credentials: Option<Arc<CredentialStore>>) -> Result<Self> {
        let mut custom_headers = HeaderMap::new();
        for (name, value) in &config.custom_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("💀 custom header name '{name}' is not a valid header name"))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("💀 custom header '{name}' has an invalid value"))?;
            custom_headers.insert(name, value);
        }
        Ok(Self {
            hosts_template: config.hosts.clone(),
            defaults: HostDefaults {
                host: config.host.clone(),
                port: config.port,
                scheme: config.scheme.clone(),
                path: config
                    .path
                    .as_deref()
                    .map(|p| p.trim_matches('/').to_string())
                    .filter(|p| !p.is_empty()),
            },
            user: config.user.clone(),
            password: config.password.clone(),
            api_key: config.api_key.clone(),
            custom_headers,
            request_timeout: config.request_timeout(),
            compression: config.compression_level,
            selector: config.selector_kind()?,
            credentials,
            handle: Mutex::new(None),
            version: Mutex::new(None),
            default_version: config.default_opensearch_version,
            version_detection: config.should_detect_version(),
            retry: RetryPolicy {
                max_retries: config.max_retry_get_os_version,
                fail_on_exceed: config.fail_on_detecting_os_version_retry_exceed,
                base_delay: config.retry_base_delay(),
            },
        })
    }

    /// 🗺️ The host list for one chunk, placeholders expanded.
    pub fn resolve_hosts(&self, placeholders: &PlaceholderContext<'_>) -> Result<Vec<HostSpec>> {
        match &self.hosts_template {
            Some(template) => parse_hosts(&placeholders.expand(template), &self.defaults),
            None => {
                let host = placeholders.expand(&self.defaults.host);
                if host.trim().is_empty() {
                    bail!("💀 no hosts configured. Set 'hosts' or 'host'.");
                }
                Ok(vec![HostSpec {
                    scheme: self.defaults.scheme.clone(),
                    host,
                    port: self.defaults.port,
                    path: self.defaults.path.clone(),
                    user: None,
                    password: None,
                }])
            }
        }
    }

    /// 🗿 True when the host list has no placeholders and can be resolved before any chunk shows up.
    pub fn has_static_hosts(&self) -> bool {
        match &self.hosts_template {
            Some(template) => is_deterministic(template),
            None => is_deterministic(&self.defaults.host),
        }
    }

    /// 🔌 The cached handle if it still fits `hosts`, otherwise a fresh one.
    pub fn connection(&self, hosts: &[HostSpec]) -> Result<Arc<ConnectionHandle>> {
        let mut slot = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = slot.as_ref() {
            if existing.matches(hosts, self.compression) {
                return Ok(Arc::clone(existing));
            }
            info!(
                "🔁 host list changed from [{}] to [{}], rebuilding the connection",
                existing.describe(),
                describe_hosts(hosts)
            );
        }
        // 🏗️ whoever still holds the old Arc keeps using it until their request is done
        let fresh = Arc::new(self.build(hosts)?);
        *slot = Some(Arc::clone(&fresh));
        Ok(fresh)
    }

    fn build(&self, hosts: &[HostSpec]) -> Result<ConnectionHandle> {
        let http = reqwest::Client::builder()
            .connect_timeout(self.request_timeout)
            .timeout(self.request_timeout)
            .default_headers(self.custom_headers.clone())
            .build()
            .context("💀 The HTTP client refused to be born. Probably TLS. It is always TLS.")?;
        let authorization = self
            .credentials
            .as_ref()
            .and_then(|store| store.authorization())
            .or_else(|| self.api_key.as_ref().map(|key| format!("ApiKey {key}")));
        debug!("🔌 built connection for [{}]", describe_hosts(hosts));
        Ok(ConnectionHandle {
            http,
            hosts: hosts.to_vec(),
            compression: self.compression,
            selector: HostSelector {
                kind: self.selector,
                cursor: AtomicUsize::new(0),
            },
            authorization,
            basic_auth: self.user.clone().map(|user| (user, self.password.clone())),
        })
    }

    /// 🗑️ Drop the cached handle. The next `connection()` builds a new one.
    pub fn invalidate(&self) {
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn credentials(&self) -> Option<&Arc<CredentialStore>> {
        self.credentials.as_ref()
    }

    /// ⏲️ Spawn the credential refresh timer. Every successful refresh drops the cached
    /// handle so the next request is built with the new token. Failures keep the old one.
    pub fn spawn_credential_refresh(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let store = Arc::clone(self.credentials.as_ref()?);
        let manager = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(store.interval());
            // first tick fires immediately, and start() already fetched once
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.refresh().await {
                    Ok(()) => {
                        manager.invalidate();
                        info!("🔐 credentials rotated, connection will be rebuilt on next use");
                    }
                    Err(err) => warn!("⚠️ credential refresh failed, keeping the old ones: {err:#}"),
                }
            }
        }))
    }

    /// 🔢 Detected major version, or the configured default when we never asked.
    pub fn major_version(&self) -> u32 {
        self.version
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unwrap_or(self.default_version)
    }

    fn cached_version(&self) -> Option<u32> {
        *self.version.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 🕵️ Detect the version if it is enabled and not known yet.
    pub async fn ensure_version(&self, hosts: &[HostSpec]) -> Result<u32, WriteError> {
        if !self.version_detection {
            return Ok(self.major_version());
        }
        if let Some(version) = self.cached_version() {
            return Ok(version);
        }
        self.detect_version(hosts).await
    }

    /// 🕵️ Ask the cluster root for `version.number`, with bounded retries.
    /// Exhaustion falls back to the default version unless configured fatal.
    pub async fn detect_version(&self, hosts: &[HostSpec]) -> Result<u32, WriteError> {
        let detected = retry_operate("cluster version detection", self.retry, || async move {
            let handle = self
                .connection(hosts)
                .map_err(|err| TransportFailure::new(TransportErrorKind::Request, format!("{err:#}")))?;
            let result = fetch_major_version(&handle).await;
            if result.is_err() {
                self.invalidate();
            }
            result
        })
        .await?;
        let version = match detected {
            Some(version) => {
                info!("🕵️ cluster major version is {version}");
                version
            }
            None => {
                warn!(
                    "⚠️ could not detect the cluster version, assuming {}",
                    self.default_version
                );
                self.default_version
            }
        };
        *self.version.lock().unwrap_or_else(PoisonError::into_inner) = Some(version);
        Ok(version)
    }
}

async fn fetch_major_version(handle: &ConnectionHandle) -> Result<u32, TransportFailure> {
    let response = handle
        .request(reqwest::Method::GET, "")
        .send()
        .await
        .map_err(TransportFailure::from_reqwest)?;
    let status = response.status();
    let body = response.text().await.map_err(TransportFailure::from_reqwest)?;
    if !status.is_success() {
        return Err(TransportFailure::from_status(status.as_u16(), &body));
    }
    let info: Value = serde_json::from_str(&body)
        .map_err(|err| TransportFailure::new(TransportErrorKind::Decode, err.to_string()))?;
    parse_major_version(&info).ok_or_else(|| {
        TransportFailure::new(
            TransportErrorKind::Decode,
            format!("no version.number in cluster info: {body}"),
        )
    })
}

pub fn parse_major_version(info: &Value) -> Option<u32> {
    info.get("version")?
        .get("number")?
        .as_str()?
        .split('.')
        .next()?
        .parse()
        .ok()
}
