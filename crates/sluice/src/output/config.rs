//! 🔧 OutputConfig: every knob the bulk write path exposes, with serde defaults.
//!
//! 🧠 Knowledge graph:
//! - Embedded in `AppConfig::output`, loaded by figment from TOML + `SLUICE_*` env.
//! - `#[serde(default)]` on the container means every missing field falls back to
//!   [`OutputConfig::default`]. One source of truth for defaults. Not two. We learned.
//! - Named strategies (`selector`, `ignore_exceptions`, `cloud_auth.provider`) are
//!   plain strings here and resolved through closed registries in [`OutputConfig::validate`].
//!   Unknown names are a config error at startup, never a surprise at 3am.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::error::TransportErrorKind;
use crate::output::client::SelectorKind;
use crate::output::credentials::{CredentialProviderKind, MAX_REFRESH_INTERVAL, MIN_REFRESH_INTERVAL};

/// 🎯 Which bulk operation every record in a chunk becomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WriteOperation {
    #[default]
    Index,
    Create,
    Update,
    Upsert,
}

impl WriteOperation {
    /// 📡 The key used in the bulk action header. Upsert rides on `update`.
    pub fn header_key(self) -> &'static str {
        match self {
            WriteOperation::Index => "index",
            WriteOperation::Create => "create",
            WriteOperation::Update | WriteOperation::Upsert => "update",
        }
    }

    /// 🪪 Everything but `index` needs an `_id`. No id, no append.
    pub fn requires_id(self) -> bool {
        !matches!(self, WriteOperation::Index)
    }

    pub fn is_update_like(self) -> bool {
        matches!(self, WriteOperation::Update | WriteOperation::Upsert)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WriteOperation::Index => "index",
            WriteOperation::Create => "create",
            WriteOperation::Update => "update",
            WriteOperation::Upsert => "upsert",
        }
    }
}

impl fmt::Display for WriteOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 🫁 Gzip level for bulk bodies. Anything but `no_compression` turns compression on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompressionLevel {
    #[default]
    NoCompression,
    BestSpeed,
    BestCompression,
    DefaultCompression,
}

impl CompressionLevel {
    pub fn is_enabled(self) -> bool {
        self != CompressionLevel::NoCompression
    }

    pub fn flate2_level(self) -> Option<flate2::Compression> {
        match self {
            CompressionLevel::NoCompression => None,
            CompressionLevel::BestSpeed => Some(flate2::Compression::fast()),
            CompressionLevel::BestCompression => Some(flate2::Compression::best()),
            CompressionLevel::DefaultCompression => Some(flate2::Compression::default()),
        }
    }
}

/// 📐 Index template settings. Lives under `[output.template]`.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TemplateConfig {
    /// 🏷️ Template name, placeholders allowed.
    pub name: Option<String>,
    /// 📄 JSON file holding the template body.
    pub file: Option<PathBuf>,
    /// ♻️ PUT even when the template already exists.
    pub overwrite: bool,
    /// 🔁 String substitutions applied to the template file body. Values expand placeholders.
    pub customize: BTreeMap<String, String>,
    /// 🏛️ `_template` when true, `_index_template` when false.
    pub use_legacy: bool,
    pub max_retry: u32,
    pub fail_on_retry_exceed: bool,
    /// 🧹 Forget which templates are installed every N seconds. None = never.
    pub cache_clear_interval_secs: Option<u64>,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            name: None,
            file: None,
            overwrite: false,
            customize: BTreeMap::new(),
            use_legacy: true,
            max_retry: 10,
            fail_on_retry_exceed: true,
            cache_clear_interval_secs: None,
        }
    }
}

/// ☁️ Cloud-style rotating credentials. Lives under `[output.cloud_auth]`.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CloudAuthConfig {
    /// 🔑 Registry name: `static` or `token_file`.
    pub provider: String,
    pub static_token: Option<String>,
    pub token_file: Option<PathBuf>,
    /// ⏱️ Must sit inside [15 min, 12 h].
    pub refresh_interval_secs: u64,
}

impl Default for CloudAuthConfig {
    fn default() -> Self {
        Self {
            provider: "token_file".to_string(),
            static_token: None,
            token_file: None,
            // 🕔 5 hours, comfortably inside the window
            refresh_interval_secs: 5 * 60 * 60,
        }
    }
}

/// 🚰 The bulk output's configuration.
///
/// ⚠️ `bulk_message_request_threshold` is signed on purpose: any negative value means
/// "never split", which is how the unlimited policy gets picked.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OutputConfig {
    // 📡 connection
    pub hosts: Option<String>,
    pub host: String,
    pub port: u16,
    pub scheme: String,
    pub path: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub api_key: Option<String>,
    pub custom_headers: HashMap<String, String>,
    pub request_timeout_secs: u64,
    pub selector: String,
    pub reconnect_on_error: bool,
    pub compression_level: CompressionLevel,
    pub cloud_auth: Option<CloudAuthConfig>,

    // 🧭 routing
    pub write_operation: WriteOperation,
    pub index_name: String,
    pub logstash_format: bool,
    pub logstash_prefix: String,
    pub logstash_prefix_separator: String,
    pub logstash_dateformat: String,
    pub utc_index: bool,
    pub application_name: String,
    pub include_timestamp: bool,
    pub time_key: Option<String>,
    pub time_key_format: Option<String>,
    pub time_key_exclude_timestamp: bool,
    pub time_precision: u8,
    pub time_parse_error_tag: String,
    pub target_index_key: Option<String>,
    pub id_key: Option<String>,
    pub parent_key: Option<String>,
    pub routing_key: Option<String>,
    pub pipeline: Option<String>,
    pub remove_keys: Vec<String>,
    pub remove_keys_on_update: Vec<String>,
    pub remove_keys_on_update_key: Option<String>,
    pub suppress_doc_wrap: bool,
    pub flatten_hashes: bool,
    pub flatten_hashes_separator: String,
    pub include_tag_key: bool,
    pub tag_key: String,
    pub include_chunk_id: bool,
    pub chunk_id_key: String,
    pub type_name: String,
    pub suppress_type_name: bool,
    pub include_index_in_url: bool,
    pub target_index_affinity: bool,
    pub affinity_fail_on_error: bool,

    // 📦 batching + failure policy
    pub bulk_message_request_threshold: i64,
    pub emit_error_for_missing_id: bool,
    pub emit_error_label_event: bool,
    pub log_os_400_reason: bool,
    pub unrecoverable_error_types: Vec<String>,
    pub unrecoverable_record_types: Vec<String>,
    pub ignore_exceptions: Vec<String>,
    pub exception_backup: bool,
    pub backup_dir: PathBuf,
    pub retry_tag: Option<String>,

    // 📐 templates + version detection
    pub template: TemplateConfig,
    pub verify_os_version_at_startup: bool,
    pub default_opensearch_version: u32,
    pub max_retry_get_os_version: u32,
    pub fail_on_detecting_os_version_retry_exceed: bool,
    pub retry_base_delay_ms: u64,
    pub dry_run: bool,
}

/// 📦 20 MiB, the bulk request budget before a chunk gets split.
pub const DEFAULT_BULK_MESSAGE_REQUEST_THRESHOLD: i64 = 20 * 1024 * 1024;

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            hosts: None,
            host: "localhost".to_string(),
            port: 9200,
            scheme: "http".to_string(),
            path: None,
            user: None,
            password: None,
            api_key: None,
            custom_headers: HashMap::new(),
            request_timeout_secs: 5,
            selector: "round_robin".to_string(),
            reconnect_on_error: false,
            compression_level: CompressionLevel::NoCompression,
            cloud_auth: None,

            write_operation: WriteOperation::Index,
            index_name: "fluentd".to_string(),
            logstash_format: false,
            logstash_prefix: "logstash".to_string(),
            logstash_prefix_separator: "-".to_string(),
            logstash_dateformat: "%Y.%m.%d".to_string(),
            utc_index: true,
            application_name: "default".to_string(),
            include_timestamp: false,
            time_key: None,
            time_key_format: None,
            time_key_exclude_timestamp: false,
            time_precision: 9,
            time_parse_error_tag: "sluice.output.time.error".to_string(),
            target_index_key: None,
            id_key: None,
            parent_key: None,
            routing_key: None,
            pipeline: None,
            remove_keys: Vec::new(),
            remove_keys_on_update: Vec::new(),
            remove_keys_on_update_key: None,
            suppress_doc_wrap: false,
            flatten_hashes: false,
            flatten_hashes_separator: "_".to_string(),
            include_tag_key: false,
            tag_key: "tag".to_string(),
            include_chunk_id: false,
            chunk_id_key: "chunk_id".to_string(),
            type_name: "_doc".to_string(),
            suppress_type_name: false,
            include_index_in_url: false,
            target_index_affinity: false,
            affinity_fail_on_error: false,

            bulk_message_request_threshold: DEFAULT_BULK_MESSAGE_REQUEST_THRESHOLD,
            emit_error_for_missing_id: false,
            emit_error_label_event: true,
            log_os_400_reason: false,
            unrecoverable_error_types: vec![
                "out_of_memory_error".to_string(),
                "rejected_execution_exception".to_string(),
            ],
            unrecoverable_record_types: vec!["json_parse_exception".to_string()],
            ignore_exceptions: Vec::new(),
            exception_backup: true,
            backup_dir: std::env::temp_dir().join("sluice-backup"),
            retry_tag: None,

            template: TemplateConfig::default(),
            verify_os_version_at_startup: true,
            default_opensearch_version: 1,
            max_retry_get_os_version: 15,
            fail_on_detecting_os_version_retry_exceed: true,
            retry_base_delay_ms: 1000,
            dry_run: false,
        }
    }
}

impl OutputConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// 🚫 Resolve `ignore_exceptions` through the closed error-kind registry.
    pub fn ignore_list(&self) -> Result<Vec<TransportErrorKind>> {
        self.ignore_exceptions
            .iter()
            .map(|name| {
                TransportErrorKind::from_name(name).with_context(|| {
                    let known: Vec<&str> = TransportErrorKind::ALL.iter().map(|k| k.name()).collect();
                    format!(
                        "💀 ignore_exceptions entry '{name}' is not a known error kind. We know these: {}",
                        known.join(", ")
                    )
                })
            })
            .collect()
    }

    pub fn selector_kind(&self) -> Result<SelectorKind> {
        SelectorKind::from_name(&self.selector).with_context(|| {
            format!(
                "💀 selector '{}' is not a thing. Pick 'round_robin' or 'sticky'.",
                self.selector
            )
        })
    }

    pub fn credential_provider_kind(&self) -> Result<Option<CredentialProviderKind>> {
        let Some(cloud_auth) = &self.cloud_auth else {
            return Ok(None);
        };
        let kind = CredentialProviderKind::from_name(&cloud_auth.provider).with_context(|| {
            format!(
                "💀 cloud_auth.provider '{}' is unknown. Pick 'static' or 'token_file'.",
                cloud_auth.provider
            )
        })?;
        Ok(Some(kind))
    }

    /// ✅ One-time startup validation. Everything named gets resolved here or nowhere.
    pub fn validate(&self) -> Result<()> {
        self.ignore_list()?;
        self.selector_kind()?;
        if let (Some(cloud_auth), Some(kind)) = (&self.cloud_auth, self.credential_provider_kind()?) {
            let interval = Duration::from_secs(cloud_auth.refresh_interval_secs);
            if interval < MIN_REFRESH_INTERVAL || interval > MAX_REFRESH_INTERVAL {
                bail!(
                    "💀 cloud_auth.refresh_interval_secs must be between {} and {} seconds, got {}",
                    MIN_REFRESH_INTERVAL.as_secs(),
                    MAX_REFRESH_INTERVAL.as_secs(),
                    cloud_auth.refresh_interval_secs
                );
            }
            match kind {
                CredentialProviderKind::Static if cloud_auth.static_token.is_none() => {
                    bail!("💀 cloud_auth provider 'static' needs static_token")
                }
                CredentialProviderKind::TokenFile if cloud_auth.token_file.is_none() => {
                    bail!("💀 cloud_auth provider 'token_file' needs token_file")
                }
                _ => {}
            }
        }
        if self.template.name.is_some() && self.template.file.is_none() {
            bail!("💀 template.name is set but template.file is not. A name without a body is just a wish.");
        }
        if self.time_precision > 9 {
            bail!("💀 time_precision must be 0..=9, got {}", self.time_precision);
        }
        if self.target_index_affinity && !self.affinity_enabled() {
            tracing::warn!(
                "⚠️ target_index_affinity is on, but it only works with logstash_format, an id_key and update/upsert. It will sit this one out."
            );
        }
        Ok(())
    }

    /// 🧲 Affinity needs all four planets aligned.
    pub fn affinity_enabled(&self) -> bool {
        self.target_index_affinity
            && self.logstash_format
            && self.id_key.is_some()
            && self.write_operation.is_update_like()
    }

    /// 🕰️ Version detection happens unless we are dry-running or told not to bother.
    pub fn should_detect_version(&self) -> bool {
        self.verify_os_version_at_startup && !self.dry_run
    }
}
