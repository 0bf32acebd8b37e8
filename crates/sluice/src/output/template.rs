//! 📐 Template installer: make sure the index template exists before we write into
//! the family of indices it governs.
//!
//! 🧠 Knowledge graph:
//! - The registry is a `tokio::sync::Mutex<HashSet<String>>` of keys we already confirmed.
//!   Keyed by template name, or by `name:alias` in logstash mode, where each date bucket
//!   deserves its own check.
//! - A name that still contains `${` after expansion is non-deterministic. We skip it
//!   rather than install a template literally named `logs-${whatever}`.
//! - Installs use bounded retry. Exhaustion is fatal or a warning, per config.
//! - An optional timer clears the registry so templates deleted behind our back get
//!   reinstalled eventually.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{TransportErrorKind, TransportFailure, WriteError};
use crate::output::client::{ClientManager, ConnectionHandle, HostSpec};
use crate::output::config::OutputConfig;
use crate::output::placeholders::{PlaceholderContext, is_deterministic};
use crate::output::retry::{RetryPolicy, retry_operate};

#[derive(Debug)]
pub struct TemplateInstaller {
    name: String,
    body: String,
    overwrite: bool,
    /// 🔤 Longest needle first, so `<<ab>>` is not eaten by `<<a>>`.
    customize: Vec<(String, String)>,
    use_legacy: bool,
    logstash_format: bool,
    clear_interval: Option<Duration>,
    retry: RetryPolicy,
    installed: Mutex<HashSet<String>>,
}

impl TemplateInstaller {
    /// 📄 Read the template file. `Ok(None)` when no template is configured.
    pub async fn load(config: &OutputConfig) -> Result<Option<Self>> {
        let (Some(name), Some(file)) = (&config.template.name, &config.template.file) else {
            return Ok(None);
        };
        let body = read_template(file).await?;
        Ok(Some(Self {
            name: name.clone(),
            body,
            overwrite: config.template.overwrite,
            customize: replacement_order(&config.template.customize),
            use_legacy: config.template.use_legacy,
            logstash_format: config.logstash_format,
            clear_interval: config.template.cache_clear_interval_secs.map(Duration::from_secs),
            retry: RetryPolicy {
                max_retries: config.template.max_retry,
                fail_on_exceed: config.template.fail_on_retry_exceed,
                base_delay: config.retry_base_delay(),
            },
            installed: Mutex::new(HashSet::new()),
        }))
    }

    /// 🗿 Installable once at startup: a fixed name and no per-bucket checks.
    pub fn is_static(&self) -> bool {
        !self.logstash_format && is_deterministic(&self.name)
    }

    fn endpoint(&self) -> &'static str {
        if self.use_legacy { "_template" } else { "_index_template" }
    }

    /// ✅ Make sure the template exists for `index_hint` (the alias or index a batch targets).
    pub async fn ensure(
        &self,
        client: &ClientManager,
        hosts: &[HostSpec],
        placeholders: &PlaceholderContext<'_>,
        index_hint: &str,
    ) -> Result<(), WriteError> {
        let name = placeholders.expand(&self.name);
        if !is_deterministic(&name) {
            debug!("📐 template name '{name}' is not deterministic for this chunk, skipping");
            return Ok(());
        }
        let registry_key = if self.logstash_format {
            format!("{name}:{index_hint}")
        } else {
            name.clone()
        };
        if self.installed.lock().await.contains(&registry_key) {
            return Ok(());
        }

        let body = self.customized_body(placeholders);
        let document: Value = serde_json::from_str(&body).map_err(|err| {
            WriteError::Unrecoverable(format!("template '{name}' is not valid JSON: {err}"))
        })?;
        let document = document.to_string();

        let outcome = retry_operate(&format!("template install '{name}'"), self.retry, || {
            let name = name.as_str();
            let document = document.as_str();
            async move {
                let handle = client.connection(hosts).map_err(|err| {
                    TransportFailure::new(TransportErrorKind::Request, format!("{err:#}"))
                })?;
                let result = self.install(&handle, name, document).await;
                if result.is_err() {
                    client.invalidate();
                }
                result
            }
        })
        .await?;

        if outcome.is_some() {
            self.installed.lock().await.insert(registry_key);
        }
        Ok(())
    }

    fn customized_body(&self, placeholders: &PlaceholderContext<'_>) -> String {
        self.customize
            .iter()
            .fold(self.body.clone(), |body, (needle, replacement)| {
                body.replace(needle, &placeholders.expand(replacement))
            })
    }

    async fn install(
        &self,
        handle: &ConnectionHandle,
        name: &str,
        document: &str,
    ) -> Result<(), TransportFailure> {
        let path = format!("{}/{name}", self.endpoint());
        let response = handle
            .request(reqwest::Method::GET, &path)
            .send()
            .await
            .map_err(TransportFailure::from_reqwest)?;
        let status = response.status().as_u16();
        let exists = match status {
            200..=299 => true,
            404 => false,
            _ => {
                let text = response.text().await.unwrap_or_default();
                return Err(TransportFailure::from_status(status, &text));
            }
        };
        if exists && !self.overwrite {
            debug!("📐 template '{name}' already exists");
            return Ok(());
        }

        let response = handle
            .request(reqwest::Method::PUT, &path)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(document.to_string())
            .send()
            .await
            .map_err(TransportFailure::from_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(TransportFailure::from_status(status.as_u16(), &text));
        }
        info!("📐 installed template '{name}' via {}", self.endpoint());
        Ok(())
    }

    /// 🧹 Forget everything we installed. Next `ensure` checks again.
    pub async fn clear(&self) {
        self.installed.lock().await.clear();
    }

    pub async fn installed_count(&self) -> usize {
        self.installed.lock().await.len()
    }

    /// ⏲️ Spawn the registry-clearing timer, if one is configured.
    pub fn spawn_cache_clear(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let interval = self.clear_interval.filter(|i| !i.is_zero())?;
        let installer = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // first tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                installer.clear().await;
                debug!("🧹 template registry cleared");
            }
        }))
    }
}

fn replacement_order(customize: &BTreeMap<String, String>) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = customize
        .iter()
        .map(|(needle, replacement)| (needle.clone(), replacement.clone()))
        .collect();
    pairs.sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    pairs
}

async fn read_template(file: &Path) -> Result<String> {
    let body = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("💀 could not read template file '{}'", file.display()))?;
    if body.trim().is_empty() {
        warn!("⚠️ template file '{}' is empty", file.display());
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::config::TemplateConfig;
    use serde_json::json;
    use std::collections::HashMap;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Setup {
        _dir: tempfile::TempDir,
        config: OutputConfig,
    }

    fn setup(server: &MockServer, name: &str, template: TemplateConfig) -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("template.json");
        std::fs::write(
            &file,
            r#"{"index_patterns": ["PATTERN"], "settings": {"number_of_shards": 1}}"#,
        )
        .unwrap();
        let config = OutputConfig {
            hosts: Some(server.uri()),
            retry_base_delay_ms: 0,
            template: TemplateConfig {
                name: Some(name.into()),
                file: Some(file),
                ..template
            },
            ..OutputConfig::default()
        };
        Setup { _dir: dir, config }
    }

    async fn installer_and_client(config: &OutputConfig) -> (TemplateInstaller, ClientManager, Vec<HostSpec>) {
        let installer = TemplateInstaller::load(config).await.unwrap().expect("template configured");
        let client = ClientManager::new(config, None).unwrap();
        let vars = HashMap::new();
        let hosts = client.resolve_hosts(&PlaceholderContext::new("t", &vars)).unwrap();
        (installer, client, hosts)
    }

    #[tokio::test]
    async fn the_one_where_a_missing_template_gets_installed_exactly_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_template/app-logs"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/_template/app-logs"))
            .and(body_json(json!({"index_patterns": ["app-*"], "settings": {"number_of_shards": 1}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"acknowledged": true})))
            .expect(1)
            .mount(&server)
            .await;

        let setup = setup(
            &server,
            "${tag_parts[0]}-logs",
            TemplateConfig {
                customize: BTreeMap::from([("PATTERN".to_string(), "${tag_parts[0]}-*".to_string())]),
                ..TemplateConfig::default()
            },
        );
        let (installer, client, hosts) = installer_and_client(&setup.config).await;
        assert!(!installer.is_static());
        let vars = HashMap::new();
        let ctx = PlaceholderContext::new("app.web", &vars);
        installer.ensure(&client, &hosts, &ctx, "app-logs").await.unwrap();
        installer.ensure(&client, &hosts, &ctx, "app-logs").await.unwrap();
        assert_eq!(installer.installed_count().await, 1);
    }

    #[tokio::test]
    async fn the_one_where_an_existing_template_is_left_alone() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_index_template/static"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let setup = setup(
            &server,
            "static",
            TemplateConfig {
                use_legacy: false,
                ..TemplateConfig::default()
            },
        );
        let (installer, client, hosts) = installer_and_client(&setup.config).await;
        assert!(installer.is_static());
        let vars = HashMap::new();
        installer
            .ensure(&client, &hosts, &PlaceholderContext::new("t", &vars), "static")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn the_one_where_unresolvable_names_are_skipped_without_a_phone_call() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let setup = setup(&server, "${team}-template", TemplateConfig::default());
        let (installer, client, hosts) = installer_and_client(&setup.config).await;
        let vars = HashMap::new();
        installer
            .ensure(&client, &hosts, &PlaceholderContext::new("t", &vars), "x")
            .await
            .unwrap();
        assert_eq!(installer.installed_count().await, 0);
    }

    #[tokio::test]
    async fn the_one_where_exhaustion_policy_decides_the_mood() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let fatal = setup(
            &server,
            "tpl",
            TemplateConfig {
                max_retry: 1,
                ..TemplateConfig::default()
            },
        );
        let (installer, client, hosts) = installer_and_client(&fatal.config).await;
        let vars = HashMap::new();
        let ctx = PlaceholderContext::new("t", &vars);
        let err = installer
            .ensure(&client, &hosts, &ctx, "tpl")
            .await
            .expect_err("fatal on exhaustion");
        assert!(matches!(err, WriteError::ConnectionFailure { attempts: 1, .. }));

        let relaxed = setup(
            &server,
            "tpl",
            TemplateConfig {
                max_retry: 1,
                fail_on_retry_exceed: false,
                ..TemplateConfig::default()
            },
        );
        let (installer, client, hosts) = installer_and_client(&relaxed.config).await;
        installer.ensure(&client, &hosts, &ctx, "tpl").await.unwrap();
        assert_eq!(installer.installed_count().await, 0, "not recorded, so it is tried again later");
    }

    #[tokio::test]
    async fn the_one_where_the_registry_forgets_and_the_template_is_checked_again() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_template/tpl"))
            .respond_with(ResponseTemplate::new(404))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/_template/tpl"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"acknowledged": true})))
            .expect(2)
            .mount(&server)
            .await;
        let setup = setup(
            &server,
            "tpl",
            TemplateConfig {
                cache_clear_interval_secs: Some(1),
                ..TemplateConfig::default()
            },
        );
        let (installer, client, hosts) = installer_and_client(&setup.config).await;
        let installer = Arc::new(installer);
        let vars = HashMap::new();
        let ctx = PlaceholderContext::new("t", &vars);
        installer.ensure(&client, &hosts, &ctx, "tpl").await.unwrap();
        installer.ensure(&client, &hosts, &ctx, "tpl").await.unwrap();
        assert_eq!(installer.installed_count().await, 1);

        let timer = installer.spawn_cache_clear().expect("interval configured");
        for _ in 0..50 {
            if installer.installed_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        timer.abort();
        assert_eq!(installer.installed_count().await, 0, "timer cleared the registry");

        installer.ensure(&client, &hosts, &ctx, "tpl").await.unwrap();
        assert_eq!(installer.installed_count().await, 1);
    }

    #[test]
    fn the_one_where_overlapping_needles_do_not_trample_each_other() {
        let customize = BTreeMap::from([
            ("<<a>>".to_string(), "short".to_string()),
            ("<<ab>>".to_string(), "long".to_string()),
            ("SHARDS".to_string(), "3".to_string()),
            ("SHARDS_MAX".to_string(), "9".to_string()),
        ]);
        let ordered = replacement_order(&customize);
        let order: Vec<&str> = ordered
            .iter()
            .map(|(needle, _)| needle.as_str())
            .collect();
        assert_eq!(order, vec!["SHARDS_MAX", "<<ab>>", "SHARDS", "<<a>>"]);

        let installer = TemplateInstaller {
            name: "tpl".into(),
            body: "<<a>> <<ab>> SHARDS SHARDS_MAX".into(),
            overwrite: false,
            customize: replacement_order(&customize),
            use_legacy: true,
            logstash_format: false,
            clear_interval: None,
            retry: RetryPolicy {
                max_retries: 0,
                fail_on_exceed: false,
                base_delay: Duration::ZERO,
            },
            installed: Mutex::new(HashSet::new()),
        };
        let vars = HashMap::new();
        let body = installer.customized_body(&PlaceholderContext::new("t", &vars));
        assert_eq!(body, "short long 3 9");
    }
}
