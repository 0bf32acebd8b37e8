//! 🚀 Bulk submitter: one batch, one HTTP request, one parsed response.
//!
//! Bodies go out as `application/x-ndjson`, gzip-compressed with `Content-Encoding: gzip`
//! when a compression level is configured. Non-2xx statuses and unparseable bodies come
//! back as a [`TransportFailure`], which [`BulkSubmitter::escalate`] turns into the
//! `WriteError` the host sees.

use std::io::Write as _;
use std::path::PathBuf;

use anyhow::Context;
use flate2::write::GzEncoder;
use serde_json::{Value, json};
use tracing::{debug, error, trace, warn};

use crate::common::Chunk;
use crate::error::{TransportErrorKind, TransportFailure, WriteError};
use crate::output::batch::{BulkBatch, DestinationKey};
use crate::output::client::{ClientManager, ConnectionHandle};
use crate::output::config::{CompressionLevel, OutputConfig};

#[derive(Debug, Clone)]
pub struct BulkSubmitter {
    compression: CompressionLevel,
    include_index_in_url: bool,
    reconnect_on_error: bool,
    ignore: Vec<TransportErrorKind>,
    exception_backup: bool,
    backup_dir: PathBuf,
}

impl BulkSubmitter {
    pub fn new(config: &OutputConfig) -> anyhow::Result<Self> {
        Ok(Self {
            compression: config.compression_level,
            include_index_in_url: config.include_index_in_url,
            reconnect_on_error: config.reconnect_on_error,
            ignore: config.ignore_list()?,
            exception_backup: config.exception_backup,
            backup_dir: config.backup_dir.clone(),
        })
    }

    /// 📍 `_bulk`, or `<index>/_bulk` when the index rides in the URL.
    pub fn bulk_path(&self, key: &DestinationKey) -> String {
        if self.include_index_in_url {
            format!("{}/_bulk", key.url_index())
        } else {
            "_bulk".to_string()
        }
    }

    /// 🫁 Squish the payload, if we were asked to.
    pub fn encode(&self, payload: &str) -> Result<Vec<u8>, TransportFailure> {
        let Some(level) = self.compression.flate2_level() else {
            return Ok(payload.as_bytes().to_vec());
        };
        let gzip_failed =
            |err: std::io::Error| TransportFailure::new(TransportErrorKind::Request, format!("gzip failed: {err}"));
        // 🗜️ NDJSON full of repeated keys squishes to roughly a quarter, so start there
        let mut encoder = GzEncoder::new(Vec::with_capacity(payload.len() / 4), level);
        encoder.write_all(payload.as_bytes()).map_err(gzip_failed)?;
        encoder.finish().map_err(gzip_failed)
    }

    /// 📡 POST one batch and hand back the parsed response body.
    pub async fn submit(&self, handle: &ConnectionHandle, batch: &BulkBatch) -> Result<Value, TransportFailure> {
        let path = self.bulk_path(&batch.key);
        let body = self.encode(&batch.payload)?;
        debug!(
            "📡 bulk request to '{path}': {} actions, {} bytes ({} on the wire)",
            batch.count(),
            batch.bytes(),
            body.len()
        );
        trace!("📡 bulk payload:\n{}", batch.payload);

        let mut request = handle
            .request(reqwest::Method::POST, &path)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson");
        if self.compression.is_enabled() {
            request = request.header(reqwest::header::CONTENT_ENCODING, "gzip");
        }
        let response = request.body(body).send().await.map_err(TransportFailure::from_reqwest)?;
        let status = response.status();
        let text = response.text().await.map_err(TransportFailure::from_reqwest)?;
        trace!("📡 bulk response ({status}): {text}");
        if !status.is_success() {
            // 🔥 the whole request bounced. Per-item results only exist on a 2xx.
            return Err(TransportFailure::from_status(status.as_u16(), &text));
        }
        serde_json::from_str(&text).map_err(|err| {
            TransportFailure::new(
                TransportErrorKind::Decode,
                format!("bulk response is not JSON ({err}): {text}"),
            )
        })
    }

    /// 🚨 Turn a failed exchange into what the host should hear.
    ///
    /// - `reconnect_on_error`: the cached handle is dropped first. The detected version
    ///   stays, it was settled once and a flaky request does not change it.
    /// - ignorable kinds: logged, backed up if configured, then unrecoverable.
    /// - everything else: recoverable.
    pub async fn escalate(
        &self,
        client: &ClientManager,
        handle: &ConnectionHandle,
        chunk: &Chunk,
        failure: TransportFailure,
    ) -> WriteError {
        // 🧷 sticky selectors move on to the next host after this
        handle.note_failure();
        if self.reconnect_on_error {
            debug!("🔌 reconnect_on_error: dropping the cached connection");
            client.invalidate();
        }
        if self.ignore.contains(&failure.kind) {
            warn!("⚠️ exception ignored in tag {}: {failure}", chunk.tag);
            if self.exception_backup {
                match self.backup(chunk).await {
                    Ok(path) => warn!("💾 chunk {} backed up to '{}'", chunk.unique_id, path.display()),
                    Err(err) => error!("💀 could not back up chunk {}: {err:#}", chunk.unique_id),
                }
            }
            return WriteError::Unrecoverable(format!("ignored {failure}"));
        }
        WriteError::Recoverable {
            hosts: handle.describe(),
            message: failure.to_string(),
        }
    }

    /// 💾 Write the chunk as re-ingestable NDJSON to `backup_dir/<tag>.<chunk-id>.log`.
    pub async fn backup(&self, chunk: &Chunk) -> anyhow::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.backup_dir)
            .await
            .with_context(|| format!("💀 could not create backup dir '{}'", self.backup_dir.display()))?;
        let path = self
            .backup_dir
            .join(format!("{}.{}.log", chunk.tag, chunk.unique_id));
        let mut contents = String::new();
        for entry in &chunk.entries {
            let line = json!({"time": entry.time.to_rfc3339(), "tag": chunk.tag, "record": entry.record});
            contents.push_str(&line.to_string());
            contents.push('\n');
        }
        tokio::fs::write(&path, contents)
            .await
            .with_context(|| format!("💀 could not write backup file '{}'", path.display()))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::test_support::chunk_of;
    use crate::output::placeholders::PlaceholderContext;
    use flate2::read::GzDecoder;
    use std::collections::HashMap;
    use std::io::Read as _;
    use std::sync::Arc;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn key(index: &str) -> DestinationKey {
        DestinationKey {
            host: "h:9200".into(),
            explicit_index: Some(index.into()),
            target_index: index.into(),
            target_alias: None,
        }
    }

    fn batch(payload: &str) -> BulkBatch {
        BulkBatch {
            key: key("logs"),
            payload: payload.to_string(),
            entries: Vec::new(),
        }
    }

    fn client_for(server: &MockServer, config: OutputConfig) -> (ClientManager, Arc<ConnectionHandle>) {
        let config = OutputConfig {
            hosts: Some(server.uri()),
            ..config
        };
        let client = ClientManager::new(&config, None).unwrap();
        let vars = HashMap::new();
        let hosts = client.resolve_hosts(&PlaceholderContext::new("t", &vars)).unwrap();
        let handle = client.connection(&hosts).unwrap();
        (client, handle)
    }

    #[test]
    fn the_one_where_gzip_round_trips_and_plain_stays_plain() {
        let plain = BulkSubmitter::new(&OutputConfig::default()).unwrap();
        assert_eq!(plain.encode("abc").unwrap(), b"abc");

        let squished = BulkSubmitter::new(&OutputConfig {
            compression_level: CompressionLevel::BestCompression,
            ..OutputConfig::default()
        })
        .unwrap();
        let encoded = squished.encode("{\"index\":{}}\n{}\n").unwrap();
        let mut decoded = String::new();
        GzDecoder::new(encoded.as_slice()).read_to_string(&mut decoded).unwrap();
        assert_eq!(decoded, "{\"index\":{}}\n{}\n");
    }

    #[test]
    fn the_one_where_the_index_moves_into_the_url() {
        let submitter = BulkSubmitter::new(&OutputConfig {
            include_index_in_url: true,
            ..OutputConfig::default()
        })
        .unwrap();
        assert_eq!(submitter.bulk_path(&key("logs-2024")), "logs-2024/_bulk");
        let default = BulkSubmitter::new(&OutputConfig::default()).unwrap();
        assert_eq!(default.bulk_path(&key("logs-2024")), "_bulk");
    }

    #[tokio::test]
    async fn the_one_where_a_compressed_bulk_lands_with_the_right_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .and(header("content-type", "application/x-ndjson"))
            .and(header("content-encoding", "gzip"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"errors": false, "items": []})))
            .expect(1)
            .mount(&server)
            .await;
        let config = OutputConfig {
            compression_level: CompressionLevel::BestSpeed,
            ..OutputConfig::default()
        };
        let (_client, handle) = client_for(&server, config.clone());
        let submitter = BulkSubmitter::new(&config).unwrap();
        let response = submitter.submit(&handle, &batch("{\"index\":{}}\n{}\n")).await.unwrap();
        assert_eq!(response["errors"], json!(false));
    }

    #[tokio::test]
    async fn the_one_where_a_500_is_recoverable_but_an_ignored_one_is_not() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("cluster napping"))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let chunk = chunk_of("app.web", vec![json!({"msg": "save me"})]);

        let (client, handle) = client_for(&server, OutputConfig::default());
        let submitter = BulkSubmitter::new(&OutputConfig::default()).unwrap();
        let failure = submitter.submit(&handle, &batch("x\n")).await.unwrap_err();
        assert_eq!(failure.kind, TransportErrorKind::ServerError);
        let err = submitter.escalate(&client, &handle, &chunk, failure).await;
        assert!(err.is_retryable());

        let ignoring = OutputConfig {
            ignore_exceptions: vec!["server_error".into()],
            backup_dir: dir.path().to_path_buf(),
            reconnect_on_error: true,
            ..OutputConfig::default()
        };
        let submitter = BulkSubmitter::new(&ignoring).unwrap();
        let failure = submitter.submit(&handle, &batch("x\n")).await.unwrap_err();
        let err = submitter.escalate(&client, &handle, &chunk, failure).await;
        assert!(matches!(err, WriteError::Unrecoverable(_)));

        let backup = dir.path().join(format!("app.web.{}.log", chunk.unique_id));
        let contents = std::fs::read_to_string(backup).expect("backup written");
        let line: Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(line["record"], json!({"msg": "save me"}));
        assert_eq!(line["time"], json!("2024-01-01T00:00:00+00:00"));
    }

    #[tokio::test]
    async fn the_one_where_a_failed_submit_only_reconnects_when_asked() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let chunk = chunk_of("app.web", vec![json!({"msg": "hi"})]);
        let (client, handle) = client_for(&server, OutputConfig::default());
        let vars = HashMap::new();
        let hosts = client.resolve_hosts(&PlaceholderContext::new("t", &vars)).unwrap();

        let stubborn = BulkSubmitter::new(&OutputConfig::default()).unwrap();
        let failure = stubborn.submit(&handle, &batch("x\n")).await.unwrap_err();
        stubborn.escalate(&client, &handle, &chunk, failure).await;
        let same = client.connection(&hosts).unwrap();
        assert!(Arc::ptr_eq(&handle, &same), "no reconnect_on_error, no new handle");

        let reconnecting = BulkSubmitter::new(&OutputConfig {
            reconnect_on_error: true,
            ..OutputConfig::default()
        })
        .unwrap();
        let failure = reconnecting.submit(&same, &batch("x\n")).await.unwrap_err();
        reconnecting.escalate(&client, &same, &chunk, failure).await;
        let fresh = client.connection(&hosts).unwrap();
        assert!(!Arc::ptr_eq(&same, &fresh), "reconnect_on_error builds a new handle");
        assert_eq!(fresh.describe(), same.describe());
    }
}
