//! 🔧 App configuration: TOML and `SLUICE_*` env vars poured into one struct.
//!
//! 🏗️ Figment does the merging. We do the worrying.
//!
//! - No file given: env vars only.
//! - File given: env vars first, TOML layered on top. TOML wins on conflicts.

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use std::path::Path;
use tracing::info;

use crate::output::OutputConfig;

/// 📦 Everything the process needs to know about itself.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    /// 🚰 The bulk output: hosts, routing, batching, failure policy.
    #[serde(default)]
    pub output: OutputConfig,
    /// 🧵 How the host side feeds chunks in.
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// 🧵 Host-side knobs: queue depth, worker count, chunking, retry rounds.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// 📬 Chunks waiting in the channel before the reader blocks.
    pub queue_capacity: usize,
    /// 👷 Concurrent `write(chunk)` callers.
    pub worker_count: usize,
    /// 📦 Records per chunk when splitting the input file.
    pub chunk_size_records: usize,
    /// 🔁 Entries the retry stream may hold before it reports overflow.
    pub retry_queue_capacity: usize,
    /// 🔁 How many times a failed or re-queued chunk gets another go.
    pub max_retry_rounds: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10,
            worker_count: 1,
            chunk_size_records: 1000,
            retry_queue_capacity: 10_000,
            max_retry_rounds: 3,
        }
    }
}

/// 🚀 Load the config from `SLUICE_*` env vars and an optional TOML file.
///
/// Nested env keys use a double underscore: `SLUICE_OUTPUT__HOSTS=http://es:9200`.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new(""))
    );

    let config = Figment::new().merge(Env::prefixed("SLUICE_").split("__"));
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (SLUICE_*). \
             Check the file exists and the TOML is actually TOML.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (SLUICE_*). \
                 No file was provided, so this one is all on the environment."
            .to_string(),
    };
    config.extract().context(context_msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{CompressionLevel, WriteOperation};
    use std::fs;

    fn write_test_config(dir: &tempfile::TempDir, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join("sluice.toml");
        fs::write(&path, contents).expect("💀 Failed to write test config. The disk said no.");
        path
    }

    #[test]
    fn the_one_where_the_output_and_runtime_tables_both_land() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_config(
            &dir,
            r#"
            [runtime]
            queue_capacity = 8
            worker_count = 3

            [output]
            hosts = "http://es-1:9200,http://es-2:9200"
            write_operation = "upsert"
            id_key = "request_id"
            compression_level = "best_speed"
            bulk_message_request_threshold = -1

            [output.template]
            name = "logs"
            file = "/etc/sluice/logs-template.json"
            "#,
        );

        let app_config = load_config(Some(&path)).expect("💀 A valid file should parse.");
        assert_eq!(app_config.runtime.queue_capacity, 8);
        assert_eq!(app_config.runtime.worker_count, 3);
        assert_eq!(app_config.runtime.max_retry_rounds, 3);
        assert_eq!(app_config.output.write_operation, WriteOperation::Upsert);
        assert_eq!(app_config.output.compression_level, CompressionLevel::BestSpeed);
        assert_eq!(app_config.output.bulk_message_request_threshold, -1);
        assert_eq!(app_config.output.template.name.as_deref(), Some("logs"));
        assert!(app_config.output.template.use_legacy);
    }

    #[test]
    fn the_one_where_an_empty_file_is_all_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_config(&dir, "");
        let app_config: AppConfig = Figment::new()
            .merge(Toml::file(&path))
            .extract()
            .expect("💀 Defaults should cover everything.");
        assert_eq!(app_config.runtime, RuntimeConfig::default());
        assert_eq!(app_config.output.index_name, "fluentd");
    }

    #[test]
    fn the_one_where_the_runtime_section_is_read_by_its_own_names() {
        let parsed: AppConfig = toml::from_str(
            r#"
            [runtime]
            queue_capacity = 12
            worker_count = 4
            chunk_size_records = 50
            "#,
        )
        .expect("💀 A runtime section should parse.");
        assert_eq!(parsed.runtime.queue_capacity, 12);
        assert_eq!(parsed.runtime.worker_count, 4);
        assert_eq!(parsed.runtime.chunk_size_records, 50);
        assert_eq!(parsed.runtime.max_retry_rounds, 3, "untouched knobs keep their defaults");
        let unknown: AppConfig =
            toml::from_str("[runtime]\nnum_workers = 4\n").expect("💀 Unknown keys are ignored.");
        assert_eq!(unknown.runtime.worker_count, 1, "only the documented names count");
    }

    #[test]
    fn the_one_where_a_typo_in_the_write_operation_is_caught_at_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_config(&dir, "[output]\nwrite_operation = \"yeet\"\n");
        let err = load_config(Some(&path)).expect_err("unknown variant");
        assert!(format!("{err:#}").contains("sluice.toml"));
    }
}
