//! 📊 progress.rs: "Are we there yet?" asked once per chunk.
//!
//! Two things live here:
//! - [`IngestStats`], the running totals of a whole ingest run. The CLI prints them
//!   as a table at the end, tests assert on them.
//! - [`ProgressMetrics`], an `indicatif` bar whose message is a small `comfy_table`
//!   of rates. Watching it will not make the cluster faster. We checked.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::NOTHING, presets::UTF8_FULL};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::output::WriteSummary;

const MIB: f64 = 1024.0 * 1024.0;

/// 🔢 "1000000" → "1,000,000". Eyes deserve nice things.
fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result
}

/// ⏱️ MM:SS, or HH:MM:SS for the long hauls.
fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}

/// 📊 Totals for one ingest run, summed over every chunk and every retry round.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestStats {
    pub chunks_written: u64,
    /// 💀 Chunks that failed unrecoverably, or ran out of retry rounds.
    pub chunks_failed: u64,
    /// 🔁 Chunk failures that were handed back for another round.
    pub chunks_retried: u64,
    pub retry_rounds: u32,
    pub records: u64,
    pub successes: u64,
    pub duplicates: u64,
    pub bad_arguments: u64,
    pub error_events: u64,
    pub dropped_missing_id: u64,
    pub requeued_records: u64,
    pub batches: u64,
    pub bytes: u64,
}

impl IngestStats {
    pub fn record_write(&mut self, summary: &WriteSummary) {
        self.chunks_written += 1;
        self.records += summary.records as u64;
        self.successes += summary.successes as u64;
        self.duplicates += summary.duplicates as u64;
        self.bad_arguments += summary.bad_arguments as u64;
        self.error_events += (summary.emitted + summary.routing_failures) as u64;
        self.dropped_missing_id += summary.dropped_missing_id as u64;
        self.requeued_records += summary.retried as u64;
        self.batches += summary.batches as u64;
        self.bytes += summary.bytes as u64;
    }

    /// ✅ Every record accounted for, and nothing failed.
    pub fn is_clean(&self) -> bool {
        self.chunks_failed == 0 && self.error_events == 0
    }

    /// 🍽️ The end-of-run summary, bordered, two columns.
    pub fn summary_table(&self, elapsed: Duration) -> Table {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec!["📊 metric", "value"]);
        let rows: [(&str, String); 14] = [
            ("chunks written", format_number(self.chunks_written)),
            ("chunks failed", format_number(self.chunks_failed)),
            ("chunk retries", format_number(self.chunks_retried)),
            ("retry rounds", self.retry_rounds.to_string()),
            ("records", format_number(self.records)),
            ("indexed", format_number(self.successes)),
            ("duplicates", format_number(self.duplicates)),
            ("rejected (400)", format_number(self.bad_arguments)),
            ("error events", format_number(self.error_events)),
            ("dropped (no id)", format_number(self.dropped_missing_id)),
            ("re-queued", format_number(self.requeued_records)),
            ("bulk requests", format_number(self.batches)),
            ("payload", format!("{:.2} MiB", self.bytes as f64 / MIB)),
            ("elapsed", format_duration(elapsed)),
        ];
        for (metric, value) in rows {
            table.add_row(vec![
                Cell::new(metric),
                Cell::new(value).set_alignment(CellAlignment::Right),
            ]);
        }
        table
    }
}

/// 📡 Throughput right now, over a sliding window.
struct Rates {
    records_per_sec: f64,
    mib_per_sec: f64,
}

/// 📊 Live progress over a known number of records.
///
/// Uses a sliding 5-second window so one slow bulk request doesn't look like the end of days.
pub(crate) struct ProgressMetrics {
    label: String,
    total_records: u64,
    done_records: u64,
    done_bytes: u64,
    progress_bar: ProgressBar,
    rate_samples: VecDeque<(Instant, u64, u64)>,
    start_time: Instant,
}

impl std::fmt::Debug for ProgressMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressMetrics")
            .field("label", &self.label)
            .field("total_records", &self.total_records)
            .field("done_records", &self.done_records)
            .field("done_bytes", &self.done_bytes)
            .finish()
    }
}

impl ProgressMetrics {
    pub(crate) fn new(label: String, total_records: u64, visible: bool) -> Self {
        let progress_bar = ProgressBar::new(total_records);
        if !visible {
            progress_bar.set_draw_target(ProgressDrawTarget::hidden());
        }
        if let Ok(style) = ProgressStyle::default_bar().template("{msg}\n| [{bar:40.cyan/blue}] {pos}/{len}") {
            progress_bar.set_style(style.progress_chars("=>-"));
        }

        let start_time = Instant::now();
        let mut rate_samples = VecDeque::new();
        rate_samples.push_back((start_time, 0u64, 0u64));

        Self {
            label,
            total_records,
            done_records: 0,
            done_bytes: 0,
            progress_bar,
            rate_samples,
            start_time,
        }
    }

    /// 🔄 A chunk finished (or gave up). Bump the totals and redraw.
    pub(crate) fn update(&mut self, records: u64, bytes: u64) {
        self.done_records += records;
        self.done_bytes += bytes;
        let rates = self.calculate_rates();
        self.render(rates);
        self.progress_bar.set_position(self.done_records.min(self.total_records));
    }

    pub(crate) fn finish(&self) {
        self.progress_bar.finish();
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    fn calculate_rates(&mut self) -> Rates {
        let now = Instant::now();
        let window = Duration::from_secs(5);
        while let Some(&(timestamp, _, _)) = self.rate_samples.front() {
            if now.duration_since(timestamp) > window {
                self.rate_samples.pop_front();
            } else {
                break;
            }
        }
        self.rate_samples.push_back((now, self.done_records, self.done_bytes));

        if let Some(&(oldest_time, oldest_records, oldest_bytes)) = self.rate_samples.front() {
            let elapsed = now.duration_since(oldest_time).as_secs_f64();
            if elapsed > 0.0 {
                return Rates {
                    records_per_sec: self.done_records.saturating_sub(oldest_records) as f64 / elapsed,
                    mib_per_sec: (self.done_bytes.saturating_sub(oldest_bytes) as f64 / elapsed) / MIB,
                };
            }
        }
        Rates {
            records_per_sec: 0.0,
            mib_per_sec: 0.0,
        }
    }

    fn render(&self, rates: Rates) {
        let percent = if self.total_records > 0 {
            (self.done_records as f64 / self.total_records as f64) * 100.0
        } else {
            0.0
        };
        let elapsed = self.start_time.elapsed();
        let remaining = if percent > 0.0 && percent < 100.0 {
            let total_estimated = elapsed.as_secs_f64() / (percent / 100.0);
            format_duration(Duration::from_secs_f64(total_estimated - elapsed.as_secs_f64()))
        } else {
            "--:--".to_string()
        };

        let mut table = Table::new();
        table.load_preset(NOTHING);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.add_row(vec![
            Cell::new(format!("{} records/s", format_number(rates.records_per_sec as u64)))
                .set_alignment(CellAlignment::Right),
            Cell::new(format!("{} records", format_number(self.done_records)))
                .set_alignment(CellAlignment::Right),
        ]);
        table.add_row(vec![
            Cell::new(format!("{:.2} MiB/s", rates.mib_per_sec)).set_alignment(CellAlignment::Right),
            Cell::new(format!("{percent:.2}%")).set_alignment(CellAlignment::Right),
        ]);
        table.add_row(vec![
            Cell::new(format!("{} elapsed", format_duration(elapsed))).set_alignment(CellAlignment::Right),
            Cell::new(format!("{remaining} remaining")).set_alignment(CellAlignment::Right),
        ]);
        self.progress_bar
            .set_message(format!("sluice: {}\n{table}", self.label));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_numbers_get_commas_and_time_gets_colons() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(1_234_567), "1,234,567");
        assert_eq!(format_duration(Duration::from_secs(75)), "01:15");
        assert_eq!(format_duration(Duration::from_secs(3_725)), "01:02:05");
    }

    #[test]
    fn the_one_where_every_write_adds_up() {
        let mut stats = IngestStats::default();
        let summary = WriteSummary {
            records: 10,
            successes: 7,
            emitted: 1,
            routing_failures: 1,
            retried: 1,
            batches: 2,
            bytes: 2048,
            ..WriteSummary::default()
        };
        stats.record_write(&summary);
        stats.record_write(&summary);
        assert_eq!(stats.chunks_written, 2);
        assert_eq!(stats.records, 20);
        assert_eq!(stats.error_events, 4);
        assert_eq!(stats.requeued_records, 2);
        assert!(!stats.is_clean());

        let rendered = stats.summary_table(Duration::from_secs(1)).to_string();
        assert!(rendered.contains("records"));
        assert!(rendered.contains("20"));
    }

    #[test]
    fn the_one_where_a_hidden_bar_still_counts() {
        let mut metrics = ProgressMetrics::new("test".into(), 10, false);
        metrics.update(4, 100);
        metrics.update(6, 100);
        assert_eq!(metrics.done_records, 10);
        assert_eq!(metrics.done_bytes, 200);
        metrics.finish();
    }
}
