//! Per-request telemetry lines and the Prometheus exposition.
//!
//! Telemetry is one JSON object per handled request, appended to `LOG_FILE`
//! through a size-rotated writer.  Lines never contain guest text, only
//! identifiers, status and timing.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use dashmap::DashMap;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;

use crate::config::RotationConfig;

pub const TELEMETRY_SCHEMA_VERSION: u8 = 1;

/// Latency histogram upper bounds in ms.  Model calls dominate, hence the
/// long tail.
pub const LATENCY_BUCKETS_MS: [u64; 14] = [
    1, 2, 5, 10, 20, 50, 100, 200, 500, 1000, 2000, 5000, 10000, 30000,
];

/// Size-based rotating writer.  Backups are `<path>.1` … `<path>.<keep>`,
/// gzip-compressed to `<path>.N.gz` when `compress` is set.
pub struct RotatingWriter {
    path: PathBuf,
    file: fs::File,
    rotation: RotationConfig,
}

impl RotatingWriter {
    pub fn open(path: impl AsRef<Path>, rotation: RotationConfig) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file,
            rotation,
        })
    }

    pub fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        if let Some(limit) = self.rotation.max_bytes {
            if self.current_size().unwrap_or(0) >= limit {
                self.rotate()?;
            }
        }
        writeln!(self.file, "{}", line)
    }

    pub fn current_size(&self) -> Option<u64> {
        self.path.metadata().ok().map(|m| m.len())
    }

    pub fn backup_path(&self, idx: usize, gz: bool) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{}", idx));
        if gz {
            name.push(".gz");
        }
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        let keep = self.rotation.keep;
        if keep > 0 {
            for gz in [false, true] {
                let _ = fs::remove_file(self.backup_path(keep, gz));
                for idx in (1..keep).rev() {
                    let from = self.backup_path(idx, gz);
                    if from.exists() {
                        let _ = fs::rename(&from, self.backup_path(idx + 1, gz));
                    }
                }
            }
            fs::rename(&self.path, self.backup_path(1, false))?;
            if self.rotation.compress {
                self.compress_first_backup();
            }
        }
        self.file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        Ok(())
    }

    fn compress_first_backup(&self) {
        let plain = self.backup_path(1, false);
        let Ok(data) = fs::read(&plain) else {
            return;
        };
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        let compressed = gz.write_all(&data).and_then(|_| gz.finish());
        match compressed {
            Ok(buf) => {
                if fs::write(self.backup_path(1, true), buf).is_ok() {
                    let _ = fs::remove_file(&plain);
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to compress rotated telemetry file"),
        }
    }
}

/// One line per handled request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEvent<'a> {
    pub schema_version: u8,
    pub ts: String,
    pub request_id: &'a str,
    pub endpoint: &'a str,
    pub status: u16,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_used: Option<&'a str>,
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'a str>,
}

impl<'a> RequestEvent<'a> {
    pub fn new(request_id: &'a str, endpoint: &'a str, status: u16, latency_ms: u64) -> Self {
        Self {
            schema_version: TELEMETRY_SCHEMA_VERSION,
            ts: chrono::Utc::now().to_rfc3339(),
            request_id,
            endpoint,
            status,
            latency_ms,
            model_used: None,
            degraded: false,
            error_code: None,
        }
    }
}

#[derive(Clone, Default)]
pub struct TelemetrySink {
    writer: Option<Arc<Mutex<RotatingWriter>>>,
    log_stdout: bool,
    lines_total: Arc<AtomicU64>,
    write_errors_total: Arc<AtomicU64>,
    log_file_size_bytes: Arc<AtomicU64>,
}

impl TelemetrySink {
    pub fn new(writer: Option<RotatingWriter>, log_stdout: bool) -> Self {
        Self {
            writer: writer.map(|w| Arc::new(Mutex::new(w))),
            log_stdout,
            ..Default::default()
        }
    }

    /// Open `path` if given.  A file that cannot be opened disables file
    /// telemetry with a warning rather than failing startup.
    pub fn from_config(log_file: Option<&str>, rotation: &RotationConfig, log_stdout: bool) -> Self {
        let writer = match log_file {
            Some(path) => match RotatingWriter::open(path, rotation.clone()) {
                Ok(w) => Some(w),
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "Failed to open LOG_FILE for telemetry; telemetry disabled");
                    None
                }
            },
            None => {
                tracing::info!("File telemetry disabled: LOG_FILE not set");
                None
            }
        };
        Self::new(writer, log_stdout)
    }

    pub fn emit(&self, event: &RequestEvent<'_>) {
        let wrote = self.write(event);
        if (wrote || self.writer.is_none()) && self.log_stdout {
            tracing::info!(
                target: "telemetry",
                requestId = %event.request_id,
                endpoint = %event.endpoint,
                status = event.status,
                latencyMs = event.latency_ms,
                modelUsed = ?event.model_used,
                degraded = event.degraded,
                errorCode = ?event.error_code,
            );
        }
    }

    fn write(&self, event: &RequestEvent<'_>) -> bool {
        let Some(writer) = self.writer.as_ref() else {
            return false;
        };
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize telemetry line");
                return false;
            }
        };
        let Ok(mut guard) = writer.lock() else {
            return false;
        };
        match guard.write_line(&line) {
            Ok(()) => {
                self.lines_total.fetch_add(1, Ordering::Relaxed);
                if let Some(size) = guard.current_size() {
                    self.log_file_size_bytes.store(size, Ordering::Relaxed);
                }
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to write telemetry line");
                self.write_errors_total.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn lines_total(&self) -> u64 {
        self.lines_total.load(Ordering::Relaxed)
    }

    pub fn write_errors_total(&self) -> u64 {
        self.write_errors_total.load(Ordering::Relaxed)
    }

    pub fn log_file_size_bytes(&self) -> u64 {
        self.log_file_size_bytes.load(Ordering::Relaxed)
    }
}

type Counters = DashMap<&'static str, AtomicU64, ahash::RandomState>;

/// Process-wide counters behind `/metrics`.
pub struct Metrics {
    requests: Counters,
    rejections: Counters,
    model_fallbacks: Counters,
    hist_counts: [AtomicU64; LATENCY_BUCKETS_MS.len()],
    hist_sum_ms: AtomicU64,
    hist_count: AtomicU64,
    start_epoch_secs: f64,
    started: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            requests: Counters::default(),
            rejections: Counters::default(),
            model_fallbacks: Counters::default(),
            hist_counts: std::array::from_fn(|_| AtomicU64::new(0)),
            hist_sum_ms: AtomicU64::new(0),
            hist_count: AtomicU64::new(0),
            start_epoch_secs: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
            started: Instant::now(),
        }
    }

    pub fn record_request(&self, endpoint: &'static str, latency_ms: u64) {
        bump(&self.requests, endpoint);
        self.hist_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.hist_count.fetch_add(1, Ordering::Relaxed);
        if let Some(idx) = LATENCY_BUCKETS_MS.iter().position(|ub| latency_ms <= *ub) {
            self.hist_counts[idx].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_rejection(&self, code: &'static str) {
        bump(&self.rejections, code);
    }

    pub fn record_model_fallback(&self, stage: &'static str) {
        bump(&self.model_fallbacks, stage);
    }

    pub fn requests_total(&self, endpoint: &str) -> u64 {
        read(&self.requests, endpoint)
    }

    pub fn rejections_total(&self, code: &str) -> u64 {
        read(&self.rejections, code)
    }

    pub fn model_fallbacks_total(&self, stage: &str) -> u64 {
        read(&self.model_fallbacks, stage)
    }

    /// Prometheus text exposition format 0.0.4.
    pub fn render(&self, telemetry: &TelemetrySink, log_failures: u64) -> String {
        let mut buf = String::new();
        family(
            &mut buf,
            "dinegate_requests_total",
            "Requests that reached a pipeline handler",
            "counter",
        );
        labelled(&mut buf, "dinegate_requests_total", "endpoint", &self.requests);
        family(
            &mut buf,
            "dinegate_rejections_total",
            "Error responses by error code",
            "counter",
        );
        labelled(&mut buf, "dinegate_rejections_total", "code", &self.rejections);
        family(
            &mut buf,
            "dinegate_model_fallbacks_total",
            "Model calls replaced by a fallback",
            "counter",
        );
        labelled(
            &mut buf,
            "dinegate_model_fallbacks_total",
            "stage",
            &self.model_fallbacks,
        );
        family(
            &mut buf,
            "dinegate_conversation_log_failures_total",
            "Conversation log writes that failed",
            "counter",
        );
        writeln!(&mut buf, "dinegate_conversation_log_failures_total {}", log_failures).ok();
        family(
            &mut buf,
            "dinegate_telemetry_lines_total",
            "Telemetry JSON lines written",
            "counter",
        );
        writeln!(&mut buf, "dinegate_telemetry_lines_total {}", telemetry.lines_total()).ok();
        family(
            &mut buf,
            "dinegate_telemetry_write_errors_total",
            "Telemetry JSON line write failures",
            "counter",
        );
        writeln!(
            &mut buf,
            "dinegate_telemetry_write_errors_total {}",
            telemetry.write_errors_total()
        )
        .ok();

        family(
            &mut buf,
            "dinegate_request_latency_ms",
            "Request latency histogram milliseconds",
            "histogram",
        );
        let mut cumulative = 0u64;
        for (ub, count) in LATENCY_BUCKETS_MS.iter().zip(&self.hist_counts) {
            cumulative += count.load(Ordering::Relaxed);
            writeln!(
                &mut buf,
                "dinegate_request_latency_ms_bucket{{le=\"{}\"}} {}",
                ub, cumulative
            )
            .ok();
        }
        let count = self.hist_count.load(Ordering::Relaxed);
        writeln!(&mut buf, "dinegate_request_latency_ms_bucket{{le=\"+Inf\"}} {}", count).ok();
        writeln!(
            &mut buf,
            "dinegate_request_latency_ms_sum {}",
            self.hist_sum_ms.load(Ordering::Relaxed)
        )
        .ok();
        writeln!(&mut buf, "dinegate_request_latency_ms_count {}", count).ok();

        family(&mut buf, "dinegate_build_info", "Build information", "gauge");
        writeln!(
            &mut buf,
            "dinegate_build_info{{version=\"{}\",schemaVersion=\"{}\"}} 1",
            env!("CARGO_PKG_VERSION"),
            TELEMETRY_SCHEMA_VERSION
        )
        .ok();
        family(
            &mut buf,
            "dinegate_log_file_size_bytes",
            "Current size in bytes of the telemetry log file (0 if disabled)",
            "gauge",
        );
        writeln!(&mut buf, "dinegate_log_file_size_bytes {}", telemetry.log_file_size_bytes()).ok();
        family(
            &mut buf,
            "dinegate_process_start_time_seconds",
            "Process start time (Unix epoch seconds)",
            "gauge",
        );
        writeln!(&mut buf, "dinegate_process_start_time_seconds {}", self.start_epoch_secs).ok();
        family(
            &mut buf,
            "dinegate_process_uptime_seconds",
            "Process uptime seconds",
            "gauge",
        );
        writeln!(
            &mut buf,
            "dinegate_process_uptime_seconds {}",
            self.started.elapsed().as_secs_f64()
        )
        .ok();
        buf
    }
}

fn bump(counters: &Counters, key: &'static str) {
    counters
        .entry(key)
        .or_insert_with(|| AtomicU64::new(0))
        .fetch_add(1, Ordering::Relaxed);
}

fn read(counters: &Counters, key: &str) -> u64 {
    counters
        .get(key)
        .map(|c| c.load(Ordering::Relaxed))
        .unwrap_or(0)
}

fn family(buf: &mut String, name: &str, help: &str, kind: &str) {
    writeln!(buf, "# HELP {} {}\n# TYPE {} {}", name, help, name, kind).ok();
}

fn labelled(buf: &mut String, name: &str, label: &str, counters: &Counters) {
    // sorted for stable output
    let snapshot: BTreeMap<&str, u64> = counters
        .iter()
        .map(|e| (*e.key(), e.value().load(Ordering::Relaxed)))
        .collect();
    for (value, count) in snapshot {
        writeln!(buf, "{}{{{}=\"{}\"}} {}", name, label, value, count).ok();
    }
}
