use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};

use chrono::Utc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static UPLOAD_LOG: OnceLock<UploadLogFile> = OnceLock::new();
static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// The NDJSON file events are routed to. Events emitted while no upload log is open are
/// discarded.
#[derive(Debug, Default)]
struct UploadLogFile {
    out: Mutex<Option<BufWriter<File>>>,
}

impl UploadLogFile {
    fn lock(&self) -> MutexGuard<'_, Option<BufWriter<File>>> {
        self.out.lock().expect("upload log mutex poisoned")
    }

    fn open(&self, path: &Path) -> std::io::Result<()> {
        let mut out = self.lock();
        if out.is_some() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "an upload log is already open",
            ));
        }
        let file = OpenOptions::new().create_new(true).write(true).open(path)?;
        *out = Some(BufWriter::new(file));
        Ok(())
    }

    fn close(&self) -> std::io::Result<()> {
        let Some(mut writer) = self.lock().take() else {
            return Ok(());
        };
        writer.flush()?;
        writer.get_ref().sync_all()
    }
}

/// One event's worth of output; holds the lock so lines from different threads never
/// interleave.
struct EventWriter<'a> {
    out: MutexGuard<'a, Option<BufWriter<File>>>,
}

impl Write for EventWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.out.as_mut() {
            Some(writer) => writer.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.out.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for UploadLogFile {
    type Writer = EventWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        EventWriter { out: self.lock() }
    }
}

impl<'a> MakeWriter<'a> for &UploadLogFile {
    type Writer = EventWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        EventWriter { out: (**self).lock() }
    }
}

/// `SYNCBRIDGE_LOG` wins over `RUST_LOG`; an unparsable directive falls back to `debug`.
fn build_env_filter_from(syncbridge_log: Option<&str>, rust_log: Option<&str>) -> EnvFilter {
    syncbridge_log
        .or(rust_log)
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("debug"))
}

fn build_env_filter() -> EnvFilter {
    build_env_filter_from(
        std::env::var("SYNCBRIDGE_LOG").ok().as_deref(),
        std::env::var("RUST_LOG").ok().as_deref(),
    )
}

pub fn init_upload_logging() {
    TRACING_INIT.get_or_init(|| {
        let log: &'static UploadLogFile = UPLOAD_LOG.get_or_init(UploadLogFile::default);
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
            .with_writer(log);

        let _ = tracing_subscriber::registry()
            .with(build_env_filter())
            .with(layer)
            .try_init();
    });
}

/// Closes and syncs the upload log when dropped.
pub struct UploadLogGuard {
    path: PathBuf,
}

impl UploadLogGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UploadLogGuard {
    fn drop(&mut self) {
        if let Some(log) = UPLOAD_LOG.get() {
            let _ = log.close();
        }
    }
}

/// Routes the JSON event stream into `<log dir>/upload-<kind>-<utc>-<upload_id>.ndjson`
/// until the returned guard is dropped. Only one upload log may be active at a time.
pub fn start_upload_log(
    kind: &str,
    upload_id: &str,
    data_dir: &Path,
) -> std::io::Result<UploadLogGuard> {
    init_upload_logging();

    match kind {
        "file" | "stream" | "inventory" => {}
        other => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("unsupported kind: {other}"),
            ));
        }
    }

    let log_dir = resolve_log_dir(data_dir);
    std::fs::create_dir_all(&log_dir)?;

    let started_at_utc = Utc::now();
    let file_name = format!(
        "upload-{}-{}-{}.ndjson",
        sanitize_filename_component(kind),
        started_at_utc.format("%Y%m%dT%H%M%SZ"),
        sanitize_filename_component(upload_id)
    );
    let path = log_dir.join(file_name);

    UPLOAD_LOG.get_or_init(UploadLogFile::default).open(&path)?;

    Ok(UploadLogGuard { path })
}

fn resolve_log_dir(data_dir: &Path) -> PathBuf {
    if let Ok(v) = std::env::var("SYNCBRIDGE_LOG_DIR") {
        return PathBuf::from(v);
    }
    data_dir.join("logs")
}

fn sanitize_filename_component(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_filter_prefers_syncbridge_log_over_rust_log() {
        assert_eq!(build_env_filter_from(Some("info"), Some("debug")).to_string(), "info");
        assert_eq!(build_env_filter_from(None, Some("warn")).to_string(), "warn");
        assert_eq!(build_env_filter_from(None, None).to_string(), "debug");
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let err = start_upload_log("backup", "u_1", temp.path()).err().unwrap();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[test]
    fn file_names_are_sanitized() {
        assert_eq!(sanitize_filename_component("s 1/f:2"), "s_1_f_2");
    }

    #[test]
    fn upload_log_is_ndjson_and_flushed_on_drop() {
        let temp = tempfile::tempdir().expect("create tempdir");
        let guard = start_upload_log("file", "upl_test", temp.path()).expect("start_upload_log");

        let expected_dir = temp.path().join("logs");
        assert_eq!(guard.path().parent(), Some(expected_dir.as_path()));
        let name = guard.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("upload-file-"));
        assert!(name.ends_with("-upl_test.ndjson"));

        tracing::info!(event = "upload.start", file_id = "f_1", "upload.start");
        tracing::debug!(event = "slicing.finished", file_id = "f_1", parts = 3u64, "slicing.finished");
        tracing::info!(event = "upload.finished", file_id = "f_1", bytes = 42u64, "upload.finished");

        let path = guard.path().to_path_buf();
        drop(guard);

        let text = std::fs::read_to_string(&path).expect("read upload log");
        assert!(!text.trim().is_empty(), "upload log is empty");

        for line in text.lines() {
            let v: serde_json::Value = serde_json::from_str(line).expect("valid json line");
            let obj = v.as_object().expect("json object");
            assert!(obj.contains_key("timestamp"));
            assert!(obj.contains_key("level"));
            let fields = obj
                .get("fields")
                .and_then(|f| f.as_object())
                .expect("fields object");
            assert!(fields.contains_key("event"), "fields missing event");
        }
    }
}
