//! Logging initialization.
//!
//! Structured JSONL goes to `<base>/logs/harvest.jsonl` (one object per
//! line, flushed per write so `tail -f | jq` works), with an optional compact
//! stderr layer for foreground runs. `RUST_LOG` overrides the configured level.

use crate::{CoreError, CoreResult};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Append-only log file writer shared by all logging threads.
#[derive(Clone)]
pub struct JsonlFileWriter {
    inner: Arc<Mutex<BufWriter<File>>>,
}

impl JsonlFileWriter {
    /// Open `path` for appending, creating parent directories.
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            inner: Arc::new(Mutex::new(BufWriter::with_capacity(8192, file))),
        })
    }
}

impl Write for JsonlFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.inner.lock();
        let written = guard.write(buf)?;
        guard.flush()?;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().flush()
    }
}

impl<'a> MakeWriter<'a> for JsonlFileWriter {
    type Writer = JsonlFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Initialize the global tracing subscriber.
///
/// With `log_file` set, events are written as JSONL to that file and, when
/// `also_stderr` is true, mirrored to stderr in compact form. Without a file
/// only the stderr layer is installed.
///
/// # Example
///
/// ```ignore
/// init_logging("info", Some(&paths.log_file()), true)?;
/// tracing::info!("Harvester started");
/// ```
pub fn init_logging(level: &str, log_file: Option<&Path>, also_stderr: bool) -> CoreResult<()> {
    let json_layer = match log_file {
        Some(path) => {
            let writer = JsonlFileWriter::open(path)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_target(true)
                    .with_writer(writer)
                    .with_filter(env_filter(level)),
            )
        }
        None => None,
    };

    let stderr_layer = (also_stderr || log_file.is_none()).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .compact()
            .with_writer(io::stderr)
            .with_filter(env_filter(level))
    });

    tracing_subscriber::registry()
        .with(json_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|e| CoreError::LoggingInit(e.to_string()))?;

    if let Some(path) = log_file {
        tracing::info!(log_path = %path.display(), "Logging initialized");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;

    #[test]
    fn test_jsonl_writer_creates_parent_dirs_and_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs").join("nested").join("harvest.jsonl");

        let mut writer = JsonlFileWriter::open(&path).unwrap();
        writer.write_all(b"{\"a\":1}\n").unwrap();

        let mut second = JsonlFileWriter::open(&path).unwrap();
        second.write_all(b"{\"b\":2}\n").unwrap();

        let mut content = String::new();
        File::open(&path)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "{\"a\":1}\n{\"b\":2}\n");
    }

    #[test]
    fn test_jsonl_writer_clones_share_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("harvest.jsonl");

        let writer = JsonlFileWriter::open(&path).unwrap();
        let mut a = writer.make_writer();
        let mut b = writer.make_writer();
        a.write_all(b"one\n").unwrap();
        b.write_all(b"two\n").unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
