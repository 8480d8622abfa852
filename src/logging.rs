//! Tracing setup for the binaries.
//!
//! Logs go to stderr by default so stdout stays free for command output.
//! With a log file, the previous files are rotated first and every line is
//! flushed as it is written.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "mcp_stdio=info,warn";

/// Rotated copies kept next to the log file.
const KEEP_ROTATED: u32 = 3;

/// Where and how to log.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Log file; `None` logs to stderr.
    pub file: Option<PathBuf>,
    /// Emit one JSON object per event.
    pub json: bool,
    /// `EnvFilter` directives used when `RUST_LOG` is unset.
    pub default_filter: String,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            file: None,
            json: false,
            default_filter: DEFAULT_FILTER.to_string(),
        }
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing(options: &LogOptions) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&options.default_filter));

    let (writer, ansi) = match options.file {
        Some(ref path) => (BoxMakeWriter::new(open_log_file(path)?), false),
        None => (
            BoxMakeWriter::new(std::io::stderr),
            std::io::stderr().is_terminal(),
        ),
    };

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(true)
        .with_thread_ids(false);

    let installed = if options.json {
        builder.json().try_init()
    } else {
        builder.with_ansi(ansi).try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    tracing::debug!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = ?options.file,
        pid = std::process::id(),
        "logging initialized"
    );
    Ok(())
}

fn open_log_file(path: &Path) -> anyhow::Result<FlushingWriter> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create log directory {}", dir.display()))?;
    }

    rotate_log_file(path, KEEP_ROTATED);

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    Ok(FlushingWriter::new(file))
}

/// Rotate log files: `x.log` → `x.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write.
///
/// Without explicit flushing, the last lines before a crash may never reach
/// the disk.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_rotate_shifts_and_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("mcp.log");
        let suffixed = |n: u32| PathBuf::from(format!("{}.{n}", base.display()));

        std::fs::write(&base, "current").unwrap();
        std::fs::write(suffixed(1), "one").unwrap();
        std::fs::write(suffixed(3), "three").unwrap();

        rotate_log_file(&base, 3);

        assert!(!base.exists());
        assert_eq!(std::fs::read_to_string(suffixed(1)).unwrap(), "current");
        assert_eq!(std::fs::read_to_string(suffixed(2)).unwrap(), "one");
        assert!(!suffixed(3).exists());
    }

    #[test]
    fn test_rotate_without_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("fresh.log");
        rotate_log_file(&base, 3);
        assert!(!base.exists());
    }

    #[test]
    fn test_open_log_file_creates_parents_and_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("client.log");

        let mut writer = open_log_file(&path).unwrap();
        writer.write_all(b"first line\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first line\n");
    }

    #[test]
    fn test_default_options_log_to_stderr() {
        let options = LogOptions::default();
        assert!(options.file.is_none());
        assert!(!options.json);
        assert_eq!(options.default_filter, DEFAULT_FILTER);
    }
}
