//! Logging setup: per-target console levels, optional rotating JSON files.

use crate::config::{LoggingConfig, Section};
use file_rotate::{
    compression::Compression,
    suffix::{AppendTimestamp, FileLimit},
    ContentLimit, FileRotate,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer, Registry};

const DEFAULT_SECTION: &str = "default";
const DEFAULT_MAX_SIZE_MB: u64 = 100;

// Flushes the non-blocking console writer; must outlive the subscriber.
static CONSOLE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// `None` means the sink is off for that target.
fn parse_level(s: &str) -> Option<LevelFilter> {
    match s.trim().to_ascii_lowercase().as_str() {
        "trace" => Some(LevelFilter::TRACE),
        "debug" => Some(LevelFilter::DEBUG),
        "info" | "" => Some(LevelFilter::INFO),
        "warn" => Some(LevelFilter::WARN),
        "error" => Some(LevelFilter::ERROR),
        "off" | "none" => None,
        other => {
            eprintln!("Unknown log level '{other}', using info");
            Some(LevelFilter::INFO)
        }
    }
}

/// True if `target` is `prefix` or a module below it.
fn matches_target_prefix(target: &str, prefix: &str) -> bool {
    target
        .strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
}

// ================= rotating files =================

type RotatingFile = Arc<Mutex<FileRotate<AppendTimestamp>>>;

fn open_rotating_file(path: &Path, section: &Section) -> std::io::Result<RotatingFile> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // Backup count wins over age when both are set.
    let limit = match section.max_backups {
        Some(n) => FileLimit::MaxFiles(n),
        None => FileLimit::Age(chrono::Duration::days(
            i64::from(section.max_age_days.unwrap_or(1)),
        )),
    };
    let max_bytes = section.max_size_mb.unwrap_or(DEFAULT_MAX_SIZE_MB) * 1024 * 1024;
    let rotate = FileRotate::new(
        path,
        AppendTimestamp::default(limit),
        ContentLimit::BytesSurpassed(usize::try_from(max_bytes).unwrap_or(usize::MAX)),
        Compression::None,
        None,
    );
    Ok(Arc::new(Mutex::new(rotate)))
}

/// Writer for one record; drops the bytes when no file matches its target.
struct FileHandle(Option<RotatingFile>);

impl Write for FileHandle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &self.0 {
            Some(file) => file.lock().write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &self.0 {
            Some(file) => file.lock().flush(),
            None => Ok(()),
        }
    }
}

/// Routes records to files by target prefix, longest prefix first.
#[derive(Clone, Default)]
struct FileRouter {
    default: Option<RotatingFile>,
    by_prefix: Vec<(String, RotatingFile)>,
}

impl FileRouter {
    fn build(cfg: &LoggingConfig, base_dir: &Path) -> Self {
        let mut router = FileRouter::default();
        for (name, section) in cfg {
            if section.file.trim().is_empty() {
                continue;
            }
            let path = resolve_log_path(&section.file, base_dir);
            let file = match open_rotating_file(&path, section) {
                Ok(file) => file,
                Err(e) => {
                    eprintln!("Failed to open log file '{}' for '{name}': {e}", path.display());
                    continue;
                }
            };
            if name == DEFAULT_SECTION {
                router.default = Some(file);
            } else {
                router.by_prefix.push((name.clone(), file));
            }
        }
        router
            .by_prefix
            .sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        router
    }

    fn resolve(&self, target: &str) -> Option<RotatingFile> {
        self.by_prefix
            .iter()
            .find(|(prefix, _)| matches_target_prefix(target, prefix))
            .map(|(_, file)| file)
            .or(self.default.as_ref())
            .cloned()
    }

    fn is_empty(&self) -> bool {
        self.default.is_none() && self.by_prefix.is_empty()
    }
}

impl<'a> fmt::MakeWriter<'a> for FileRouter {
    type Writer = FileHandle;

    fn make_writer(&'a self) -> Self::Writer {
        FileHandle(self.default.clone())
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        FileHandle(self.resolve(meta.target()))
    }
}

fn resolve_log_path(file: &str, base_dir: &Path) -> PathBuf {
    let path = Path::new(file);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

// ================= level filters =================

fn sections(cfg: &LoggingConfig) -> (Option<&Section>, BTreeMap<&str, &Section>) {
    let named = cfg
        .iter()
        .filter(|(name, _)| name.as_str() != DEFAULT_SECTION)
        .map(|(name, section)| (name.as_str(), section))
        .collect();
    (cfg.get(DEFAULT_SECTION), named)
}

fn console_targets(cfg: &LoggingConfig) -> Targets {
    let (default, named) = sections(cfg);
    let default_level = default.map_or(Some(LevelFilter::INFO), |s| parse_level(&s.console_level));
    let mut targets = Targets::new().with_default(default_level.unwrap_or(LevelFilter::OFF));
    for (name, section) in named {
        targets = targets.with_target(name, parse_level(&section.console_level).unwrap_or(LevelFilter::OFF));
    }
    targets
}

/// A target only logs to file when its own section, or the default one, names a file.
fn file_targets(cfg: &LoggingConfig) -> Targets {
    let (default, named) = sections(cfg);
    let default_level = default
        .filter(|s| !s.file.trim().is_empty())
        .and_then(|s| parse_level(&s.file_level))
        .unwrap_or(LevelFilter::OFF);
    let mut targets = Targets::new().with_default(default_level);
    for (name, section) in named {
        if section.file.trim().is_empty() {
            continue;
        }
        targets = targets.with_target(name, parse_level(&section.file_level).unwrap_or(LevelFilter::OFF));
    }
    targets
}

// ================= init =================

/// Installs the global subscriber; a no-op when one is already installed.
///
/// `RUST_LOG`, when set, caps every sink on top of the configured levels.
pub fn init_logging(cfg: &LoggingConfig, base_dir: &Path) {
    // Bridge `log` → `tracing` before installing the subscriber
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("LogTracer init skipped: {e}");
    }

    let env = EnvFilter::try_from_default_env().ok();

    let (console, guard) = tracing_appender::non_blocking(std::io::stderr());
    let _ = CONSOLE_GUARD.set(guard);
    let console_layer = fmt::layer()
        .with_writer(console)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_filter(console_targets(cfg));

    let router = FileRouter::build(cfg, base_dir);
    let file_layer = (!router.is_empty()).then(|| {
        fmt::layer()
            .json()
            .with_ansi(false)
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(router)
            .with_filter(file_targets(cfg))
    });

    let subscriber = Registry::default()
        .with(env)
        .with(console_layer)
        .with(file_layer);
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Tracing subscriber not installed: {e}");
    }
}
