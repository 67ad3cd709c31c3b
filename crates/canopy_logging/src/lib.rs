//! Shared logging setup for the Canopy binaries.
//!
//! Every binary logs to stderr and to `<log dir>/<app>.log`. The file is
//! capped in size; full files are shifted to numbered generations
//! (`app.log.1` is the most recent) and the oldest generation is dropped.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Filter used when neither `CANOPY_LOG` nor `RUST_LOG` is set.
pub const DEFAULT_LOG_FILTER: &str =
    "canopy_sentinel=info,canopy_worker=info,canopy_state_store=info,canopy_db=warn";

/// Environment variable checked before `RUST_LOG`.
pub const LOG_FILTER_ENV: &str = "CANOPY_LOG";

/// How large a log file may grow and how many generations are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    pub max_bytes: u64,
    /// Including the live file.
    pub generations: usize,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024,
            generations: 5,
        }
    }
}

/// Logging configuration shared by Canopy binaries.
#[derive(Debug, Clone, Default)]
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    /// Console at `debug` regardless of the env filter.
    pub verbose: bool,
    /// Overrides `$CANOPY_HOME/logs`.
    pub log_dir: Option<PathBuf>,
    pub rotation: RotationPolicy,
}

/// Install the global subscriber.
///
/// Fails if a subscriber is already installed or the log directory cannot
/// be created.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = match config.log_dir {
        Some(dir) => dir,
        None => logs_dir()?,
    };
    let file = SizeCappedLog::open(&log_dir, config.app_name, config.rotation)
        .with_context(|| format!("Failed to open log file in {}", log_dir.display()))?;

    let console_filter = if config.verbose {
        EnvFilter::new("debug")
    } else {
        env_filter()
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(SharedLog::new(file))
                .with_ansi(false)
                .with_target(true)
                .with_filter(env_filter()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_filter(console_filter),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_FILTER_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Canopy home directory: `$CANOPY_HOME` or `~/.canopy`.
pub fn canopy_home() -> Result<PathBuf> {
    if let Some(home) = std::env::var_os("CANOPY_HOME") {
        return Ok(PathBuf::from(home));
    }
    let home = dirs::home_dir().context("Could not determine home directory; set CANOPY_HOME")?;
    Ok(home.join(".canopy"))
}

pub fn logs_dir() -> Result<PathBuf> {
    Ok(canopy_home()?.join("logs"))
}

/// One log file with a byte cap.
struct SizeCappedLog {
    live: PathBuf,
    policy: RotationPolicy,
    file: File,
    written: u64,
}

impl SizeCappedLog {
    fn open(dir: &Path, app_name: &str, policy: RotationPolicy) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let live = dir.join(format!("{}.log", file_stem(app_name)));
        let file = append_to(&live)?;
        let written = file.metadata()?.len();
        let mut log = Self {
            live,
            policy,
            file,
            written,
        };
        if log.written >= log.policy.max_bytes {
            log.roll()?;
        }
        Ok(log)
    }

    fn generation(&self, n: usize) -> PathBuf {
        let mut name = self.live.clone().into_os_string();
        name.push(format!(".{}", n));
        PathBuf::from(name)
    }

    fn roll(&mut self) -> io::Result<()> {
        self.file.flush()?;
        let oldest = self.policy.generations.saturating_sub(1);
        if oldest == 0 {
            // Single generation: truncate in place.
            self.file = OpenOptions::new()
                .write(true)
                .truncate(true)
                .open(&self.live)?;
            self.written = 0;
            return Ok(());
        }

        match fs::remove_file(self.generation(oldest)) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err),
            _ => {}
        }
        for n in (1..oldest).rev() {
            let from = self.generation(n);
            if from.exists() {
                fs::rename(&from, self.generation(n + 1))?;
            }
        }
        fs::rename(&self.live, self.generation(1))?;

        self.file = append_to(&self.live)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for SizeCappedLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.policy.max_bytes {
            self.roll()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn append_to(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// `MakeWriter` handing out a locked view of the shared file per event.
#[derive(Clone)]
struct SharedLog(Arc<Mutex<SizeCappedLog>>);

impl SharedLog {
    fn new(log: SizeCappedLog) -> Self {
        Self(Arc::new(Mutex::new(log)))
    }
}

struct LockedLog<'a>(MutexGuard<'a, SizeCappedLog>);

impl<'a> MakeWriter<'a> for SharedLog {
    type Writer = LockedLog<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        // A panic while holding the lock only loses that one line.
        LockedLog(self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }
}

impl Write for LockedLog<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

/// Worker names carry `@` and host names; keep file names portable.
fn file_stem(app_name: &str) -> String {
    let stem: String = app_name
        .chars()
        .map(|ch| match ch {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => ch,
            _ => '_',
        })
        .collect();
    if stem.is_empty() {
        "canopy".to_string()
    } else {
        stem
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn policy(max_bytes: u64, generations: usize) -> RotationPolicy {
        RotationPolicy {
            max_bytes,
            generations,
        }
    }

    #[test]
    fn test_rolls_once_cap_is_reached() {
        let tmp = TempDir::new().unwrap();
        let mut log = SizeCappedLog::open(tmp.path(), "canopy-worker", policy(16, 3)).unwrap();
        log.write_all(b"0123456789").unwrap();
        log.write_all(b"0123456789").unwrap();
        log.flush().unwrap();

        let live = fs::read(tmp.path().join("canopy-worker.log")).unwrap();
        let previous = fs::read(tmp.path().join("canopy-worker.log.1")).unwrap();
        assert_eq!(live, b"0123456789");
        assert_eq!(previous, b"0123456789");
    }

    #[test]
    fn test_oldest_generation_is_dropped() {
        let tmp = TempDir::new().unwrap();
        let mut log = SizeCappedLog::open(tmp.path(), "sentinel", policy(4, 2)).unwrap();
        for line in [b"aaaa", b"bbbb", b"cccc"] {
            log.write_all(line).unwrap();
        }
        log.flush().unwrap();

        assert_eq!(fs::read(tmp.path().join("sentinel.log")).unwrap(), b"cccc");
        assert_eq!(fs::read(tmp.path().join("sentinel.log.1")).unwrap(), b"bbbb");
        assert!(!tmp.path().join("sentinel.log.2").exists());
    }

    #[test]
    fn test_single_generation_truncates() {
        let tmp = TempDir::new().unwrap();
        let mut log = SizeCappedLog::open(tmp.path(), "solo", policy(4, 1)).unwrap();
        log.write_all(b"aaaa").unwrap();
        log.write_all(b"bb").unwrap();
        log.flush().unwrap();

        assert_eq!(fs::read(tmp.path().join("solo.log")).unwrap(), b"bb");
        assert!(!tmp.path().join("solo.log.1").exists());
    }

    #[test]
    fn test_reopen_over_cap_rolls_immediately() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("app.log"), b"old contents").unwrap();

        let _log = SizeCappedLog::open(tmp.path(), "app", policy(4, 3)).unwrap();
        assert_eq!(fs::read(tmp.path().join("app.log.1")).unwrap(), b"old contents");
        assert_eq!(fs::read(tmp.path().join("app.log")).unwrap(), b"");
    }

    #[test]
    fn test_file_stem_is_portable() {
        assert_eq!(file_stem("echo@host/1"), "echo_host_1");
        assert_eq!(file_stem(""), "canopy");
    }
}
