//! 日志初始化
//!
//! 控制台 + 文件双输出，文件按大小滚动，启动时清理超过保留天数的旧日志

use crate::config::LogConfig;
use chrono::Local;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 日志文件名前缀
const LOG_PREFIX: &str = "obs-multipart.";
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// 按大小滚动的日志文件
///
/// 文件名: obs-multipart.YYYY-MM-DD-HHMMSS[_N].log
struct RollingFile {
    log_dir: PathBuf,
    started_at: String,
    index: u32,
    max_file_size: u64,
    written: u64,
    file: File,
}

impl RollingFile {
    fn open(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        let started_at = Local::now().format("%Y-%m-%d-%H%M%S").to_string();
        let file = Self::open_file(&log_dir, &started_at, 0)?;
        Ok(Self {
            log_dir,
            started_at,
            index: 0,
            max_file_size,
            written: 0,
            file,
        })
    }

    fn file_path(log_dir: &Path, started_at: &str, index: u32) -> PathBuf {
        if index == 0 {
            log_dir.join(format!("{}{}.log", LOG_PREFIX, started_at))
        } else {
            log_dir.join(format!("{}{}_{}.log", LOG_PREFIX, started_at, index))
        }
    }

    fn open_file(log_dir: &Path, started_at: &str, index: u32) -> io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(Self::file_path(log_dir, started_at, index))
    }

    fn write_chunk(&mut self, buf: &[u8]) -> io::Result<usize> {
        // 空文件不滚动，避免单条超大日志反复建文件
        if self.written > 0 && self.written + buf.len() as u64 > self.max_file_size {
            self.file.flush()?;
            self.index += 1;
            self.file = Self::open_file(&self.log_dir, &self.started_at, self.index)?;
            self.written = 0;
        }

        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }
}

/// 线程安全的日志写入器
#[derive(Clone)]
pub struct RollingWriter {
    inner: Arc<Mutex<RollingFile>>,
}

impl RollingWriter {
    pub fn new(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        Ok(Self {
            inner: Arc::new(Mutex::new(RollingFile::open(log_dir, max_file_size)?)),
        })
    }
}

impl Write for RollingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().write_chunk(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().file.flush()
    }
}

/// 日志守卫，drop 时刷新文件日志
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化日志
///
/// RUST_LOG 优先于配置中的级别；重复初始化时忽略
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .with_writer(io::stderr);

    let writer = if config.enabled {
        fs::create_dir_all(&config.log_dir)
            .and_then(|_| RollingWriter::new(config.log_dir.clone(), config.max_file_size))
            .map_err(|e| eprintln!("日志文件不可用: {:?}, 仅输出到控制台: {}", config.log_dir, e))
            .ok()
    } else {
        None
    };

    let Some(writer) = writer else {
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .try_init();
        debug!("日志初始化完成（仅控制台）");
        return LogGuard { _file_guard: None };
    };

    let (non_blocking, file_guard) = tracing_appender::non_blocking(writer);
    let file_layer = fmt::layer()
        .with_target(true)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .with_ansi(false)
        .with_writer(non_blocking);

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    info!(
        "日志初始化完成: 目录={:?}, 级别={}, 保留{}天, 单文件上限={:.1}MB",
        config.log_dir,
        config.level,
        config.retention_days,
        config.max_file_size as f64 / 1024.0 / 1024.0
    );

    let removed = cleanup_old_logs(&config.log_dir, config.retention_days);
    if removed > 0 {
        info!("已清理 {} 个过期日志文件", removed);
    }

    LogGuard {
        _file_guard: Some(file_guard),
    }
}

/// 删除超过保留天数的日志文件，返回删除数量
///
/// 日期取自文件名，取不到时按修改时间判断
fn cleanup_old_logs(log_dir: &Path, retention_days: u32) -> usize {
    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return 0;
        }
    };

    let retention = chrono::Duration::days(retention_days as i64);
    let today = Local::now().date_naive();
    let mut removed = 0;

    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if !path.is_file() || !name.starts_with(LOG_PREFIX) || !name.ends_with(".log") {
            continue;
        }

        let expired = match date_from_filename(name) {
            Some(date) => today.signed_duration_since(date) > retention,
            None => modified_before(&entry, retention),
        };

        if expired {
            match fs::remove_file(&path) {
                Ok(()) => {
                    removed += 1;
                    debug!("已删除过期日志: {:?}", path);
                }
                Err(e) => warn!("删除过期日志失败: {:?}, 错误: {}", path, e),
            }
        }
    }

    removed
}

fn date_from_filename(name: &str) -> Option<chrono::NaiveDate> {
    let stem = name.strip_prefix(LOG_PREFIX)?.strip_suffix(".log")?;
    let date = stem.get(..10)?;
    chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

fn modified_before(entry: &fs::DirEntry, retention: chrono::Duration) -> bool {
    entry
        .metadata()
        .and_then(|m| m.modified())
        .map(|modified| {
            let modified: chrono::DateTime<chrono::Utc> = modified.into();
            chrono::Utc::now().signed_duration_since(modified) > retention
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn log_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .flatten()
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_date_from_filename() {
        let date = chrono::NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(date_from_filename("obs-multipart.2024-03-09-101500.log"), Some(date));
        assert_eq!(date_from_filename("obs-multipart.2024-03-09-101500_2.log"), Some(date));
        assert_eq!(date_from_filename("obs-multipart.latest.log"), None);
        assert_eq!(date_from_filename("other.2024-03-09.log"), None);
    }

    #[test]
    fn test_rolling_writer_rotates() {
        let dir = TempDir::new().unwrap();
        let mut writer = RollingWriter::new(dir.path().to_path_buf(), 16).unwrap();

        writer.write_all(b"0123456789").unwrap();
        writer.write_all(b"0123456789").unwrap();
        writer.write_all(b"01234").unwrap();
        writer.flush().unwrap();

        let files = log_files(dir.path());
        assert_eq!(files.len(), 2);
        assert!(files.iter().any(|f| f.ends_with("_1.log")));
    }

    #[test]
    fn test_cleanup_old_logs() {
        let dir = TempDir::new().unwrap();
        let old = format!("{}2000-01-01-000000.log", LOG_PREFIX);
        let fresh = format!("{}{}.log", LOG_PREFIX, Local::now().format("%Y-%m-%d-%H%M%S"));
        fs::write(dir.path().join(&old), b"old").unwrap();
        fs::write(dir.path().join(&fresh), b"new").unwrap();
        fs::write(dir.path().join("unrelated.txt"), b"keep").unwrap();

        assert_eq!(cleanup_old_logs(dir.path(), 7), 1);
        let files = log_files(dir.path());
        assert!(!files.contains(&old));
        assert!(files.contains(&fresh));
        assert!(files.contains(&"unrelated.txt".to_string()));
    }
}
