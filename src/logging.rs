//! 日志初始化
//!
//! 控制台 + 可选文件输出。文件按启动时间命名、按大小滚动，启动时清理过期文件：
//! `facility-upload.YYYY-MM-DD-HHMMSS.log`、`facility-upload.YYYY-MM-DD-HHMMSS_N.log`

use crate::config::LogConfig;
use chrono::{Local, NaiveDate};
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

const LOG_FILE_PREFIX: &str = "facility-upload.";
const LOG_FILE_SUFFIX: &str = ".log";
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

struct RollingFile {
    start_timestamp: String,
    log_dir: PathBuf,
    file: Option<File>,
    /// 0 为基础文件，之后每次滚动 +1
    index: u32,
    max_file_size: u64,
    written: u64,
}

impl RollingFile {
    fn open(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        let mut rolling = Self {
            start_timestamp: Local::now().format("%Y-%m-%d-%H%M%S").to_string(),
            log_dir,
            file: None,
            index: 0,
            max_file_size: max_file_size.max(1),
            written: 0,
        };
        rolling.open_current()?;
        Ok(rolling)
    }

    fn path_for(&self, index: u32) -> PathBuf {
        let name = if index == 0 {
            format!("{}{}{}", LOG_FILE_PREFIX, self.start_timestamp, LOG_FILE_SUFFIX)
        } else {
            format!(
                "{}{}_{}{}",
                LOG_FILE_PREFIX, self.start_timestamp, index, LOG_FILE_SUFFIX
            )
        };
        self.log_dir.join(name)
    }

    fn open_current(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(self.index))?;
        self.file = Some(file);
        self.written = 0;
        Ok(())
    }

    fn write_record(&mut self, buf: &[u8]) -> io::Result<usize> {
        // 空文件不滚动，单条超长记录直接写入
        if self.written > 0 && self.written + buf.len() as u64 > self.max_file_size {
            if let Some(mut file) = self.file.take() {
                file.flush()?;
            }
            self.index += 1;
            self.open_current()?;
        }

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "日志文件未打开"))?;
        let n = file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// 按大小滚动的日志写入器
#[derive(Clone)]
pub struct LogFileManager {
    inner: Arc<Mutex<RollingFile>>,
}

impl LogFileManager {
    pub fn new(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        Ok(Self {
            inner: Arc::new(Mutex::new(RollingFile::open(log_dir, max_file_size)?)),
        })
    }

    pub fn current_path(&self) -> PathBuf {
        let inner = self.inner.lock();
        inner.path_for(inner.index)
    }
}

impl Write for LogFileManager {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().write_record(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().flush()
    }
}

/// 日志守卫，释放后文件写入线程退出
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化全局日志
///
/// 文件输出初始化失败时退回到仅控制台输出
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .with_ansi(true);

    let file_manager = if config.enabled {
        fs::create_dir_all(&config.log_dir)
            .and_then(|_| LogFileManager::new(config.log_dir.clone(), config.max_file_size))
            .map_err(|e| {
                eprintln!(
                    "日志文件初始化失败: {:?}, 错误: {}, 仅输出到控制台",
                    config.log_dir, e
                )
            })
            .ok()
    } else {
        None
    };

    let Some(file_manager) = file_manager else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();
        info!("日志系统初始化完成（仅控制台输出）");
        return LogGuard { _file_guard: None };
    };

    let (non_blocking, file_guard) = tracing_appender::non_blocking(file_manager);
    let file_layer = fmt::layer()
        .with_target(true)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .with_ansi(false)
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!(
        "日志系统初始化完成: 目录={:?}, 级别={}, 保留 {} 天, 单文件最大 {:.1}MB",
        config.log_dir,
        config.level,
        config.retention_days,
        config.max_file_size as f64 / 1024.0 / 1024.0
    );

    let removed = cleanup_old_logs(&config.log_dir, config.retention_days, Local::now().date_naive());
    if removed > 0 {
        info!("已清理 {} 个过期日志文件", removed);
    }

    LogGuard {
        _file_guard: Some(file_guard),
    }
}

/// 删除超过保留天数的日志文件，返回删除数量
///
/// 优先使用文件名中的日期，解析失败时使用修改时间
fn cleanup_old_logs(log_dir: &Path, retention_days: u32, today: NaiveDate) -> usize {
    let retention = chrono::Duration::days(retention_days as i64);

    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !path.is_file() || !name.starts_with(LOG_FILE_PREFIX) || !name.ends_with(LOG_FILE_SUFFIX)
        {
            continue;
        }

        let expired = match date_from_file_name(name) {
            Some(date) => today.signed_duration_since(date) > retention,
            None => modified_before(&entry, retention),
        };
        if !expired {
            continue;
        }

        match fs::remove_file(&path) {
            Ok(()) => {
                removed += 1;
                debug!("已删除过期日志文件: {:?}", path);
            }
            Err(e) => warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e),
        }
    }
    removed
}

/// `facility-upload.YYYY-MM-DD[-HHMMSS[_N]].log` -> 日期
fn date_from_file_name(name: &str) -> Option<NaiveDate> {
    let stem = name
        .strip_prefix(LOG_FILE_PREFIX)?
        .strip_suffix(LOG_FILE_SUFFIX)?;
    let date = stem.get(..10)?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
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
