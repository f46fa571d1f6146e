use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

pub const DEFAULT_LOG_PATH: &str = "logs/scene_forge.log";

/// Append-only engine log. Every line is also forwarded to the `log` facade
/// so console appenders configured by the binary see engine events too.
pub struct Logger {
    file: Mutex<Option<File>>,
    file_enabled: AtomicBool,
}

impl Logger {
    pub fn new(log_path: &str) -> std::io::Result<Self> {
        if let Some(parent) = Path::new(log_path).parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;

        Ok(Logger {
            file: Mutex::new(Some(file)),
            file_enabled: AtomicBool::new(true),
        })
    }

    /// Logger that only forwards to the `log` facade.
    pub fn console_only() -> Self {
        Logger {
            file: Mutex::new(None),
            file_enabled: AtomicBool::new(false),
        }
    }

    pub fn set_file_logging(&self, enabled: bool) {
        self.file_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn file_logging_enabled(&self) -> bool {
        self.file_enabled.load(Ordering::Relaxed)
    }

    pub fn log(&self, level: log::Level, category: &str, message: &str) {
        log::log!(target: "scene_forge", level, "[{category}] {message}");

        if !self.file_logging_enabled() {
            return;
        }

        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let line = format!("[{timestamp}] [{level}] [{category}] {message}\n");

        let mut guard = self.file.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(file) = guard.as_mut() {
            let _ = file.write_all(line.as_bytes());
            let _ = file.flush();
        }
    }

    pub fn debug(&self, category: &str, message: &str) {
        self.log(log::Level::Debug, category, message);
    }

    pub fn info(&self, category: &str, message: &str) {
        self.log(log::Level::Info, category, message);
    }

    pub fn warn(&self, category: &str, message: &str) {
        self.log(log::Level::Warn, category, message);
    }

    pub fn error(&self, category: &str, message: &str) {
        self.log(log::Level::Error, category, message);
    }
}

// Global logger instance. A read-only working directory degrades to
// console-only logging instead of aborting the process.
lazy_static::lazy_static! {
    pub static ref LOGGER: Logger = Logger::new(DEFAULT_LOG_PATH)
        .unwrap_or_else(|_| Logger::console_only());
}

// Engine event macros: `log_info!("registry", "loaded {}", group)`
#[macro_export]
macro_rules! log_debug {
    ($category:expr, $($arg:tt)*) => {
        $crate::web::logger::LOGGER.debug($category, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($category:expr, $($arg:tt)*) => {
        $crate::web::logger::LOGGER.info($category, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($category:expr, $($arg:tt)*) => {
        $crate::web::logger::LOGGER.warn($category, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($category:expr, $($arg:tt)*) => {
        $crate::web::logger::LOGGER.error($category, &format!($($arg)*))
    };
}

// Server-level macros, forwarded straight to the `log` facade
#[macro_export]
macro_rules! sys_debug {
    ($($arg:tt)*) => {
        ::log::debug!(target: "scene_forge::server", $($arg)*)
    };
}

#[macro_export]
macro_rules! sys_info {
    ($($arg:tt)*) => {
        ::log::info!(target: "scene_forge::server", $($arg)*)
    };
}

#[macro_export]
macro_rules! sys_warn {
    ($($arg:tt)*) => {
        ::log::warn!(target: "scene_forge::server", $($arg)*)
    };
}

#[macro_export]
macro_rules! sys_error {
    ($($arg:tt)*) => {
        ::log::error!(target: "scene_forge::server", $($arg)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_category_and_level() {
        let path = std::env::temp_dir()
            .join(format!("scene_forge_log_{}", uuid::Uuid::new_v4()))
            .join("engine.log");
        let path_str = path.to_string_lossy().to_string();
        let logger = Logger::new(&path_str).unwrap();

        logger.info("registry", "segmentation resident");
        logger.warn("loader", "falling back");

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("[INFO] [registry] segmentation resident"));
        assert!(contents.contains("[WARN] [loader] falling back"));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn disabled_file_logging_writes_nothing() {
        let path = std::env::temp_dir()
            .join(format!("scene_forge_log_{}.log", uuid::Uuid::new_v4()));
        let path_str = path.to_string_lossy().to_string();
        let logger = Logger::new(&path_str).unwrap();
        logger.set_file_logging(false);

        logger.error("task", "never written");

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.is_empty());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn console_only_logger_is_silent_on_disk() {
        let logger = Logger::console_only();
        assert!(!logger.file_logging_enabled());
        logger.info("task", "no file attached");
    }
}
