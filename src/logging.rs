use crate::config::LoggingConfig;
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use parking_lot::{const_mutex, Mutex};
use std::fs;
use std::path::Path;
use std::sync::Once;

const PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} - {l} - {t} - {m}{n}";

static INIT: Once = Once::new();
static INIT_RESULT: Mutex<Option<Result<(), String>>> = const_mutex(None);

pub fn parse_level(level: &str) -> LevelFilter {
    level.trim().parse().unwrap_or(LevelFilter::Info)
}

fn build_config(settings: &LoggingConfig, console: bool) -> Result<Config, String> {
    let level = parse_level(&settings.log_level);
    let mut builder = Config::builder();
    let mut root = Root::builder();

    if console {
        let stdout = ConsoleAppender::builder()
            .encoder(Box::new(PatternEncoder::new(PATTERN)))
            .build();
        builder = builder.appender(Appender::builder().build("console", Box::new(stdout)));
        root = root.appender("console");
    }

    if let Some(log_file) = &settings.log_file {
        let path = Path::new(log_file);
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| format!("Failed to create log directory: {}", e))?;
        }

        let logfile = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(PATTERN)))
            .append(true)
            .build(path)
            .map_err(|e| format!("Failed to create log file: {}", e))?;
        builder = builder.appender(Appender::builder().build("file", Box::new(logfile)));
        root = root.appender("file");
    }

    builder
        .build(root.build(level))
        .map_err(|e| format!("Failed to build log config: {}", e))
}

/// Install the global logger once; later calls return the first outcome.
pub fn setup_logging(settings: &LoggingConfig, console: bool) -> Result<(), Box<dyn std::error::Error>> {
    INIT.call_once(|| {
        let result = build_config(settings, console).and_then(|config| {
            log4rs::init_config(config)
                .map(|_| ())
                .map_err(|e| format!("Logging initialization failed: {}", e))
        });
        *INIT_RESULT.lock() = Some(result);
    });

    match INIT_RESULT.lock().as_ref() {
        Some(Ok(())) => Ok(()),
        Some(Err(msg)) => Err(msg.clone().into()),
        None => Err("Logging not initialized".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), LevelFilter::Debug);
        assert_eq!(parse_level(" WARN "), LevelFilter::Warn);
        assert_eq!(parse_level("chatty"), LevelFilter::Info);
    }

    #[test]
    fn test_build_config_creates_log_directory() {
        let dir = tempfile::tempdir().unwrap();
        let log_file = dir.path().join("nested").join("monitor.log");
        let settings = LoggingConfig {
            log_file: Some(log_file.to_string_lossy().into_owned()),
            log_level: "debug".to_string(),
        };

        build_config(&settings, true).unwrap();

        assert!(log_file.parent().unwrap().is_dir());
    }
}
