//! Logging setup.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable that overrides the log level.
pub const LOG_ENV: &str = "MOCKER_LOG";

/// Picks the effective level from `MOCKER_LOG`, `--debug` and `--log-level`,
/// in that order. `fatal` maps to `error` and `none` to `off`.
pub fn resolve_log_level(env: Option<&str>, debug: bool, cli: &str) -> String {
    if let Some(value) = env {
        match value.trim().to_ascii_lowercase().as_str() {
            level @ ("trace" | "debug" | "info" | "warn" | "error") => return level.to_string(),
            "fatal" => return "error".to_string(),
            "none" | "off" => return "off".to_string(),
            _ => {}
        }
    }

    if debug {
        "debug".to_string()
    } else {
        cli.to_string()
    }
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::new(format!(
        "mocker={level},mocker_app={level},mocker_proxy={level},mocker_core={level},warn"
    ))
}

/// Installs the global subscriber. Logs go to stdout and, when `log_dir` is
/// given, to a daily rotated file there. Keep the returned guard alive until
/// exit so buffered lines are flushed.
pub fn init_logging(level: &str, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = env_filter(level);

    if let Some(log_dir) = log_dir {
        if std::fs::create_dir_all(log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("mocker")
                .filename_suffix("log")
                .build(log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().with_writer(std::io::stdout))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::info!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }

        tracing_subscriber::fmt().with_env_filter(filter).init();
        tracing::warn!("File logging unavailable in {:?}, using console only", log_dir);
        return None;
    }

    tracing_subscriber::fmt().with_env_filter(filter).init();
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_cli() {
        assert_eq!(resolve_log_level(Some("warn"), true, "info"), "warn");
        assert_eq!(resolve_log_level(Some("DEBUG"), false, "info"), "debug");
    }

    #[test]
    fn env_aliases() {
        assert_eq!(resolve_log_level(Some("fatal"), false, "info"), "error");
        assert_eq!(resolve_log_level(Some("none"), false, "info"), "off");
    }

    #[test]
    fn falls_back_to_flags() {
        assert_eq!(resolve_log_level(None, false, "info"), "info");
        assert_eq!(resolve_log_level(None, true, "info"), "debug");
        assert_eq!(resolve_log_level(Some("loud"), false, "error"), "error");
    }

    #[test]
    fn filter_accepts_every_level() {
        for level in ["trace", "debug", "info", "warn", "error", "off"] {
            let filter = env_filter(level).to_string();
            assert!(filter.contains(&format!("mocker_proxy={}", level)));
        }
    }
}
