use crate::config::AppConfig;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::{EnvFilter, filter::Targets, fmt, prelude::*};

/// Target of the events operators settle by hand
pub const RECONCILE_TARGET: &str = "reconcile";

const RECONCILE_LOG_FILE: &str = "reconcile.log";

/// Flushes both log writers when dropped; hold it for the life of the process.
pub struct LogGuard {
    _service: WorkerGuard,
    _reconcile: WorkerGuard,
}

fn appender(rotation: &str, dir: &str, file: &str) -> RollingFileAppender {
    match rotation {
        "hourly" => tracing_appender::rolling::hourly(dir, file),
        "daily" => tracing_appender::rolling::daily(dir, file),
        _ => tracing_appender::rolling::never(dir, file),
    }
}

/// A bare level applies to this crate only, dependencies stay at `warn`.
/// Reconcile events pass whatever the level.
fn directives(log_level: &str) -> String {
    if log_level.contains('=') || log_level.contains(',') {
        format!("{},{}=error", log_level, RECONCILE_TARGET)
    } else {
        format!(
            "warn,{}={},{}=error",
            env!("CARGO_CRATE_NAME"),
            log_level,
            RECONCILE_TARGET
        )
    }
}

/// Install the global subscriber: the service log, stdout in text mode, and a
/// separate JSON file holding only reconcile events.
pub fn init_logging(config: &AppConfig) -> LogGuard {
    let (service_writer, service_guard) = tracing_appender::non_blocking(appender(
        &config.rotation,
        &config.log_dir,
        &config.log_file,
    ));
    let (reconcile_writer, reconcile_guard) = tracing_appender::non_blocking(appender(
        &config.rotation,
        &config.log_dir,
        RECONCILE_LOG_FILE,
    ));

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directives(&config.log_level)));

    let reconcile_layer = fmt::layer()
        .json()
        .with_writer(reconcile_writer)
        .with_ansi(false)
        .with_filter(Targets::new().with_target(RECONCILE_TARGET, Level::ERROR));

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(reconcile_layer);

    if config.use_json {
        let file_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_writer(service_writer)
            .with_ansi(false);
        registry.with(file_layer).init();
    } else {
        let file_layer = fmt::layer()
            .with_target(false)
            .with_writer(service_writer)
            .with_ansi(false);
        let stdout_layer = fmt::layer().with_target(false).with_ansi(true);
        registry.with(file_layer).with(stdout_layer).init();
    }

    LogGuard {
        _service: service_guard,
        _reconcile: reconcile_guard,
    }
}
