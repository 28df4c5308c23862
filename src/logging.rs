use tracing::Level;
use tracing_subscriber::{
    filter::Targets,
    fmt::{
        self,
        format::{Format, Full},
        time::SystemTime,
    },
    prelude::*,
};

const LOG_FILE_NAME: &str = "qbo-connect.log";

fn build_base_log_format() -> Format<Full, SystemTime> {
    fmt::format()
        .with_level(true)
        .with_ansi(false)
        .with_file(true)
        .with_target(true)
        .with_thread_names(true)
}

fn build_filter() -> Targets {
    Targets::new()
        .with_target("sqlx", Level::INFO)
        .with_target("hyper_util", Level::INFO)
        .with_target("reqwest", Level::INFO)
        .with_target("h2", Level::INFO)
        .with_default(Level::DEBUG)
}

/// Logs to stdout, and when `base_log_dir` is set also to daily files: plain
/// text at the top level and JSON under `structured/`.
pub fn setup_logging(base_log_dir: &str) {
    let stdout_layer =
        tracing_subscriber::fmt::layer().event_format(build_base_log_format().with_ansi(true));

    let subscriber = tracing_subscriber::registry()
        .with(build_filter())
        .with(stdout_layer);

    if base_log_dir.is_empty() {
        subscriber.init();
        return;
    }

    let log_file_layer = tracing_subscriber::fmt::layer()
        .event_format(build_base_log_format())
        .with_writer(tracing_appender::rolling::daily(base_log_dir, LOG_FILE_NAME));
    let json_file_layer = tracing_subscriber::fmt::layer()
        .event_format(build_base_log_format().json())
        .with_writer(tracing_appender::rolling::daily(
            format!("{}/structured", base_log_dir),
            LOG_FILE_NAME,
        ));
    subscriber.with(log_file_layer).with(json_file_layer).init();
}
