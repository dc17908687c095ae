use crate::config::{AppConfig, LogFormat};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

const LOG_FILE_NAME_PREFIX: &str = "proctrace.log";

/// 初始化全局日志。设置了 `log_directory` 时写入按天滚动的文件，否则写 stderr，
/// stdout 留给事件输出。返回的 guard 必须保持到退出
pub fn init_logging(
    config: &AppConfig,
) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error>> {
    // RUST_LOG 优先，其次配置文件
    let env_filter_str = std::env::var("RUST_LOG")
        .ok()
        .or_else(|| config.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    let env_filter = EnvFilter::try_new(&env_filter_str)
        .map_err(|e| format!("Failed to parse log filter '{}': {}", env_filter_str, e))?;

    let (writer, guard, ansi) = match &config.log_directory {
        Some(log_directory) => {
            let file_appender =
                tracing_appender::rolling::daily(log_directory, LOG_FILE_NAME_PREFIX);
            let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);
            (BoxMakeWriter::new(non_blocking_writer), Some(guard), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), None, true),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(writer);
    let result = match config.log_format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.with_ansi(ansi).try_init(),
    };
    result.map_err(|e| format!("Failed to initialize tracing subscriber: {}", e))?;

    match &config.log_directory {
        Some(dir) => tracing::info!("Logging system initialized. Log directory: {}", dir.display()),
        None => tracing::info!("Logging system initialized. Writing to stderr."),
    }
    tracing::info!("Log filter configured as '{}'", env_filter_str);

    Ok(guard)
}
