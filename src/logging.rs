use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// 初始化 tracing 日志（默认 INFO，可由 `RUST_LOG` 覆盖）
///
/// 重复调用是安全的：宿主应用已安装全局 subscriber 时直接返回。
pub fn init_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok()
    {
        tracing::info!("[Logging] tracing subscriber initialized");
    }
}
