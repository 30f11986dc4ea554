//! 可观测性：tracing 订阅器初始化
//!
//! RUST_LOG 优先；未设置时使用命令行给出的默认级别。日志写 stderr，stdout 留给运行结果。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 安装全局订阅器；重复调用（如测试中）静默忽略
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("planrun={default_level},warn")));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}
