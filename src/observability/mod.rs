//! 可观测性：tracing 订阅器初始化
//!
//! 默认级别 info，可用 RUST_LOG 覆盖（如 `RUST_LOG=taskgate=debug`）。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}

/// 测试里多次调用也不会 panic
pub fn try_init_for_tests() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new("debug"))
        .with(fmt::layer().with_test_writer())
        .try_init();
}
