//! 核心：错误类型与优雅关闭

pub mod error;
pub mod shutdown;

pub use error::{
    CorrelationError, ExecutionError, GateError, PairingError, PolicyViolation, RejectReason,
    SignatureError,
};
pub use shutdown::{run_with_graceful_shutdown, ShutdownManager, ShutdownReason};
