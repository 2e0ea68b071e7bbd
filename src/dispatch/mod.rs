//! 下发关联：在途下发表与结果回复格式化

pub mod correlator;
pub mod response;

pub use correlator::{DispatchCorrelator, OriginContext, PendingDispatch};
pub use response::{format_execution_result, format_rejection};
