//! 执行层：动作注册表、顺序执行引擎、内置动作

pub mod builtin;
pub mod engine;
pub mod registry;

pub use builtin::register_builtin;
pub use engine::ExecutionEngine;
pub use registry::{ActionHandler, ActionOutput, ActionRegistry};
