//! 规划前的入口过滤：回声、冷却、去重、在途上限

pub mod echo;

pub use echo::{clean_objective, emoji_count, EchoFilter, FilterRejection};
