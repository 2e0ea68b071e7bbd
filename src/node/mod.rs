//! 两方节点：规划端 Orchestrator 与执行端 Connector
//!
//! 两者只通过 `Transport` 交换 `WireMessage`，各自以 actor 方式消费自己的收件箱。

pub mod connector;
pub mod orchestrator;

pub use connector::{spawn_connector, Connector};
pub use orchestrator::{spawn_orchestrator, ObjectiveOutcome, Orchestrator, Reply};
