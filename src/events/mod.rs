//! 事件模块
//!
//! - `types.rs`: 通知类型与队列统计
//! - `throttle.rs`: 进度通知节流
//! - `bus.rs`: 任务 / 全局监听者注册与分发

mod bus;
mod throttle;
mod types;

pub use bus::*;
pub use throttle::*;
pub use types::*;
