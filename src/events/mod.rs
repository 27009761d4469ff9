//! 事件模块
//!
//! - `types.rs`: 队列事件类型（带标签的枚举，可穷尽匹配）
//! - `bus.rs`: 发布/订阅总线
//! - `throttle.rs`: 进度事件节流

mod bus;
mod throttle;
mod types;

pub use bus::{EventBus, EventHandler, SubscriptionId};
pub use throttle::*;
pub use types::*;
