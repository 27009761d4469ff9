//! 公共模块
//!
//! 提供上传器内部使用的通用组件

mod speed_meter;
mod stall_detector;

pub use speed_meter::{SpeedMeter, SpeedMeterConfig};
pub use stall_detector::StallDetector;
