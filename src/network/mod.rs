// 网络监测模块

mod metrics;
mod monitor;

pub use metrics::{ConnectionClass, ConnectionSample, NetworkMetrics};
pub use monitor::{ConnectionProbe, NetworkMonitor, StaticProbe};
