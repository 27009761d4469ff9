// 网络监测器
//
// - 平台有变化通知时调用 notify_change() 立即采样
// - 没有变化通知的平台依靠定时兜底采样
// - 采样失败时保留上一次快照，只记录调试日志
// - 快照变化时发布 NetworkChanged 事件

use super::{ConnectionClass, ConnectionSample, NetworkMetrics};
use crate::events::{EventBus, QueueEvent};
use anyhow::Result;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 平台连接信息来源
///
/// 实现必须是非阻塞的：只读取平台已缓存的连接信息，不做主动测速
pub trait ConnectionProbe: Send + Sync {
    fn sample(&self) -> Result<ConnectionSample>;
}

/// 手动设置的连接信息（CLI 与测试使用）
#[derive(Debug)]
pub struct StaticProbe {
    sample: Mutex<Option<ConnectionSample>>,
}

impl StaticProbe {
    pub fn new(class: ConnectionClass) -> Self {
        Self {
            sample: Mutex::new(Some(ConnectionSample::of_class(class))),
        }
    }

    pub fn set(&self, sample: ConnectionSample) {
        *self.sample.lock() = Some(sample);
    }

    pub fn set_class(&self, class: ConnectionClass) {
        self.set(ConnectionSample::of_class(class));
    }

    /// 模拟平台暂时无法提供连接信息
    pub fn set_unavailable(&self) {
        *self.sample.lock() = None;
    }
}

impl ConnectionProbe for StaticProbe {
    fn sample(&self) -> Result<ConnectionSample> {
        self.sample
            .lock()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("连接信息不可用"))
    }
}

/// 网络监测器
pub struct NetworkMonitor {
    probe: Arc<dyn ConnectionProbe>,
    current: ArcSwap<NetworkMetrics>,
    events: EventBus,
    cancel: CancellationToken,
}

impl std::fmt::Debug for NetworkMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkMonitor")
            .field("current", &self.current.load())
            .finish()
    }
}

impl NetworkMonitor {
    /// 创建监测器并立即采样一次（失败时以 Unknown 起步）
    pub fn new(probe: Arc<dyn ConnectionProbe>, events: EventBus) -> Self {
        let initial = match probe.sample() {
            Ok(sample) => NetworkMetrics::from_sample(sample),
            Err(e) => {
                debug!("初始网络采样失败，使用 Unknown: {}", e);
                NetworkMetrics::unknown()
            }
        };
        info!("网络监测器已创建: 初始连接类型 {:?}", initial.class);

        Self {
            probe,
            current: ArcSwap::from_pointee(initial),
            events,
            cancel: CancellationToken::new(),
        }
    }

    /// 当前网络快照
    pub fn current(&self) -> Arc<NetworkMetrics> {
        self.current.load_full()
    }

    /// 采样一次
    ///
    /// # 返回
    /// 网络状况是否发生变化
    pub fn sample(&self) -> bool {
        let sample = match self.probe.sample() {
            Ok(sample) => sample,
            Err(e) => {
                debug!("网络采样失败，保留上一次快照: {}", e);
                return false;
            }
        };

        let next = Arc::new(NetworkMetrics::from_sample(sample));
        let previous = self.current.swap(next.clone());

        if previous.same_conditions(&next) {
            return false;
        }

        info!(
            "📶 网络状况变化: {:?} -> {:?} (下行: {:?} Mbps, RTT: {:?} ms, 省流量: {})",
            previous.class, next.class, next.downlink_mbps, next.rtt_ms, next.save_data
        );
        self.events.emit(QueueEvent::NetworkChanged {
            metrics: (*next).clone(),
        });
        true
    }

    /// 平台连接变化通知入口
    pub fn notify_change(&self) -> bool {
        self.sample()
    }

    /// 启动兜底定时采样
    pub fn start(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let cancel = self.cancel.clone();
        info!("网络兜底采样已启动: 间隔 {:?}", interval);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // 第一次 tick 立即返回，创建时已经采样过
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        monitor.sample();
                    }
                }
            }
            debug!("网络兜底采样已停止");
        })
    }

    /// 停止定时采样
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}
