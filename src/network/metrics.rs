// 网络状况快照

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 连接类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionClass {
    /// 离线
    Offline,
    /// 极慢 2G
    #[serde(rename = "slow_2g")]
    Slow2g,
    #[serde(rename = "2g")]
    TwoG,
    #[serde(rename = "3g")]
    ThreeG,
    #[serde(rename = "4g")]
    FourG,
    /// 有线 / Wi-Fi 宽带
    Broadband,
    /// 平台无法提供连接信息
    #[default]
    Unknown,
}

impl ConnectionClass {
    /// 从平台的 effectiveType 字符串解析（slow-2g / 2g / 3g / 4g）
    pub fn from_effective_type(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "offline" | "none" => ConnectionClass::Offline,
            "slow-2g" | "slow_2g" => ConnectionClass::Slow2g,
            "2g" => ConnectionClass::TwoG,
            "3g" => ConnectionClass::ThreeG,
            "4g" => ConnectionClass::FourG,
            "ethernet" | "wifi" | "broadband" | "5g" => ConnectionClass::Broadband,
            _ => ConnectionClass::Unknown,
        }
    }

    /// 根据下行带宽估算连接类型（Mbps）
    pub fn from_downlink(downlink_mbps: f64) -> Self {
        if downlink_mbps <= 0.0 {
            ConnectionClass::Unknown
        } else if downlink_mbps < 0.05 {
            ConnectionClass::Slow2g
        } else if downlink_mbps < 0.25 {
            ConnectionClass::TwoG
        } else if downlink_mbps < 1.5 {
            ConnectionClass::ThreeG
        } else if downlink_mbps < 10.0 {
            ConnectionClass::FourG
        } else {
            ConnectionClass::Broadband
        }
    }
}

impl std::str::FromStr for ConnectionClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match ConnectionClass::from_effective_type(s) {
            ConnectionClass::Unknown if !s.eq_ignore_ascii_case("unknown") => {
                Err(format!("未知的连接类型: {}", s))
            }
            class => Ok(class),
        }
    }
}

/// 一次采样的原始连接信息
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSample {
    pub class: ConnectionClass,
    /// 下行带宽估算（Mbps）
    pub downlink_mbps: Option<f64>,
    /// 往返时延估算（毫秒）
    pub rtt_ms: Option<u64>,
    pub save_data: bool,
}

impl ConnectionSample {
    pub fn of_class(class: ConnectionClass) -> Self {
        Self {
            class,
            downlink_mbps: None,
            rtt_ms: None,
            save_data: false,
        }
    }
}

/// 网络状况快照（每次采样整体替换）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkMetrics {
    pub class: ConnectionClass,
    pub downlink_mbps: Option<f64>,
    pub rtt_ms: Option<u64>,
    pub save_data: bool,
    pub sampled_at: DateTime<Utc>,
}

impl NetworkMetrics {
    pub fn from_sample(sample: ConnectionSample) -> Self {
        // 平台只给出带宽时，用带宽推断连接类型
        let class = match (sample.class, sample.downlink_mbps) {
            (ConnectionClass::Unknown, Some(downlink)) => ConnectionClass::from_downlink(downlink),
            (class, _) => class,
        };
        Self {
            class,
            downlink_mbps: sample.downlink_mbps,
            rtt_ms: sample.rtt_ms,
            save_data: sample.save_data,
            sampled_at: Utc::now(),
        }
    }

    pub fn unknown() -> Self {
        Self::from_sample(ConnectionSample::of_class(ConnectionClass::Unknown))
    }

    /// 除采样时间外是否相同
    pub fn same_conditions(&self, other: &NetworkMetrics) -> bool {
        self.class == other.class
            && self.downlink_mbps == other.downlink_mbps
            && self.rtt_ms == other.rtt_ms
            && self.save_data == other.save_data
    }
}
