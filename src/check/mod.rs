//! 节点探测
//! `engine` 负责单节点的连通性、延迟稳定性与测速，`checker` 负责并发调度

pub mod checker;
pub mod engine;
pub mod geo;
pub mod throughput;
pub mod unlock;

use crate::proxy::NodeDescriptor;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

pub use checker::{CheckerSettings, ProxyChecker, Stats};
pub use engine::{ProbeEngine, ProbeSettings};
pub use geo::{GeoInfo, GeoLookup, HttpGeoLookup};
pub use throughput::{SpeedEndpoint, ThroughputReport};
pub use unlock::{HttpUnlockChecker, PlatformStatus, UnlockChecker, UnlockReport, UnlockSummary};

/// 连通性结论
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Connectivity {
    Connected,
    Failed,
    Timeout,
    /// 探测过程本身出错（例如任务崩溃）
    Error,
    /// 批次截止时仍未开始
    NotAttempted,
}

impl Connectivity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Connectivity::Connected => "connected",
            Connectivity::Failed => "failed",
            Connectivity::Timeout => "timeout",
            Connectivity::Error => "error",
            Connectivity::NotAttempted => "not_attempted",
        }
    }
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 探测失败原因，记录在结果中，不再向上传播
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ProbeError {
    #[error("域名解析失败: {0}")]
    DnsResolution(String),
    #[error("连接被拒绝: {0}")]
    Refused(String),
    #[error("连接失败: {0}")]
    Unreachable(String),
    #[error("连接超时: {0}")]
    Timeout(String),
    #[error("节点检测时间耗尽")]
    BudgetExhausted,
    #[error("检测异常: {0}")]
    Internal(String),
    #[error("批次截止，未检测")]
    NotAttempted,
}

impl ProbeError {
    /// 对应的连通性结论
    pub fn connectivity(&self) -> Connectivity {
        match self {
            ProbeError::DnsResolution(_) | ProbeError::Refused(_) | ProbeError::Unreachable(_) => {
                Connectivity::Failed
            }
            ProbeError::Timeout(_) | ProbeError::BudgetExhausted => Connectivity::Timeout,
            ProbeError::Internal(_) => Connectivity::Error,
            ProbeError::NotAttempted => Connectivity::NotAttempted,
        }
    }
}

/// 多次 TCP 握手的延迟统计
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub attempts: usize,
    pub successes: usize,
    pub avg_ms: Option<f64>,
    pub min_ms: Option<f64>,
    pub max_ms: Option<f64>,
    /// 最大值与最小值之差
    pub jitter_ms: Option<f64>,
    pub packet_loss_pct: f64,
}

impl LatencyStats {
    pub fn from_samples(samples: &[f64], attempts: usize) -> Self {
        let attempts = attempts.max(samples.len());
        let packet_loss_pct = if attempts == 0 {
            100.0
        } else {
            (attempts - samples.len()) as f64 / attempts as f64 * 100.0
        };

        if samples.is_empty() {
            return Self {
                attempts,
                successes: 0,
                avg_ms: None,
                min_ms: None,
                max_ms: None,
                jitter_ms: None,
                packet_loss_pct,
            };
        }

        let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
        let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let avg = samples.iter().sum::<f64>() / samples.len() as f64;

        Self {
            attempts,
            successes: samples.len(),
            avg_ms: Some(avg),
            min_ms: Some(min),
            max_ms: Some(max),
            jitter_ms: Some(max - min),
            packet_loss_pct,
        }
    }
}

/// 单个节点的一次完整探测结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub node: NodeDescriptor,
    pub connectivity: Connectivity,
    pub error: Option<ProbeError>,
    pub ip: Option<IpAddr>,
    /// 首次 TCP 握手耗时
    pub latency_ms: Option<f64>,
    pub stability: Option<LatencyStats>,
    pub throughput_mbps: f64,
    pub first_byte_latency_ms: Option<f64>,
    pub downloaded_bytes: u64,
    pub speed_endpoint: Option<String>,
    /// 所有测速地址都失败，区别于“速度很慢”
    pub speed_test_failed: bool,
    pub geo: Option<GeoInfo>,
    pub unlock: Option<UnlockReport>,
    pub started_at: DateTime<Local>,
    pub elapsed_ms: f64,
}

impl ProbeResult {
    pub fn new(node: NodeDescriptor) -> Self {
        Self {
            node,
            connectivity: Connectivity::NotAttempted,
            error: None,
            ip: None,
            latency_ms: None,
            stability: None,
            throughput_mbps: 0.0,
            first_byte_latency_ms: None,
            downloaded_bytes: 0,
            speed_endpoint: None,
            speed_test_failed: false,
            geo: None,
            unlock: None,
            started_at: Local::now(),
            elapsed_ms: 0.0,
        }
    }

    /// 以失败原因结束的结果
    pub fn failed(node: NodeDescriptor, error: ProbeError) -> Self {
        let mut result = Self::new(node);
        result.connectivity = error.connectivity();
        result.error = Some(error);
        result
    }

    pub fn not_attempted(node: NodeDescriptor) -> Self {
        Self::failed(node, ProbeError::NotAttempted)
    }

    pub fn is_connected(&self) -> bool {
        self.connectivity == Connectivity::Connected
    }

    pub fn jitter_ms(&self) -> Option<f64> {
        self.stability.as_ref()?.jitter_ms
    }

    pub fn packet_loss_pct(&self) -> Option<f64> {
        self.stability.as_ref().map(|s| s.packet_loss_pct)
    }

    pub fn unlock_rate(&self) -> Option<f64> {
        self.unlock.as_ref().map(|u| u.summary.unlock_rate_pct)
    }
}

/// 单节点探测器，调度器通过它运行每个节点
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, node: &NodeDescriptor, budget: Duration) -> ProbeResult;
}

pub(crate) fn millis(duration: Duration) -> f64 {
    (duration.as_secs_f64() * 1000.0 * 100.0).round() / 100.0
}

/// 约 30 年，预算大到无法表示时用作截止时间
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// 从现在起经过 `budget` 的截止时间，溢出时退化为足够远的将来
pub(crate) fn deadline_after(budget: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(budget)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_stats() {
        let stats = LatencyStats::from_samples(&[30.0, 35.0, 32.0], 5);
        assert_eq!(stats.successes, 3);
        assert_eq!(stats.min_ms, Some(30.0));
        assert_eq!(stats.max_ms, Some(35.0));
        assert_eq!(stats.jitter_ms, Some(5.0));
        assert!((stats.avg_ms.unwrap() - 32.333).abs() < 0.01);
        assert!((stats.packet_loss_pct - 40.0).abs() < 1e-9);

        let empty = LatencyStats::from_samples(&[], 5);
        assert_eq!(empty.jitter_ms, None);
        assert_eq!(empty.packet_loss_pct, 100.0);
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(
            ProbeError::DnsResolution("x".into()).connectivity(),
            Connectivity::Failed
        );
        assert_eq!(
            ProbeError::Refused("x".into()).connectivity(),
            Connectivity::Failed
        );
        assert_eq!(
            ProbeError::Timeout("x".into()).connectivity(),
            Connectivity::Timeout
        );
        assert_eq!(
            ProbeError::Internal("panic".into()).connectivity(),
            Connectivity::Error
        );
        assert_eq!(
            ProbeError::NotAttempted.connectivity(),
            Connectivity::NotAttempted
        );
    }
}
