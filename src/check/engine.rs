//! 单节点探测流程
//! 连通性 → 归属地 → 延迟稳定性 → 测速 → 解锁；连通性失败时直接结束

use super::geo::{GeoLookup, HttpGeoLookup};
use super::throughput::{self, SpeedEndpoint, ThroughputLimits};
use super::unlock::{HttpUnlockChecker, UnlockChecker};
use super::{LatencyStats, ProbeError, ProbeResult, Prober, deadline_after, millis};
use crate::proxy::NodeDescriptor;
use async_trait::async_trait;
use log::{debug, info};
use reqwest::Client;
use std::future::Future;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep, timeout};

#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub connect_timeout: Duration,
    pub dns_timeout: Duration,
    pub latency_samples: usize,
    pub sample_interval: Duration,
    pub sample_timeout: Duration,
    pub speed_test: bool,
    pub speed_endpoints: Vec<SpeedEndpoint>,
    pub speed_time_cap: Duration,
    pub speed_size_cap: u64,
    pub good_enough_mbps: f64,
    pub max_speed_endpoints: usize,
    pub geo_lookup: bool,
    pub geo_timeout: Duration,
    pub geoip_db: Option<PathBuf>,
    pub unlock_check: bool,
    pub unlock_timeout: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            dns_timeout: Duration::from_secs(5),
            latency_samples: 5,
            sample_interval: Duration::from_millis(500),
            sample_timeout: Duration::from_secs(5),
            speed_test: true,
            speed_endpoints: SpeedEndpoint::defaults(),
            speed_time_cap: Duration::from_secs(20),
            speed_size_cap: 50 * 1024 * 1024,
            good_enough_mbps: 20.0,
            max_speed_endpoints: 3,
            geo_lookup: true,
            geo_timeout: Duration::from_secs(5),
            geoip_db: None,
            unlock_check: false,
            unlock_timeout: Duration::from_secs(15),
        }
    }
}

impl ProbeSettings {
    fn throughput_limits(&self) -> ThroughputLimits {
        ThroughputLimits {
            time_cap: self.speed_time_cap,
            size_cap: self.speed_size_cap,
            good_enough_mbps: self.good_enough_mbps,
            max_endpoints: self.max_speed_endpoints,
        }
    }
}

/// 探测引擎，HTTP 客户端与查询服务在整个批次内复用
pub struct ProbeEngine {
    settings: ProbeSettings,
    client: Client,
    geo: Option<Arc<dyn GeoLookup>>,
    unlock: Option<Arc<dyn UnlockChecker>>,
}

impl ProbeEngine {
    pub fn new(settings: ProbeSettings) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(settings.connect_timeout)
            .no_proxy()
            .user_agent(crate::config::DEFAULT_USER_AGENT)
            .build()?;

        let geo: Option<Arc<dyn GeoLookup>> = if settings.geo_lookup {
            Some(Arc::new(HttpGeoLookup::new(
                settings.geo_timeout,
                settings.geoip_db.as_deref(),
            )?))
        } else {
            None
        };

        let unlock: Option<Arc<dyn UnlockChecker>> = if settings.unlock_check {
            Some(Arc::new(HttpUnlockChecker::new(settings.unlock_timeout)?))
        } else {
            None
        };

        Ok(Self {
            settings,
            client,
            geo,
            unlock,
        })
    }

    /// 替换归属地查询实现，传 None 关闭
    pub fn with_geo_lookup(mut self, geo: Option<Arc<dyn GeoLookup>>) -> Self {
        self.geo = geo;
        self
    }

    pub fn with_unlock_checker(mut self, unlock: Option<Arc<dyn UnlockChecker>>) -> Self {
        self.unlock = unlock;
        self
    }

    /// 解析域名并建立一次 TCP 连接，返回目标 IP 与握手耗时
    pub async fn connectivity(
        &self,
        node: &NodeDescriptor,
        deadline: Instant,
    ) -> Result<(IpAddr, f64), ProbeError> {
        let ip = match node.get_ip_address() {
            Some(ip) => ip,
            None => self.resolve(node, deadline).await?,
        };

        let addr = SocketAddr::new(ip, node.port());
        let limit = self.settings.connect_timeout.min(remaining(deadline));
        let start = Instant::now();

        match timeout(limit, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                let latency = millis(start.elapsed());
                drop(stream);
                Ok((ip, latency))
            }
            Ok(Err(e)) => Err(classify_io(e)),
            Err(_) => Err(ProbeError::Timeout(format!(
                "{} 在 {:.1}s 内未响应",
                addr,
                limit.as_secs_f64()
            ))),
        }
    }

    async fn resolve(&self, node: &NodeDescriptor, deadline: Instant) -> Result<IpAddr, ProbeError> {
        let limit = self.settings.dns_timeout.min(remaining(deadline));
        let lookup = tokio::net::lookup_host((node.host(), node.port()));

        match timeout(limit, lookup).await {
            Ok(Ok(mut addrs)) => addrs
                .next()
                .map(|addr| addr.ip())
                .ok_or_else(|| ProbeError::DnsResolution(format!("{} 没有解析结果", node.host()))),
            Ok(Err(e)) => Err(ProbeError::DnsResolution(format!("{}: {}", node.host(), e))),
            Err(_) => Err(ProbeError::DnsResolution(format!("{} 解析超时", node.host()))),
        }
    }

    /// 重复握手若干次，失败的样本直接丢弃
    pub async fn latency_stability(&self, ip: IpAddr, port: u16, deadline: Instant) -> LatencyStats {
        let addr = SocketAddr::new(ip, port);
        let count = self.settings.latency_samples;
        let mut samples = Vec::with_capacity(count);
        let mut attempts = 0;

        for i in 0..count {
            let limit = self.settings.sample_timeout.min(remaining(deadline));
            if limit.is_zero() {
                break;
            }
            attempts += 1;

            let start = Instant::now();
            if let Ok(Ok(stream)) = timeout(limit, TcpStream::connect(addr)).await {
                samples.push(millis(start.elapsed()));
                drop(stream);
            }

            if i + 1 < count {
                sleep(self.settings.sample_interval.min(remaining(deadline))).await;
            }
        }

        LatencyStats::from_samples(&samples, attempts)
    }

    async fn run(&self, node: &NodeDescriptor, deadline: Instant) -> ProbeResult {
        let name = node.name();
        let mut result = ProbeResult::new(node.clone());

        debug!("[{}] 连通性检测 {}", name, node.address());
        let ip = match self.connectivity(node, deadline).await {
            Ok((ip, latency)) => {
                result.connectivity = super::Connectivity::Connected;
                result.ip = Some(ip);
                result.latency_ms = Some(latency);
                ip
            }
            Err(e) => {
                debug!("[{}] 连接失败: {}", name, e);
                result.connectivity = e.connectivity();
                result.error = Some(e);
                return result;
            }
        };

        if let Some(geo) = &self.geo {
            debug!("[{}] 查询归属地 {}", name, ip);
            result.geo = within(deadline, geo.lookup(ip)).await;
        }

        debug!("[{}] 延迟稳定性检测", name);
        result.stability = Some(self.latency_stability(ip, node.port(), deadline).await);

        if self.settings.speed_test {
            debug!("[{}] 下载测速", name);
            match throughput::measure(
                &self.client,
                &self.settings.speed_endpoints,
                &self.settings.throughput_limits(),
                deadline,
            )
            .await
            {
                Some(report) => {
                    result.throughput_mbps = (report.mbps * 100.0).round() / 100.0;
                    result.first_byte_latency_ms = report.first_byte_ms;
                    result.downloaded_bytes = report.bytes;
                    result.speed_endpoint = Some(report.endpoint);
                }
                None => result.speed_test_failed = true,
            }
        }

        if let Some(unlock) = &self.unlock {
            debug!("[{}] 平台解锁检测", name);
            result.unlock = within(deadline, unlock.check()).await;
        }

        if remaining(deadline).is_zero() {
            debug!("[{}] 检测时间耗尽，后续项目已跳过", name);
            result.error = Some(ProbeError::BudgetExhausted);
        }

        result
    }
}

#[async_trait]
impl Prober for ProbeEngine {
    async fn probe(&self, node: &NodeDescriptor, budget: Duration) -> ProbeResult {
        let started = Instant::now();
        let mut result = self.run(node, deadline_after(budget)).await;
        result.elapsed_ms = millis(started.elapsed());

        info!(
            "{} [{}] {} 延迟 {} 速度 {:.2} Mbps",
            node.name(),
            node.protocol(),
            result.connectivity,
            result
                .latency_ms
                .map(|l| format!("{:.0}ms", l))
                .unwrap_or_else(|| "-".to_string()),
            result.throughput_mbps
        );
        result
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

/// 在截止时间前完成则返回结果，否则丢弃
async fn within<T>(deadline: Instant, fut: impl Future<Output = T>) -> Option<T> {
    timeout(remaining(deadline), fut).await.ok()
}

fn classify_io(err: std::io::Error) -> ProbeError {
    match err.kind() {
        ErrorKind::ConnectionRefused => ProbeError::Refused(err.to_string()),
        ErrorKind::TimedOut => ProbeError::Timeout(err.to_string()),
        _ => ProbeError::Unreachable(err.to_string()),
    }
}
