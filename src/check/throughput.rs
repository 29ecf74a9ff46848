//! 下载测速
//! 依次尝试测速地址，流式读取并统计字节数，超过时间或大小上限即停止

use super::millis;
use anyhow::{anyhow, bail};
use log::debug;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{Instant, timeout_at};

/// 测速地址
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedEndpoint {
    pub name: String,
    pub url: String,
}

impl SpeedEndpoint {
    pub fn new(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
        }
    }

    pub fn defaults() -> Vec<SpeedEndpoint> {
        vec![
            SpeedEndpoint::new(
                "Cloudflare",
                "https://speed.cloudflare.com/__down?bytes=52428800",
            ),
            SpeedEndpoint::new(
                "Fast.com",
                "https://api.fast.com/netflix/speedtest/v2/download",
            ),
            SpeedEndpoint::new(
                "GitHub",
                "https://github.com/microsoft/vscode/archive/refs/heads/main.zip",
            ),
            SpeedEndpoint::new(
                "Google",
                "https://www.google.com/images/branding/googlelogo/1x/googlelogo_color_272x92dp.png",
            ),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct ThroughputLimits {
    /// 单个地址的最长下载时间
    pub time_cap: Duration,
    pub size_cap: u64,
    pub good_enough_mbps: f64,
    pub max_endpoints: usize,
}

/// 单个测速地址的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThroughputReport {
    pub endpoint: String,
    pub bytes: u64,
    pub elapsed_secs: f64,
    pub first_byte_ms: Option<f64>,
    /// 兆比特每秒
    pub mbps: f64,
}

/// 按顺序尝试测速地址，返回最快的一次；全部失败时返回 None
pub async fn measure(
    client: &Client,
    endpoints: &[SpeedEndpoint],
    limits: &ThroughputLimits,
    deadline: Instant,
) -> Option<ThroughputReport> {
    let mut best: Option<ThroughputReport> = None;

    for endpoint in endpoints.iter().take(limits.max_endpoints) {
        if Instant::now() >= deadline {
            debug!("测速时间耗尽，跳过 {}", endpoint.name);
            break;
        }

        match download(client, endpoint, limits, deadline).await {
            Ok(report) => {
                debug!(
                    "测速 {}: {:.2} Mbps ({} bytes / {:.2}s)",
                    endpoint.name, report.mbps, report.bytes, report.elapsed_secs
                );
                if best.as_ref().map_or(true, |b| report.mbps > b.mbps) {
                    best = Some(report);
                }
                // 速度足够好，不再浪费时间
                if best.as_ref().is_some_and(|b| b.mbps > limits.good_enough_mbps) {
                    break;
                }
            }
            Err(e) => debug!("测速地址 {} 失败: {}", endpoint.name, e),
        }
    }

    best
}

/// 下载单个地址，超时或达到大小上限时用已收到的字节计算速度
pub async fn download(
    client: &Client,
    endpoint: &SpeedEndpoint,
    limits: &ThroughputLimits,
    deadline: Instant,
) -> anyhow::Result<ThroughputReport> {
    let start = Instant::now();
    let stop_at = start
        .checked_add(limits.time_cap)
        .map_or(deadline, |cap| cap.min(deadline));

    let mut response = timeout_at(stop_at, client.get(&endpoint.url).send())
        .await
        .map_err(|_| anyhow!("请求超时"))??;

    if !response.status().is_success() {
        bail!("HTTP {}", response.status());
    }

    let mut bytes: u64 = 0;
    let mut first_byte = None;

    loop {
        match timeout_at(stop_at, response.chunk()).await {
            Ok(Ok(Some(chunk))) => {
                if first_byte.is_none() {
                    first_byte = Some(start.elapsed());
                }
                bytes += chunk.len() as u64;
                if bytes >= limits.size_cap {
                    break;
                }
            }
            Ok(Ok(None)) => break,
            Ok(Err(e)) if bytes == 0 => return Err(e.into()),
            // 读到一半断开，保留已下载部分
            Ok(Err(_)) => break,
            Err(_) => break,
        }
    }

    let elapsed = start.elapsed().as_secs_f64();
    if bytes == 0 || elapsed <= 0.0 {
        bail!("未收到任何数据");
    }

    Ok(ThroughputReport {
        endpoint: endpoint.name.clone(),
        bytes,
        elapsed_secs: elapsed,
        first_byte_ms: first_byte.map(millis),
        mbps: bytes as f64 * 8.0 / 1_000_000.0 / elapsed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TestResponse, closed_port, spawn_http_server};

    fn limits(time_cap: Duration) -> ThroughputLimits {
        ThroughputLimits {
            time_cap,
            size_cap: 50 * 1024 * 1024,
            good_enough_mbps: 20.0,
            max_endpoints: 3,
        }
    }

    fn client() -> Client {
        Client::builder().no_proxy().build().unwrap()
    }

    #[tokio::test]
    async fn test_download_fixed_body() {
        let addr = spawn_http_server(TestResponse::ok(vec![7u8; 256 * 1024])).await;
        let endpoint = SpeedEndpoint::new("local", &format!("http://{}/file", addr));

        let report = download(
            &client(),
            &endpoint,
            &limits(Duration::from_secs(5)),
            Instant::now() + Duration::from_secs(10),
        )
        .await
        .unwrap();

        assert_eq!(report.bytes, 256 * 1024);
        assert!(report.mbps > 0.0);
        assert!(report.first_byte_ms.is_some());
        assert_eq!(report.endpoint, "local");
    }

    #[tokio::test]
    async fn test_time_cap_keeps_partial_bytes() {
        let addr = spawn_http_server(TestResponse::trickle(1024, Duration::from_millis(20))).await;
        let endpoint = SpeedEndpoint::new("slow", &format!("http://{}/", addr));

        let started = std::time::Instant::now();
        let report = download(
            &client(),
            &endpoint,
            &limits(Duration::from_millis(400)),
            Instant::now() + Duration::from_secs(10),
        )
        .await
        .unwrap();

        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(report.bytes > 0);
        assert!(report.mbps > 0.0);
    }

    #[tokio::test]
    async fn test_size_cap_stops_early() {
        let addr = spawn_http_server(TestResponse::trickle(64 * 1024, Duration::from_millis(1))).await;
        let endpoint = SpeedEndpoint::new("fast", &format!("http://{}/", addr));
        let mut limits = limits(Duration::from_secs(10));
        limits.size_cap = 256 * 1024;

        let report = download(
            &client(),
            &endpoint,
            &limits,
            Instant::now() + Duration::from_secs(10),
        )
        .await
        .unwrap();

        assert!(report.bytes >= 256 * 1024);
        assert!(report.elapsed_secs < 10.0);
    }

    #[tokio::test]
    async fn test_measure_falls_through_failed_endpoints() {
        let dead = closed_port().await;
        let bad_status = spawn_http_server(TestResponse::status(404)).await;
        let good = spawn_http_server(TestResponse::ok(vec![1u8; 64 * 1024])).await;

        let endpoints = vec![
            SpeedEndpoint::new("dead", &format!("http://{}/", dead)),
            SpeedEndpoint::new("404", &format!("http://{}/", bad_status)),
            SpeedEndpoint::new("good", &format!("http://{}/", good)),
        ];

        let report = measure(
            &client(),
            &endpoints,
            &limits(Duration::from_secs(5)),
            Instant::now() + Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert_eq!(report.endpoint, "good");
    }

    #[tokio::test]
    async fn test_measure_all_failed() {
        let dead = closed_port().await;
        let endpoints = vec![SpeedEndpoint::new("dead", &format!("http://{}/", dead))];

        let report = measure(
            &client(),
            &endpoints,
            &limits(Duration::from_secs(2)),
            Instant::now() + Duration::from_secs(5),
        )
        .await;
        assert!(report.is_none());
    }

    #[tokio::test]
    async fn test_measure_respects_endpoint_limit() {
        let dead = closed_port().await;
        let good = spawn_http_server(TestResponse::ok(vec![1u8; 1024])).await;
        let endpoints = vec![
            SpeedEndpoint::new("dead", &format!("http://{}/", dead)),
            SpeedEndpoint::new("good", &format!("http://{}/", good)),
        ];
        let mut limits = limits(Duration::from_secs(2));
        limits.max_endpoints = 1;

        let report = measure(
            &client(),
            &endpoints,
            &limits,
            Instant::now() + Duration::from_secs(5),
        )
        .await;
        assert!(report.is_none());
    }
}
