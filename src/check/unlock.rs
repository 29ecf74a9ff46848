//! 流媒体与常用平台解锁检测
//! 请求与测速一样直连发出，结果只作为评分的参考项

use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// 单个平台的检测配置
#[derive(Debug, Clone)]
pub struct Platform {
    pub name: &'static str,
    pub url: &'static str,
    pub success_indicators: &'static [&'static str],
    pub blocked_indicators: &'static [&'static str],
}

pub const PLATFORMS: &[Platform] = &[
    Platform {
        name: "Netflix",
        url: "https://www.netflix.com/title/70143836",
        success_indicators: &["watch", "play", "video"],
        blocked_indicators: &["not available", "blocked", "restricted"],
    },
    Platform {
        name: "Disney+",
        url: "https://www.disneyplus.com/",
        success_indicators: &["sign up", "start streaming"],
        blocked_indicators: &["not available", "coming soon"],
    },
    Platform {
        name: "YouTube Premium",
        url: "https://www.youtube.com/premium",
        success_indicators: &["youtube premium", "start free trial"],
        blocked_indicators: &["not available"],
    },
    Platform {
        name: "ChatGPT",
        url: "https://chat.openai.com/",
        success_indicators: &["chatgpt", "openai"],
        blocked_indicators: &["not available", "restricted", "blocked"],
    },
    Platform {
        name: "TikTok",
        url: "https://www.tiktok.com/",
        success_indicators: &["for you", "following"],
        blocked_indicators: &["not available", "banned"],
    },
    Platform {
        name: "Spotify",
        url: "https://www.spotify.com/",
        success_indicators: &["music", "playlist"],
        blocked_indicators: &["not available"],
    },
    Platform {
        name: "Instagram",
        url: "https://www.instagram.com/",
        success_indicators: &["instagram", "sign up"],
        blocked_indicators: &["not available"],
    },
    Platform {
        name: "Twitter/X",
        url: "https://twitter.com/",
        success_indicators: &["twitter", "what's happening"],
        blocked_indicators: &["not available"],
    },
];

impl Platform {
    /// 命中屏蔽关键词视为未解锁；命中成功关键词时只要求非错误状态码；
    /// 两者都没有时仅 2xx 算解锁
    pub fn is_unlocked(&self, http_status: u16, body: &str) -> bool {
        let body = body.to_lowercase();
        if self.blocked_indicators.iter().any(|i| body.contains(i)) {
            return false;
        }
        if self.success_indicators.iter().any(|i| body.contains(i)) {
            return http_status < 400;
        }
        (200..300).contains(&http_status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformStatus {
    Unlocked,
    Blocked,
    Timeout,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformResult {
    pub status: PlatformStatus,
    pub http_status: Option<u16>,
    pub response_ms: Option<f64>,
}

impl PlatformResult {
    pub fn unlocked(&self) -> bool {
        self.status == PlatformStatus::Unlocked
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnlockSummary {
    pub unlocked_count: usize,
    pub total_count: usize,
    pub unlock_rate_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnlockReport {
    pub platforms: BTreeMap<String, PlatformResult>,
    pub summary: UnlockSummary,
}

impl UnlockReport {
    pub fn from_results(platforms: BTreeMap<String, PlatformResult>) -> Self {
        let total_count = platforms.len();
        let unlocked_count = platforms.values().filter(|r| r.unlocked()).count();
        let unlock_rate_pct = if total_count == 0 {
            0.0
        } else {
            (unlocked_count as f64 / total_count as f64 * 1000.0).round() / 10.0
        };

        Self {
            platforms,
            summary: UnlockSummary {
                unlocked_count,
                total_count,
                unlock_rate_pct,
            },
        }
    }

    /// 平台名 → 是否解锁
    pub fn unlocked_map(&self) -> BTreeMap<&str, bool> {
        self.platforms
            .iter()
            .map(|(name, result)| (name.as_str(), result.unlocked()))
            .collect()
    }
}

#[async_trait]
pub trait UnlockChecker: Send + Sync {
    async fn check(&self) -> UnlockReport;
}

pub struct HttpUnlockChecker {
    client: Client,
    platforms: Vec<Platform>,
}

impl HttpUnlockChecker {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .no_proxy()
            .user_agent(crate::config::DEFAULT_USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            platforms: PLATFORMS.to_vec(),
        })
    }

    async fn check_platform(&self, platform: &Platform) -> PlatformResult {
        let start = Instant::now();
        let response = match self
            .client
            .get(platform.url)
            .header("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8")
            .header("Accept-Language", "en-US,en;q=0.5")
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return failure(&e),
        };

        let http_status = response.status().as_u16();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return failure(&e),
        };

        let status = if platform.is_unlocked(http_status, &body) {
            PlatformStatus::Unlocked
        } else {
            PlatformStatus::Blocked
        };
        debug!("{}: {:?} (HTTP {})", platform.name, status, http_status);

        PlatformResult {
            status,
            http_status: Some(http_status),
            response_ms: Some(super::millis(start.elapsed())),
        }
    }
}

fn failure(err: &reqwest::Error) -> PlatformResult {
    PlatformResult {
        status: if err.is_timeout() {
            PlatformStatus::Timeout
        } else {
            PlatformStatus::Error
        },
        http_status: None,
        response_ms: None,
    }
}

#[async_trait]
impl UnlockChecker for HttpUnlockChecker {
    async fn check(&self) -> UnlockReport {
        let mut results = BTreeMap::new();
        for platform in &self.platforms {
            let result = self.check_platform(platform).await;
            results.insert(platform.name.to_string(), result);
        }
        UnlockReport::from_results(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(status: PlatformStatus) -> PlatformResult {
        PlatformResult {
            status,
            http_status: None,
            response_ms: None,
        }
    }

    #[test]
    fn test_indicators() {
        let netflix = &PLATFORMS[0];
        assert!(netflix.is_unlocked(200, "<html>Watch now and PLAY</html>"));
        assert!(!netflix.is_unlocked(
            200,
            "This title is Not Available in your region, watch later"
        ));
        assert!(netflix.is_unlocked(200, "<html></html>"));
    }

    #[test]
    fn test_status_decides_without_indicators() {
        let netflix = &PLATFORMS[0];
        // 成功关键词允许跳转类状态码
        assert!(netflix.is_unlocked(302, "<a href=/login>play</a>"));
        assert!(!netflix.is_unlocked(302, "<html></html>"));
        assert!(!netflix.is_unlocked(403, "<html></html>"));
        assert!(!netflix.is_unlocked(451, "watch"));
    }

    #[test]
    fn test_summary() {
        let mut platforms = BTreeMap::new();
        platforms.insert("A".to_string(), result(PlatformStatus::Unlocked));
        platforms.insert("B".to_string(), result(PlatformStatus::Blocked));
        platforms.insert("C".to_string(), result(PlatformStatus::Timeout));

        let report = UnlockReport::from_results(platforms);
        assert_eq!(report.summary.unlocked_count, 1);
        assert_eq!(report.summary.total_count, 3);
        assert_eq!(report.summary.unlock_rate_pct, 33.3);
        assert_eq!(report.unlocked_map().get("A"), Some(&true));
        assert_eq!(report.unlocked_map().get("C"), Some(&false));

        let empty = UnlockReport::from_results(BTreeMap::new());
        assert_eq!(empty.summary.unlock_rate_pct, 0.0);
    }
}
