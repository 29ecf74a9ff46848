//! 订阅获取与解析
//! 拉取远程订阅，按需 base64 解码后逐行交给节点解析器

use crate::proxy::{self, LinkFailure, NodeDescriptor, Protocol};
use chrono::{DateTime, Local, Utc};
use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use url::Url;

lazy_static! {
    static ref FILENAME_RE: Regex =
        Regex::new(r#"filename\*?=(?:UTF-8'')?"?([^";]+)"?"#).expect("filename 正则无效");
}

/// 订阅获取错误，整批订阅失败时返回给调用方
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("订阅链接被拒绝访问 (HTTP 403)，可能被 WAF 拦截，请检查链接或稍后重试")]
    Forbidden,
    #[error("订阅返回异常状态码: {0}")]
    Status(u16),
    #[error("订阅获取超时")]
    Timeout,
    #[error("网络请求失败: {0}")]
    Network(String),
    #[error("订阅链接无效: {0}")]
    InvalidUrl(String),
    #[error("HTTP 客户端初始化失败: {0}")]
    Client(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Network(err.to_string())
        }
    }
}

/// 订阅解析器配置
#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub timeout: Duration,
    pub user_agent: String,
    /// 拉取订阅时使用的代理，为空时直连
    pub system_proxy: Option<String>,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: crate::config::DEFAULT_USER_AGENT.to_string(),
            system_proxy: None,
        }
    }
}

/// 流量与到期信息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotaInfo {
    pub upload: Option<u64>,
    pub download: Option<u64>,
    pub total: Option<u64>,
    pub expire: Option<DateTime<Utc>>,
}

impl QuotaInfo {
    /// 解析 `upload=1; download=2; total=3; expire=4` 格式
    pub fn parse_userinfo(raw: &str) -> Option<Self> {
        let mut quota = QuotaInfo::default();
        let mut found = false;

        for part in raw.split(';') {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            let Some(number) = parse_number(value) else {
                continue;
            };

            match key.trim().to_ascii_lowercase().as_str() {
                "upload" => quota.upload = Some(number),
                "download" => quota.download = Some(number),
                "total" => quota.total = Some(number),
                "expire" => quota.expire = timestamp(number),
                _ => continue,
            }
            found = true;
        }

        found.then_some(quota)
    }

    /// 部分机场直接在 JSON 响应体中给出流量信息
    pub fn from_json(value: &Value) -> Option<Self> {
        let field = |key: &str| match value.get(key)? {
            Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
            Value::String(s) => parse_number(s),
            _ => None,
        };

        let quota = QuotaInfo {
            upload: field("upload"),
            download: field("download"),
            total: field("total"),
            expire: field("expire").and_then(timestamp),
        };

        (quota != QuotaInfo::default()).then_some(quota)
    }

    pub fn used(&self) -> Option<u64> {
        match (self.upload, self.download) {
            (None, None) => None,
            (upload, download) => Some(upload.unwrap_or(0).saturating_add(download.unwrap_or(0))),
        }
    }

    pub fn remaining(&self) -> Option<u64> {
        Some(self.total?.saturating_sub(self.used().unwrap_or(0)))
    }

    pub fn usage_percent(&self) -> Option<f64> {
        let total = self.total.filter(|t| *t > 0)?;
        Some(self.used().unwrap_or(0) as f64 / total as f64 * 100.0)
    }

    /// 剩余天数，已过期时为 0
    pub fn remaining_days(&self, now: DateTime<Utc>) -> Option<i64> {
        Some((self.expire? - now).num_days().max(0))
    }
}

fn parse_number(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    raw.parse::<u64>()
        .ok()
        .or_else(|| raw.parse::<f64>().ok().filter(|f| *f >= 0.0).map(|f| f as u64))
}

fn timestamp(secs: u64) -> Option<DateTime<Utc>> {
    if secs == 0 {
        return None;
    }
    DateTime::from_timestamp(i64::try_from(secs).ok()?, 0)
}

/// 一次订阅拉取的结果，交给探测器后即丢弃
#[derive(Debug, Clone)]
pub struct SubscriptionBundle {
    pub url: String,
    pub raw: String,
    /// base64 解码后的内容，原文不是 base64 时为空
    pub decoded: Option<String>,
    pub nodes: Vec<NodeDescriptor>,
    pub failures: Vec<LinkFailure>,
    pub quota: Option<QuotaInfo>,
    /// content-disposition 中的配置名称
    pub profile_name: Option<String>,
    pub fetched_at: DateTime<Local>,
}

impl SubscriptionBundle {
    pub fn skipped(&self) -> usize {
        self.failures.len()
    }

    /// 按协议统计节点数量
    pub fn protocol_counts(&self) -> BTreeMap<Protocol, usize> {
        let mut counts = BTreeMap::new();
        for node in &self.nodes {
            *counts.entry(node.protocol()).or_insert(0) += 1;
        }
        counts
    }
}

/// 解析订阅正文：先尝试 base64 解码，失败则按原文处理
pub fn parse_content(url: &str, raw: String) -> SubscriptionBundle {
    let decoded = match proxy::decode_base64(raw.trim()) {
        Ok(text) => Some(text),
        Err(e) => {
            debug!("订阅内容不是 base64，按明文处理: {}", e);
            None
        }
    };

    let parsed = proxy::parse_links(decoded.as_deref().unwrap_or(&raw));
    if !parsed.failures.is_empty() {
        warn!(
            "订阅 {} 中有 {} 行无法解析，已跳过",
            url,
            parsed.failures.len()
        );
    }

    SubscriptionBundle {
        url: url.to_string(),
        raw,
        decoded,
        nodes: parsed.nodes,
        failures: parsed.failures,
        quota: None,
        profile_name: None,
        fetched_at: Local::now(),
    }
}

fn profile_name(disposition: &str) -> Option<String> {
    let raw = FILENAME_RE.captures(disposition)?.get(1)?.as_str().trim();
    let name = urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string());
    (!name.is_empty()).then_some(name)
}

/// 订阅解析器，持有复用的 HTTP 客户端
#[derive(Debug, Clone)]
pub struct SubscriptionResolver {
    client: Client,
}

impl SubscriptionResolver {
    pub fn new(settings: ResolverSettings) -> Result<Self, FetchError> {
        let mut builder = Client::builder()
            .timeout(settings.timeout)
            .user_agent(settings.user_agent);

        builder = match &settings.system_proxy {
            Some(proxy_url) => builder.proxy(
                reqwest::Proxy::all(proxy_url).map_err(|e| FetchError::Client(e.to_string()))?,
            ),
            None => builder.no_proxy(),
        };

        let client = builder
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;

        Ok(Self { client })
    }

    /// 拉取并解析订阅
    pub async fn resolve(&self, url: &str) -> Result<SubscriptionBundle, FetchError> {
        let parsed = Url::parse(url.trim()).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FetchError::InvalidUrl(format!(
                "不支持的 scheme: {}",
                parsed.scheme()
            )));
        }

        info!("开始获取订阅: {}", url);
        let response = self
            .client
            .get(parsed)
            .header("Accept", "*/*")
            .header("Cache-Control", "no-cache")
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::FORBIDDEN {
            return Err(FetchError::Forbidden);
        }
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let headers = response.headers();
        let quota = headers
            .get("subscription-userinfo")
            .and_then(|v| v.to_str().ok())
            .and_then(QuotaInfo::parse_userinfo);
        let profile = headers
            .get("content-disposition")
            .and_then(|v| v.to_str().ok())
            .and_then(profile_name);

        let body = response.text().await?;
        let mut bundle = parse_content(url, body);

        bundle.quota = quota.or_else(|| {
            let text = bundle.raw.trim();
            if text.starts_with('{') {
                serde_json::from_str::<Value>(text)
                    .ok()
                    .and_then(|json| QuotaInfo::from_json(&json))
            } else {
                None
            }
        });
        bundle.profile_name = profile;

        info!(
            "订阅解析完成: {} 个节点，跳过 {} 行",
            bundle.nodes.len(),
            bundle.skipped()
        );
        Ok(bundle)
    }
}
