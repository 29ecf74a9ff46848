use crate::check::{CheckerSettings, ProbeSettings, SpeedEndpoint};
use crate::subscription::ResolverSettings;
use anyhow::bail;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub name: String,
    pub url: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // 进度显示
    pub print_progress: bool,

    // 调度参数
    pub concurrent: usize,
    /// 单节点检测时限（秒）
    pub node_timeout: u64,
    /// 整批检测时限（秒）
    pub batch_timeout: u64,
    pub smart_shuffle: bool,
    pub threshold: f64,

    // 连通性参数（毫秒）
    pub connect_timeout: u64,
    pub dns_timeout: u64,
    pub latency_samples: usize,
    pub sample_interval: u64,
    pub sample_timeout: u64,

    // 下载参数
    pub speed_test: bool,
    pub speed_test_urls: Vec<SpeedEndpoint>,
    pub download_timeout: u64,
    pub download_mb: u64,
    pub good_enough_mbps: f64,
    pub max_speed_servers: usize,

    // 归属地查询
    pub geo_lookup: bool,
    pub geo_timeout: u64,
    pub geoip_db: Option<String>,

    // 媒体解锁检测
    pub media_check: bool,
    pub media_timeout: u64,

    // 订阅配置
    pub subscriptions: Vec<Subscription>,
    pub subscription_timeout: u64,
    pub user_agent: String,

    // 输出配置
    pub output_dir: String,
    pub output_format: String,

    // 日志配置
    pub log_level: String,

    // 代理配置
    pub system_proxy: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            print_progress: true,
            concurrent: 3,
            node_timeout: 90,
            batch_timeout: 900,
            smart_shuffle: true,
            threshold: 0.75,
            connect_timeout: 10_000,
            dns_timeout: 5_000,
            latency_samples: 5,
            sample_interval: 500,
            sample_timeout: 5_000,
            speed_test: true,
            speed_test_urls: SpeedEndpoint::defaults(),
            download_timeout: 20,
            download_mb: 50,
            good_enough_mbps: 20.0,
            max_speed_servers: 3,
            geo_lookup: true,
            geo_timeout: 5_000,
            geoip_db: None,
            media_check: false,
            media_timeout: 15,
            subscriptions: vec![],
            subscription_timeout: 30,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            output_dir: "./output".to_string(),
            output_format: "both".to_string(),
            log_level: "info".to_string(),
            system_proxy: None,
        }
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.concurrent == 0 {
            bail!("concurrent 必须大于 0");
        }
        if self.node_timeout == 0 || self.batch_timeout == 0 {
            bail!("node_timeout 与 batch_timeout 必须大于 0");
        }
        if self.connect_timeout == 0 || self.sample_timeout == 0 {
            bail!("connect_timeout 与 sample_timeout 必须大于 0");
        }
        if self.speed_test {
            if self.speed_test_urls.is_empty() {
                bail!("已启用测速但 speed_test_urls 为空");
            }
            if self.download_mb == 0 || self.download_timeout == 0 {
                bail!("download_mb 与 download_timeout 必须大于 0");
            }
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            bail!("threshold 必须在 0~1 之间");
        }
        if !matches!(self.output_format.as_str(), "json" | "yaml" | "both") {
            bail!("output_format 只支持 json / yaml / both");
        }
        Ok(())
    }

    pub fn is_speed_test_enabled(&self) -> bool {
        self.speed_test
    }

    pub fn is_media_check_enabled(&self) -> bool {
        self.media_check
    }

    pub fn probe_settings(&self) -> ProbeSettings {
        ProbeSettings {
            connect_timeout: Duration::from_millis(self.connect_timeout),
            dns_timeout: Duration::from_millis(self.dns_timeout),
            latency_samples: self.latency_samples,
            sample_interval: Duration::from_millis(self.sample_interval),
            sample_timeout: Duration::from_millis(self.sample_timeout),
            speed_test: self.speed_test,
            speed_endpoints: self.speed_test_urls.clone(),
            speed_time_cap: Duration::from_secs(self.download_timeout),
            speed_size_cap: self.download_mb.saturating_mul(1024 * 1024),
            good_enough_mbps: self.good_enough_mbps,
            max_speed_endpoints: self.max_speed_servers,
            geo_lookup: self.geo_lookup,
            geo_timeout: Duration::from_millis(self.geo_timeout),
            geoip_db: self.geoip_db.as_ref().map(PathBuf::from),
            unlock_check: self.media_check,
            unlock_timeout: Duration::from_secs(self.media_timeout),
        }
    }

    pub fn checker_settings(&self) -> CheckerSettings {
        CheckerSettings {
            workers: self.concurrent,
            per_node_budget: Duration::from_secs(self.node_timeout),
            batch_budget: Duration::from_secs(self.batch_timeout),
            smart_shuffle: self.smart_shuffle,
            cidr_threshold: self.threshold,
            print_progress: self.print_progress,
            ..CheckerSettings::default()
        }
    }

    pub fn resolver_settings(&self) -> ResolverSettings {
        ResolverSettings {
            timeout: Duration::from_secs(self.subscription_timeout),
            user_agent: self.user_agent.clone(),
            system_proxy: self.system_proxy.clone(),
        }
    }

    /// 启用的订阅链接
    pub fn enabled_subscriptions(&self) -> impl Iterator<Item = &Subscription> {
        self.subscriptions.iter().filter(|s| s.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_is_valid() {
        let config = Config::default();
        config.validate().unwrap();

        let probe = config.probe_settings();
        assert_eq!(probe.connect_timeout, Duration::from_secs(10));
        assert_eq!(probe.latency_samples, 5);
        assert_eq!(probe.speed_size_cap, 50 * 1024 * 1024);
        assert!(!probe.unlock_check);

        let checker = config.checker_settings();
        assert_eq!(checker.workers, 3);
        assert_eq!(checker.per_node_budget, Duration::from_secs(90));
        assert_eq!(checker.batch_budget, Duration::from_secs(900));

        assert_eq!(
            config.resolver_settings().timeout,
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: Config = serde_yaml::from_str(
            "concurrent: 8\nsubscriptions:\n  - name: main\n    url: https://example.com/sub\n",
        )
        .unwrap();

        assert_eq!(config.concurrent, 8);
        assert_eq!(config.node_timeout, 90);
        assert_eq!(config.subscriptions.len(), 1);
        assert!(config.subscriptions[0].enabled);
        assert_eq!(config.enabled_subscriptions().count(), 1);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let mut config = Config::default();
        config.concurrent = 5;
        config.media_check = true;
        config.speed_test_urls = vec![SpeedEndpoint::new("local", "http://127.0.0.1/")];
        config.save_to_file(&path).unwrap();

        let loaded = Config::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.concurrent = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.speed_test_urls.clear();
        assert!(config.validate().is_err());
        config.speed_test = false;
        assert!(config.validate().is_ok());

        let mut config = Config::default();
        config.threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.output_format = "xml".to_string();
        assert!(config.validate().is_err());

        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "concurrent: 0\n").unwrap();
        assert!(Config::load_from_file(&path).is_err());
    }

    #[test]
    fn test_huge_values_saturate() {
        let config = Config {
            node_timeout: u64::MAX,
            batch_timeout: u64::MAX,
            download_mb: u64::MAX,
            ..Config::default()
        };
        config.validate().unwrap();

        assert_eq!(config.probe_settings().speed_size_cap, u64::MAX);
        assert_eq!(
            config.checker_settings().batch_budget,
            Duration::from_secs(u64::MAX)
        );
    }
}
