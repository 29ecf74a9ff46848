//! IP 归属地查询
//! 先查本地 GeoLite2 数据库（如有），再按固定顺序回退到在线接口

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoInfo {
    pub country: Option<String>,
    pub country_code: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub isp: Option<String>,
    pub org: Option<String>,
    pub asn: Option<String>,
}

impl GeoInfo {
    /// 全部提供方都失败时的占位值
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn is_unknown(&self) -> bool {
        self.country.is_none() && self.country_code.is_none() && self.isp.is_none()
    }

    fn is_complete(&self) -> bool {
        self.country.is_some() && self.city.is_some() && self.isp.is_some()
    }

    /// 用另一个结果补齐缺失字段，已有字段不覆盖
    pub fn merge(&mut self, other: GeoInfo) {
        fn fill(slot: &mut Option<String>, value: Option<String>) {
            if slot.is_none() {
                *slot = value.filter(|v| !v.trim().is_empty());
            }
        }
        fill(&mut self.country, other.country);
        fill(&mut self.country_code, other.country_code);
        fill(&mut self.region, other.region);
        fill(&mut self.city, other.city);
        fill(&mut self.isp, other.isp);
        fill(&mut self.org, other.org);
        fill(&mut self.asn, other.asn);
    }

    /// 形如 `🇯🇵 Japan - Tokyo` 的地区描述
    pub fn region_label(&self) -> String {
        let flag = self
            .country_code
            .as_deref()
            .and_then(flag_emoji)
            .unwrap_or_else(|| "🌍".to_string());

        match (&self.country, &self.city) {
            (Some(country), Some(city)) if city != country => {
                format!("{} {} - {}", flag, country, city)
            }
            (Some(country), _) => format!("{} {}", flag, country),
            _ => "🌍 未知地区".to_string(),
        }
    }
}

/// 两位国家代码转旗帜 emoji
fn flag_emoji(code: &str) -> Option<String> {
    let code = code.trim().to_ascii_uppercase();
    if code.len() != 2 || !code.chars().all(|c| c.is_ascii_uppercase()) {
        return None;
    }
    code.chars()
        .map(|c| char::from_u32(0x1F1E6 + (c as u32 - 'A' as u32)))
        .collect()
}

/// 归属地查询接口，失败时返回未知而不是报错
#[async_trait]
pub trait GeoLookup: Send + Sync {
    async fn lookup(&self, ip: IpAddr) -> GeoInfo;
}

/// 在线查询接口
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeoProvider {
    IpApi,
    IpApiCo,
    GeoPlugin,
}

impl GeoProvider {
    pub const FALLBACK_ORDER: [GeoProvider; 3] =
        [GeoProvider::IpApi, GeoProvider::IpApiCo, GeoProvider::GeoPlugin];

    fn url(&self, ip: IpAddr) -> String {
        match self {
            GeoProvider::IpApi => format!(
                "http://ip-api.com/json/{}?fields=status,country,countryCode,region,regionName,city,isp,org,as,query",
                ip
            ),
            GeoProvider::IpApiCo => format!("https://ipapi.co/{}/json/", ip),
            GeoProvider::GeoPlugin => format!("http://www.geoplugin.net/json.gp?ip={}", ip),
        }
    }

    /// 各接口字段名不同，统一转换
    pub fn parse(&self, data: &Value) -> Option<GeoInfo> {
        let field = |key: &str| {
            data.get(key).and_then(|v| match v {
                Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
        };

        match self {
            GeoProvider::IpApi => {
                if data.get("status").and_then(Value::as_str) != Some("success") {
                    return None;
                }
                Some(GeoInfo {
                    country: field("country"),
                    country_code: field("countryCode"),
                    region: field("regionName"),
                    city: field("city"),
                    isp: field("isp"),
                    org: field("org"),
                    asn: field("as"),
                })
            }
            GeoProvider::IpApiCo => {
                if data.get("error").is_some() {
                    return None;
                }
                Some(GeoInfo {
                    country: field("country_name"),
                    country_code: field("country_code"),
                    region: field("region"),
                    city: field("city"),
                    isp: field("org"),
                    org: field("org"),
                    asn: field("asn"),
                })
            }
            GeoProvider::GeoPlugin => {
                let info = GeoInfo {
                    country: field("geoplugin_countryName"),
                    country_code: field("geoplugin_countryCode"),
                    region: field("geoplugin_regionName"),
                    city: field("geoplugin_city"),
                    isp: field("geoplugin_isp"),
                    org: field("geoplugin_isp"),
                    asn: None,
                };
                (!info.is_unknown()).then_some(info)
            }
        }
    }
}

#[derive(Deserialize, Debug)]
struct CityRecord {
    country: Option<NamedRecord>,
    subdivisions: Option<Vec<NamedRecord>>,
    city: Option<NamedRecord>,
}

#[derive(Deserialize, Debug)]
struct NamedRecord {
    iso_code: Option<String>,
    names: Option<HashMap<String, String>>,
}

impl NamedRecord {
    fn name(&self) -> Option<String> {
        let names = self.names.as_ref()?;
        names.get("zh-CN").or_else(|| names.get("en")).cloned()
    }
}

/// 本地数据库 + 在线接口的组合查询
pub struct HttpGeoLookup {
    client: Client,
    providers: Vec<GeoProvider>,
    reader: Option<maxminddb::Reader<Vec<u8>>>,
}

impl HttpGeoLookup {
    pub fn new(timeout: Duration, db_path: Option<&Path>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .no_proxy()
            .user_agent(crate::config::DEFAULT_USER_AGENT)
            .build()?;

        let reader = match db_path {
            Some(path) => match maxminddb::Reader::open_readfile(path) {
                Ok(reader) => Some(reader),
                Err(e) => {
                    warn!("无法加载 GeoIP 数据库 {}: {}", path.display(), e);
                    None
                }
            },
            None => None,
        };

        Ok(Self {
            client,
            providers: GeoProvider::FALLBACK_ORDER.to_vec(),
            reader,
        })
    }

    /// 指定在线接口列表，传空列表即只用本地数据库
    pub fn with_providers(mut self, providers: Vec<GeoProvider>) -> Self {
        self.providers = providers;
        self
    }

    fn lookup_offline(&self, ip: IpAddr) -> Option<GeoInfo> {
        let record: CityRecord = self.reader.as_ref()?.lookup(ip).ok()?;

        Some(GeoInfo {
            country: record.country.as_ref().and_then(NamedRecord::name),
            country_code: record.country.as_ref().and_then(|c| c.iso_code.clone()),
            region: record
                .subdivisions
                .as_ref()
                .and_then(|s| s.first())
                .and_then(NamedRecord::name),
            city: record.city.as_ref().and_then(NamedRecord::name),
            ..GeoInfo::default()
        })
    }

    async fn lookup_online(&self, provider: GeoProvider, ip: IpAddr) -> anyhow::Result<Option<GeoInfo>> {
        let data: Value = self
            .client
            .get(provider.url(ip))
            .send()
            .await?
            .json()
            .await?;
        Ok(provider.parse(&data))
    }
}

#[async_trait]
impl GeoLookup for HttpGeoLookup {
    async fn lookup(&self, ip: IpAddr) -> GeoInfo {
        let mut info = GeoInfo::unknown();

        if let Some(offline) = self.lookup_offline(ip) {
            info.merge(offline);
        }

        for provider in &self.providers {
            if info.is_complete() {
                break;
            }
            match self.lookup_online(*provider, ip).await {
                Ok(Some(found)) => info.merge(found),
                Ok(None) => debug!("{:?} 未返回 {} 的归属地", provider, ip),
                Err(e) => debug!("{:?} 查询 {} 失败: {}", provider, ip, e),
            }
        }

        info
    }
}
