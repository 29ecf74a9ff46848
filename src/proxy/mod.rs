//! 节点描述模型
//! 各协议的链接统一解析为 `NodeDescriptor`，凭据按协议区分

mod link;
mod parser;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use thiserror::Error;

pub use parser::{LinkFailure, ParsedLinks, parse, parse_links};
pub(crate) use parser::decode_base64;

/// 节点协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Protocol {
    VMess,
    VLess,
    Shadowsocks,
    Hysteria2,
    Trojan,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::VMess => "VMess",
            Protocol::VLess => "VLess",
            Protocol::Shadowsocks => "Shadowsocks",
            Protocol::Hysteria2 => "Hysteria2",
            Protocol::Trojan => "Trojan",
        }
    }

    /// 未命名节点的占位名称
    pub fn default_name(&self) -> &'static str {
        match self {
            Protocol::VMess => "VMess Node",
            Protocol::VLess => "VLess Node",
            Protocol::Shadowsocks => "SS Node",
            Protocol::Hysteria2 => "Hysteria2 Node",
            Protocol::Trojan => "Trojan Node",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 链接解析错误，只影响单个节点
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("不支持的协议: {0}")]
    UnsupportedProtocol(String),
    #[error("链接格式错误: {0}")]
    InvalidFormat(String),
    #[error("Base64 解码失败: {0}")]
    InvalidBase64(String),
    #[error("JSON 解析失败: {0}")]
    InvalidJson(String),
    #[error("缺少必填字段: {0}")]
    MissingField(&'static str),
    #[error("端口无效: {0}")]
    InvalidPort(String),
}

/// 协议相关的凭据，每个变体只携带本协议的字段
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum Credentials {
    VMess {
        uuid: String,
        alter_id: u16,
        cipher: String,
    },
    VLess {
        uuid: String,
        flow: Option<String>,
        encryption: String,
    },
    Shadowsocks {
        method: String,
        password: String,
        plugin: Option<String>,
    },
    Hysteria2 {
        password: String,
    },
    Trojan {
        password: String,
    },
}

impl Credentials {
    pub fn protocol(&self) -> Protocol {
        match self {
            Credentials::VMess { .. } => Protocol::VMess,
            Credentials::VLess { .. } => Protocol::VLess,
            Credentials::Shadowsocks { .. } => Protocol::Shadowsocks,
            Credentials::Hysteria2 { .. } => Protocol::Hysteria2,
            Credentials::Trojan { .. } => Protocol::Trojan,
        }
    }

    /// 主凭据：UUID 或密码
    pub fn primary_secret(&self) -> &str {
        match self {
            Credentials::VMess { uuid, .. } | Credentials::VLess { uuid, .. } => uuid,
            Credentials::Shadowsocks { password, .. }
            | Credentials::Hysteria2 { password }
            | Credentials::Trojan { password } => password,
        }
    }

    fn mandatory_field(&self) -> &'static str {
        match self {
            Credentials::VMess { .. } | Credentials::VLess { .. } => "uuid",
            _ => "password",
        }
    }
}

/// TLS 模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    #[default]
    None,
    Tls,
    Reality,
}

impl TlsMode {
    pub fn from_param(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "tls" | "xtls" => TlsMode::Tls,
            "reality" => TlsMode::Reality,
            _ => TlsMode::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TlsMode::None => "none",
            TlsMode::Tls => "tls",
            TlsMode::Reality => "reality",
        }
    }
}

/// 传输层参数，缺省时取默认值
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transport {
    /// tcp / ws / grpc / h2 / quic 等
    pub network: String,
    pub tls: TlsMode,
    pub sni: Option<String>,
    /// WS/HTTP 的 Host 头
    pub host: Option<String>,
    pub path: Option<String>,
    /// 伪装类型（VMess 的 type 字段）
    pub header_type: Option<String>,
    pub service_name: Option<String>,
    pub alpn: Option<String>,
    pub fingerprint: Option<String>,
    pub reality_public_key: Option<String>,
    pub reality_short_id: Option<String>,
    pub obfs: Option<String>,
    pub obfs_password: Option<String>,
    pub allow_insecure: bool,
}

impl Default for Transport {
    fn default() -> Self {
        Self {
            network: "tcp".to_string(),
            tls: TlsMode::None,
            sni: None,
            host: None,
            path: None,
            header_type: None,
            service_name: None,
            alpn: None,
            fingerprint: None,
            reality_public_key: None,
            reality_short_id: None,
            obfs: None,
            obfs_password: None,
            allow_insecure: false,
        }
    }
}

/// 解析后的节点，构造后不可变
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawNode")]
pub struct NodeDescriptor {
    name: String,
    host: String,
    port: u16,
    credentials: Credentials,
    transport: Transport,
}

/// 反序列化的中间形态，经 `NodeDescriptor::new` 校验后才能使用
#[derive(Deserialize)]
struct RawNode {
    #[serde(default)]
    name: Option<String>,
    host: String,
    port: u16,
    credentials: Credentials,
    #[serde(default)]
    transport: Transport,
}

impl TryFrom<RawNode> for NodeDescriptor {
    type Error = ParseError;

    fn try_from(raw: RawNode) -> Result<Self, Self::Error> {
        NodeDescriptor::new(raw.name, raw.host, raw.port, raw.credentials, raw.transport)
    }
}

impl NodeDescriptor {
    /// 校验必填字段后构造节点，名称为空时使用协议占位名
    pub fn new(
        name: Option<String>,
        host: String,
        port: u16,
        credentials: Credentials,
        transport: Transport,
    ) -> Result<Self, ParseError> {
        let host = host.trim().trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(ParseError::MissingField("host"));
        }
        if port == 0 {
            return Err(ParseError::InvalidPort("0".to_string()));
        }
        if credentials.primary_secret().is_empty() {
            return Err(ParseError::MissingField(credentials.mandatory_field()));
        }

        let name = name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| credentials.protocol().default_name().to_string());

        Ok(Self {
            name,
            host: host.to_string(),
            port,
            credentials,
            transport,
        })
    }

    pub fn protocol(&self) -> Protocol {
        self.credentials.protocol()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn primary_secret(&self) -> &str {
        self.credentials.primary_secret()
    }

    /// 获取地址（host:port），IPv6 加方括号
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn get_ip_address(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    /// 判断两个节点是否位于同一网段，threshold 越高网段越小
    pub fn is_same_cidr(&self, other: &NodeDescriptor, threshold: f64) -> bool {
        let (Some(ip1), Some(ip2)) = (self.get_ip_address(), other.get_ip_address()) else {
            return false;
        };

        let prefix = match (ip1, ip2) {
            (IpAddr::V4(_), IpAddr::V4(_)) => {
                if threshold >= 1.0 {
                    32
                } else if threshold >= 0.75 {
                    24
                } else if threshold >= 0.5 {
                    16
                } else if threshold >= 0.25 {
                    8
                } else {
                    return false;
                }
            }
            // IPv6 按 /64 比较
            (IpAddr::V6(_), IpAddr::V6(_)) if threshold > 0.0 => 64,
            _ => return false,
        };

        IpNetwork::new(ip1, prefix)
            .map(|network| network.contains(ip2))
            .unwrap_or(false)
    }
}

/// 打乱探测顺序，同网段节点之间至少间隔 min_spacing 个位置。
/// 随机种子由节点列表决定，相同输入得到相同顺序
pub fn smart_shuffle_proxies(proxies: &mut [NodeDescriptor], threshold: f64, min_spacing: usize) {
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;

    if proxies.len() <= min_spacing {
        return;
    }

    let mut rng = StdRng::seed_from_u64(shuffle_seed(proxies));

    // 多次迭代改善分布
    for _ in 0..3 {
        proxies.shuffle(&mut rng);

        for i in 0..proxies.len() {
            for j in (i + 1)..proxies.len().min(i + min_spacing) {
                if proxies[i].is_same_cidr(&proxies[j], threshold) {
                    if let Some(k) = (j + 1..proxies.len()).find(|&k| {
                        !proxies[i].is_same_cidr(&proxies[k], threshold)
                            && !proxies[j].is_same_cidr(&proxies[k], threshold)
                    }) {
                        proxies.swap(j, k);
                    }
                }
            }
        }
    }
}

fn shuffle_seed(proxies: &[NodeDescriptor]) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    for node in proxies {
        node.name.hash(&mut hasher);
        node.host.hash(&mut hasher);
        node.port.hash(&mut hasher);
    }
    hasher.finish()
}
