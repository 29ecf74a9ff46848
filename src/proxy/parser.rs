//! 节点链接解析
//! 按 scheme 前缀分发到各协议解析函数，所有函数均为纯函数

use super::{Credentials, NodeDescriptor, ParseError, TlsMode, Transport};
use base64::{Engine as _, engine::general_purpose};
use log::debug;
use serde_json::Value;
use std::collections::HashMap;
use url::Url;

/// Shadowsocks 旧格式缺少加密方式时的默认值
const DEFAULT_SS_METHOD: &str = "aes-256-gcm";

/// 解析单条节点链接
pub fn parse(link: &str) -> Result<NodeDescriptor, ParseError> {
    let link = link.trim();
    let (scheme, body) = link
        .split_once("://")
        .ok_or_else(|| ParseError::UnsupportedProtocol(truncate(link, 16)))?;

    match scheme.to_ascii_lowercase().as_str() {
        "vmess" => parse_vmess(body),
        "vless" => parse_vless(link),
        "ss" => parse_shadowsocks(body),
        "hy2" | "hysteria2" => parse_hysteria2(link),
        "trojan" => parse_trojan(link),
        other => Err(ParseError::UnsupportedProtocol(other.to_string())),
    }
}

/// 单行解析失败记录
#[derive(Debug, Clone, PartialEq)]
pub struct LinkFailure {
    /// 行号（从 1 开始）
    pub line: usize,
    pub link: String,
    pub error: ParseError,
}

/// 多行链接的解析结果
#[derive(Debug, Clone, Default)]
pub struct ParsedLinks {
    pub nodes: Vec<NodeDescriptor>,
    pub failures: Vec<LinkFailure>,
}

/// 逐行解析链接文本，空行忽略，单行失败不影响其他行
pub fn parse_links(text: &str) -> ParsedLinks {
    let mut parsed = ParsedLinks::default();

    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match parse(line) {
            Ok(node) => parsed.nodes.push(node),
            Err(error) => {
                debug!("第 {} 行解析失败 ({}): {}", index + 1, truncate(line, 32), error);
                parsed.failures.push(LinkFailure {
                    line: index + 1,
                    link: line.to_string(),
                    error,
                });
            }
        }
    }

    parsed
}

/// Base64 解码，补齐缺失的 `=` 后依次尝试标准和 URL 安全字母表
pub(crate) fn decode_base64(input: &str) -> Result<String, ParseError> {
    let clean: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    if clean.is_empty() {
        return Err(ParseError::InvalidBase64("内容为空".to_string()));
    }

    let mut padded = clean;
    let remainder = padded.len() % 4;
    if remainder != 0 {
        padded.push_str(&"=".repeat(4 - remainder));
    }

    let bytes = general_purpose::STANDARD
        .decode(&padded)
        .or_else(|_| general_purpose::URL_SAFE.decode(&padded))
        .map_err(|e| ParseError::InvalidBase64(e.to_string()))?;

    String::from_utf8(bytes).map_err(|_| ParseError::InvalidBase64("解码结果不是 UTF-8".to_string()))
}

fn parse_vmess(body: &str) -> Result<NodeDescriptor, ParseError> {
    let payload = body.split(['#', '?']).next().unwrap_or_default();
    let decoded = decode_base64(payload)?;

    let json: Value =
        serde_json::from_str(decoded.trim()).map_err(|e| ParseError::InvalidJson(e.to_string()))?;
    if !json.is_object() {
        return Err(ParseError::InvalidJson("不是 JSON 对象".to_string()));
    }

    let host = json_str(&json, "add").ok_or(ParseError::MissingField("host"))?;
    let port = json_port(json.get("port"))?;
    let alter_id = json
        .get("aid")
        .and_then(json_u64)
        .and_then(|aid| u16::try_from(aid).ok())
        .unwrap_or(0);

    let credentials = Credentials::VMess {
        uuid: json_str(&json, "id").unwrap_or_default(),
        alter_id,
        cipher: json_str(&json, "scy").unwrap_or_else(|| "auto".to_string()),
    };

    let transport = Transport {
        network: json_str(&json, "net")
            .map(|n| n.to_ascii_lowercase())
            .unwrap_or_else(|| "tcp".to_string()),
        tls: json_str(&json, "tls")
            .map(|t| TlsMode::from_param(&t))
            .unwrap_or_default(),
        sni: json_str(&json, "sni"),
        host: json_str(&json, "host"),
        path: json_str(&json, "path"),
        header_type: json_str(&json, "type"),
        alpn: json_str(&json, "alpn"),
        fingerprint: json_str(&json, "fp"),
        ..Transport::default()
    };

    NodeDescriptor::new(json_str(&json, "ps"), host, port, credentials, transport)
}

fn parse_vless(link: &str) -> Result<NodeDescriptor, ParseError> {
    let parts = split_uri(link)?;
    let query = &parts.query;

    let credentials = Credentials::VLess {
        uuid: parts.secret.clone(),
        flow: param(query, "flow"),
        encryption: param(query, "encryption").unwrap_or_else(|| "none".to_string()),
    };
    let transport = uri_transport(query, TlsMode::None);

    NodeDescriptor::new(
        parts.name,
        parts.host,
        parts.port.unwrap_or(443),
        credentials,
        transport,
    )
}

fn parse_trojan(link: &str) -> Result<NodeDescriptor, ParseError> {
    let parts = split_uri(link)?;
    let transport = uri_transport(&parts.query, TlsMode::Tls);

    NodeDescriptor::new(
        parts.name,
        parts.host,
        parts.port.unwrap_or(443),
        Credentials::Trojan {
            password: parts.secret,
        },
        transport,
    )
}

fn parse_hysteria2(link: &str) -> Result<NodeDescriptor, ParseError> {
    let parts = split_uri(link)?;
    let query = &parts.query;

    let password = if parts.secret.is_empty() {
        param(query, "auth").unwrap_or_default()
    } else {
        parts.secret.clone()
    };

    let transport = Transport {
        network: "quic".to_string(),
        tls: TlsMode::Tls,
        sni: param(query, "sni"),
        alpn: param(query, "alpn"),
        obfs: param(query, "obfs"),
        obfs_password: param(query, "obfs-password"),
        allow_insecure: flag(query, "insecure"),
        ..Transport::default()
    };

    NodeDescriptor::new(
        parts.name,
        parts.host,
        parts.port.unwrap_or(443),
        Credentials::Hysteria2 { password },
        transport,
    )
}

fn parse_shadowsocks(body: &str) -> Result<NodeDescriptor, ParseError> {
    let (rest, name) = match body.split_once('#') {
        Some((rest, fragment)) => (rest, Some(percent_decode(fragment))),
        None => (body, None),
    };
    let (main, query) = rest.trim().split_once('?').unwrap_or((rest.trim(), ""));

    let ((method, password), server) = match main.rsplit_once('@') {
        Some((userinfo, server)) => (
            decode_ss_userinfo(userinfo)?,
            server.trim_end_matches('/').to_string(),
        ),
        None => {
            // 旧格式：base64(method:password@host:port)
            let decoded = decode_base64(main)?;
            let (userinfo, server) = decoded
                .rsplit_once('@')
                .ok_or_else(|| ParseError::InvalidFormat("缺少服务器地址".to_string()))?;
            (split_method_password(userinfo), server.trim().to_string())
        }
    };

    let (host, port) = split_host_port(&server, 8388)?;
    let plugin = url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "plugin")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty());

    NodeDescriptor::new(
        name,
        host,
        port,
        Credentials::Shadowsocks {
            method,
            password,
            plugin,
        },
        Transport::default(),
    )
}

/// userinfo 为明文 `method:password` 或其 base64
fn decode_ss_userinfo(userinfo: &str) -> Result<(String, String), ParseError> {
    let userinfo = percent_decode(userinfo);
    if let Some((method, password)) = userinfo.split_once(':') {
        return Ok((method.to_string(), password.to_string()));
    }

    let decoded = decode_base64(&userinfo)?;
    Ok(split_method_password(&decoded))
}

fn split_method_password(raw: &str) -> (String, String) {
    match raw.split_once(':') {
        Some((method, password)) => (method.to_string(), password.to_string()),
        None => (DEFAULT_SS_METHOD.to_string(), raw.to_string()),
    }
}

fn split_host_port(server: &str, default_port: u16) -> Result<(String, u16), ParseError> {
    let server = server.trim();

    if let Some(rest) = server.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| ParseError::InvalidFormat(format!("IPv6 地址不完整: {}", server)))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => parse_port(port)?,
            None if tail.is_empty() => default_port,
            None => return Err(ParseError::InvalidFormat(server.to_string())),
        };
        return Ok((host.to_string(), port));
    }

    match server.rsplit_once(':') {
        Some((host, port)) => Ok((host.to_string(), parse_port(port)?)),
        None => Ok((server.to_string(), default_port)),
    }
}

/// 标准 URI 形式链接的各部分
struct UriParts {
    secret: String,
    host: String,
    port: Option<u16>,
    query: HashMap<String, String>,
    name: Option<String>,
}

fn split_uri(link: &str) -> Result<UriParts, ParseError> {
    let url = Url::parse(link).map_err(|e| match e {
        url::ParseError::InvalidPort => ParseError::InvalidPort(truncate(link, 48)),
        other => ParseError::InvalidFormat(other.to_string()),
    })?;

    let mut secret = percent_decode(url.username());
    if let Some(password) = url.password() {
        secret = format!("{}:{}", secret, percent_decode(password));
    }

    let host = url
        .host_str()
        .map(str::to_string)
        .filter(|h| !h.is_empty())
        .ok_or(ParseError::MissingField("host"))?;

    let query = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    Ok(UriParts {
        secret,
        host,
        port: url.port(),
        query,
        name: url.fragment().map(percent_decode),
    })
}

fn uri_transport(query: &HashMap<String, String>, default_tls: TlsMode) -> Transport {
    Transport {
        network: param(query, "type")
            .map(|n| n.to_ascii_lowercase())
            .unwrap_or_else(|| "tcp".to_string()),
        tls: param(query, "security")
            .map(|s| TlsMode::from_param(&s))
            .unwrap_or(default_tls),
        sni: param(query, "sni").or_else(|| param(query, "peer")),
        host: param(query, "host"),
        path: param(query, "path"),
        header_type: param(query, "headerType"),
        service_name: param(query, "serviceName"),
        alpn: param(query, "alpn"),
        fingerprint: param(query, "fp"),
        reality_public_key: param(query, "pbk"),
        reality_short_id: param(query, "sid"),
        allow_insecure: flag(query, "allowInsecure") || flag(query, "insecure"),
        ..Transport::default()
    }
}

fn param(query: &HashMap<String, String>, key: &str) -> Option<String> {
    query
        .get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn flag(query: &HashMap<String, String>, key: &str) -> bool {
    matches!(
        param(query, key).as_deref(),
        Some("1") | Some("true") | Some("True")
    )
}

fn parse_port(raw: &str) -> Result<u16, ParseError> {
    match raw.trim().parse::<u32>() {
        Ok(port) if (1..=65535).contains(&port) => Ok(port as u16),
        _ => Err(ParseError::InvalidPort(raw.to_string())),
    }
}

fn json_str(json: &Value, key: &str) -> Option<String> {
    let value = match json.get(key)? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!value.is_empty()).then_some(value)
}

fn json_u64(value: &Value) -> Option<u64> {
    value.as_u64().or_else(|| value.as_str()?.trim().parse().ok())
}

fn json_port(value: Option<&Value>) -> Result<u16, ParseError> {
    match value {
        None | Some(Value::Null) => Err(ParseError::MissingField("port")),
        Some(Value::Number(n)) => parse_port(&n.to_string()),
        Some(Value::String(s)) => parse_port(s),
        Some(other) => Err(ParseError::InvalidPort(other.to_string())),
    }
}

fn percent_decode(raw: &str) -> String {
    urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

fn truncate(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}
