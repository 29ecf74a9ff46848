//! 节点重新编码为分享链接

use super::{Credentials, NodeDescriptor, TlsMode};
use base64::{Engine as _, engine::general_purpose};
use serde_json::json;

impl NodeDescriptor {
    /// 生成标准分享链接，解析后必填字段保持不变
    pub fn to_link(&self) -> String {
        let transport = &self.transport;

        match &self.credentials {
            Credentials::VMess {
                uuid,
                alter_id,
                cipher,
            } => {
                let tls = match transport.tls {
                    TlsMode::None => "",
                    other => other.as_str(),
                };
                let payload = json!({
                    "v": "2",
                    "ps": self.name,
                    "add": self.host,
                    "port": self.port.to_string(),
                    "id": uuid,
                    "aid": alter_id.to_string(),
                    "scy": cipher,
                    "net": transport.network,
                    "type": transport.header_type.as_deref().unwrap_or("none"),
                    "host": transport.host.as_deref().unwrap_or_default(),
                    "path": transport.path.as_deref().unwrap_or_default(),
                    "tls": tls,
                    "sni": transport.sni.as_deref().unwrap_or_default(),
                    "alpn": transport.alpn.as_deref().unwrap_or_default(),
                    "fp": transport.fingerprint.as_deref().unwrap_or_default(),
                });
                format!(
                    "vmess://{}",
                    general_purpose::STANDARD.encode(payload.to_string())
                )
            }
            Credentials::VLess {
                uuid,
                flow,
                encryption,
            } => {
                let mut query = self.stream_params();
                query.push(("encryption", encryption.clone()));
                if let Some(flow) = flow {
                    query.push(("flow", flow.clone()));
                }
                self.uri_link("vless", uuid, &query)
            }
            Credentials::Trojan { password } => {
                let query = self.stream_params();
                self.uri_link("trojan", password, &query)
            }
            Credentials::Hysteria2 { password } => {
                let mut query = Vec::new();
                push_opt(&mut query, "sni", &transport.sni);
                push_opt(&mut query, "alpn", &transport.alpn);
                push_opt(&mut query, "obfs", &transport.obfs);
                push_opt(&mut query, "obfs-password", &transport.obfs_password);
                if transport.allow_insecure {
                    query.push(("insecure", "1".to_string()));
                }
                self.uri_link("hysteria2", password, &query)
            }
            Credentials::Shadowsocks {
                method,
                password,
                plugin,
            } => {
                // SIP002: userinfo 使用 URL 安全 base64
                let userinfo =
                    general_purpose::URL_SAFE_NO_PAD.encode(format!("{}:{}", method, password));
                let plugin = plugin
                    .as_ref()
                    .map(|p| format!("/?plugin={}", urlencoding::encode(p)))
                    .unwrap_or_default();
                format!(
                    "ss://{}@{}{}#{}",
                    userinfo,
                    self.address(),
                    plugin,
                    urlencoding::encode(&self.name)
                )
            }
        }
    }

    /// VLess / Trojan 共用的传输层参数
    fn stream_params(&self) -> Vec<(&'static str, String)> {
        let transport = &self.transport;
        let mut query = vec![
            ("type", transport.network.clone()),
            ("security", transport.tls.as_str().to_string()),
        ];
        push_opt(&mut query, "sni", &transport.sni);
        push_opt(&mut query, "host", &transport.host);
        push_opt(&mut query, "path", &transport.path);
        push_opt(&mut query, "headerType", &transport.header_type);
        push_opt(&mut query, "serviceName", &transport.service_name);
        push_opt(&mut query, "alpn", &transport.alpn);
        push_opt(&mut query, "fp", &transport.fingerprint);
        push_opt(&mut query, "pbk", &transport.reality_public_key);
        push_opt(&mut query, "sid", &transport.reality_short_id);
        if transport.allow_insecure {
            query.push(("allowInsecure", "1".to_string()));
        }
        query
    }

    fn uri_link(&self, scheme: &str, secret: &str, query: &[(&'static str, String)]) -> String {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (key, value) in query {
            serializer.append_pair(key, value);
        }
        let query = serializer.finish();

        format!(
            "{}://{}@{}{}#{}",
            scheme,
            urlencoding::encode(secret),
            self.address(),
            if query.is_empty() {
                String::new()
            } else {
                format!("?{}", query)
            },
            urlencoding::encode(&self.name)
        )
    }
}

fn push_opt(query: &mut Vec<(&'static str, String)>, key: &'static str, value: &Option<String>) {
    if let Some(value) = value {
        query.push((key, value.clone()));
    }
}
