//! 检测结果的文本展示

use crate::check::{Connectivity, ProbeResult};
use crate::score::{QualityScore, ScoredResult};
use crate::subscription::SubscriptionBundle;
use chrono::Utc;
use std::fmt::Write;

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

fn score_emoji(score: u8) -> &'static str {
    match score {
        90..=u8::MAX => "🏆",
        80..=89 => "🥇",
        60..=79 => "🥈",
        40..=59 => "🥉",
        _ => "📊",
    }
}

/// 单个节点的结果块
pub fn format_result(result: &ProbeResult, quality: &QualityScore) -> String {
    let node = &result.node;
    let mut text = String::new();

    let _ = writeln!(text, "{} {}", quality.status.label(), node.name());
    let _ = writeln!(text, "🌐 {}", node.address());
    let _ = writeln!(text, "🔗 {}", node.protocol().as_str().to_uppercase());

    if !result.is_connected() {
        let reason = match (&result.connectivity, &result.error) {
            (_, Some(error)) => error.to_string(),
            (Connectivity::NotAttempted, None) => "未检测".to_string(),
            (other, None) => other.to_string(),
        };
        let _ = writeln!(text, "❌ {}", reason);
        let _ = writeln!(text, "📊 综合评分: {}/100", quality.score);
        return text;
    }

    if let Some(geo) = &result.geo {
        let _ = writeln!(text, "📍 {}", geo.region_label());
        if let Some(isp) = &geo.isp {
            let _ = writeln!(text, "🏢 {}", isp);
        }
    }

    if let Some(latency) = result.latency_ms {
        let _ = write!(text, "⏱️ 延迟: {:.0}ms", latency);
        if let Some(avg) = result.stability.as_ref().and_then(|s| s.avg_ms) {
            let _ = write!(text, " (平均: {:.0}ms)", avg);
        }
        text.push('\n');
    }

    if let Some(stability) = &result.stability {
        match stability.jitter_ms {
            Some(jitter) => {
                let _ = write!(text, "📊 抖动: {:.0}ms", jitter);
            }
            None => text.push_str("📊 抖动: -"),
        }
        let _ = writeln!(text, " | 丢包: {:.1}%", stability.packet_loss_pct);
    }

    if result.speed_test_failed {
        text.push_str("⚡ 测速失败\n");
    } else if result.throughput_mbps > 0.0 {
        let _ = write!(text, "⚡ 下载: {:.2} Mbps", result.throughput_mbps);
        if let Some(first_byte) = result.first_byte_latency_ms {
            let _ = write!(text, " | 首字节: {:.0}ms", first_byte);
        }
        text.push('\n');
        if let Some(endpoint) = &result.speed_endpoint {
            let _ = writeln!(text, "🎯 测试服务器: {}", endpoint);
        }
    }

    if let Some(unlock) = &result.unlock {
        let summary = &unlock.summary;
        let _ = writeln!(
            text,
            "🔓 解锁: {}/{} ({:.1}%)",
            summary.unlocked_count, summary.total_count, summary.unlock_rate_pct
        );
    }

    let _ = writeln!(
        text,
        "{} 综合评分: {}/100",
        score_emoji(quality.score),
        quality.score
    );
    text
}

/// 整批结果，调用方需先按分数排序
pub fn format_batch(results: &[ScoredResult]) -> String {
    let mut text = String::new();
    let total = results.len();
    let connected = results.iter().filter(|r| r.result.is_connected()).count();

    let _ = writeln!(text, "检测结果:");
    let _ = writeln!(text, "{:=<80}", "");

    for (i, scored) in results.iter().enumerate() {
        let _ = write!(text, "{}. ", i + 1);
        text.push_str(&format_result(&scored.result, &scored.quality));
        let _ = writeln!(text, "{:-<80}", "");
    }

    let _ = writeln!(text, "\n检测摘要:");
    let _ = writeln!(text, "{:=<80}", "");
    let _ = writeln!(text, "总节点数: {}", total);
    if total > 0 {
        let _ = writeln!(
            text,
            "可用节点: {} ({:.1}%)",
            connected,
            connected as f64 / total as f64 * 100.0
        );
    }

    let best: Vec<&ScoredResult> = results
        .iter()
        .filter(|r| r.quality.score > 0)
        .take(3)
        .collect();
    if !best.is_empty() {
        let _ = writeln!(text, "最佳节点:");
        for (i, scored) in best.iter().enumerate() {
            let _ = writeln!(
                text,
                "  {}. {} - {}/100 ({:.2} Mbps)",
                i + 1,
                scored.result.node.name(),
                scored.quality.score,
                scored.result.throughput_mbps
            );
        }
    }

    text
}

fn usage_bar(percent: f64) -> String {
    let filled = ((percent.clamp(0.0, 100.0) / 100.0) * 20.0).round() as usize;
    format!("{}{}", "█".repeat(filled), "░".repeat(20 - filled))
}

/// 订阅概况：节点数、协议分布、流量与到期时间
pub fn format_subscription(bundle: &SubscriptionBundle) -> String {
    let mut text = String::new();

    let _ = writeln!(
        text,
        "📡 订阅: {}",
        bundle.profile_name.as_deref().unwrap_or(&bundle.url)
    );
    let _ = writeln!(
        text,
        "   节点: {} 个，跳过 {} 行{}",
        bundle.nodes.len(),
        bundle.skipped(),
        if bundle.decoded.is_some() {
            " (base64)"
        } else {
            ""
        }
    );

    let counts = bundle.protocol_counts();
    if !counts.is_empty() {
        let parts: Vec<String> = counts
            .iter()
            .map(|(protocol, count)| format!("{} {}", protocol, count))
            .collect();
        let _ = writeln!(text, "   协议: {}", parts.join(" | "));
    }

    if let Some(quota) = &bundle.quota {
        if let (Some(used), Some(total)) = (quota.used(), quota.total) {
            let percent = quota.usage_percent().unwrap_or(0.0);
            let _ = writeln!(
                text,
                "   流量: [{}] {:.1}% ({} / {})",
                usage_bar(percent),
                percent,
                format_bytes(used),
                format_bytes(total)
            );
        }
        if let Some(remaining) = quota.remaining() {
            let _ = writeln!(text, "   剩余: {}", format_bytes(remaining));
        }
        if let Some(expire) = quota.expire {
            let days = quota.remaining_days(Utc::now()).unwrap_or(0);
            let _ = writeln!(
                text,
                "   到期: {} (剩余 {} 天)",
                expire.format("%Y-%m-%d"),
                days
            );
        }
    }

    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::{LatencyStats, ProbeError};
    use crate::proxy::parse;
    use crate::score::{rank, score};
    use crate::subscription::{QuotaInfo, parse_content};

    fn connected_result() -> ProbeResult {
        let node = parse("trojan://pw@1.2.3.4:443#东京").unwrap();
        let mut result = ProbeResult::new(node);
        result.connectivity = Connectivity::Connected;
        result.latency_ms = Some(30.0);
        result.throughput_mbps = 80.0;
        result.speed_endpoint = Some("Cloudflare".to_string());
        result.stability = Some(LatencyStats::from_samples(&[30.0, 35.0], 2));
        result
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    #[test]
    fn test_format_connected_result() {
        let result = connected_result();
        let text = format_result(&result, &score(&result));

        assert!(text.contains("东京"));
        assert!(text.contains("1.2.3.4:443"));
        assert!(text.contains("TROJAN"));
        assert!(text.contains("80.00 Mbps"));
        assert!(text.contains("Cloudflare"));
        assert!(text.contains("综合评分: 85/100"));
    }

    #[test]
    fn test_format_failed_result_keeps_reason() {
        let node = parse("trojan://pw@1.2.3.4:443#失败").unwrap();
        let result = ProbeResult::failed(node, ProbeError::Refused("connection refused".into()));
        let text = format_result(&result, &score(&result));

        assert!(text.contains("连接被拒绝"));
        assert!(text.contains("综合评分: 0/100"));
    }

    #[test]
    fn test_format_batch_sorted() {
        let failed = ProbeResult::failed(
            parse("trojan://pw@5.6.7.8:443#B").unwrap(),
            ProbeError::NotAttempted,
        );
        let ranked = rank(vec![failed, connected_result()]);
        let text = format_batch(&ranked);

        let first = text.find("东京").unwrap();
        let second = text.find("B\n").unwrap();
        assert!(first < second);
        assert!(text.contains("总节点数: 2"));
        assert!(text.contains("可用节点: 1 (50.0%)"));
    }

    #[test]
    fn test_format_subscription() {
        let mut bundle = parse_content(
            "https://sub.example.com",
            "trojan://pw@1.2.3.4:443#A\nss://aes-256-gcm:pw@5.6.7.8:8388#B\n".to_string(),
        );
        bundle.quota = QuotaInfo::parse_userinfo("upload=0; download=536870912; total=1073741824");

        let text = format_subscription(&bundle);
        assert!(text.contains("节点: 2 个"));
        assert!(text.contains("Trojan 1"));
        assert!(text.contains("50.0%"));
        assert!(text.contains("512.00 MB / 1.00 GB"));
    }
}
