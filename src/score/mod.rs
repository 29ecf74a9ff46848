//! 节点综合评分
//! 连通性、延迟、速度、稳定性与解锁情况加权求和，结果为 0~100

use crate::check::ProbeResult;
use serde::{Deserialize, Serialize};
use std::fmt;

const CONNECTIVITY_POINTS: u32 = 25;

/// (延迟上限 ms, 得分)
const LATENCY_BANDS: [(f64, u32); 4] = [(50.0, 15), (100.0, 12), (200.0, 8), (500.0, 4)];

/// (速度下限 Mbps, 得分)，严格大于下限才得分
const THROUGHPUT_BANDS: [(f64, u32); 7] = [
    (100.0, 40),
    (50.0, 35),
    (20.0, 30),
    (10.0, 25),
    (5.0, 20),
    (1.0, 15),
    (0.1, 10),
];

/// (抖动上限 ms, 得分)
const JITTER_BANDS: [(f64, u32); 3] = [(10.0, 5), (50.0, 3), (100.0, 1)];

/// (丢包率上限 %, 得分)，0% 单独处理
const LOSS_BANDS: [(f64, u32); 2] = [(5.0, 3), (10.0, 1)];

const UNLOCK_MAX_POINTS: u32 = 10;

/// 评分等级，从好到差
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Status {
    Excellent,
    Fast,
    Good,
    Average,
    Poor,
    Unusable,
}

impl Status {
    pub fn from_score(score: u8) -> Self {
        match score {
            80..=u8::MAX => Status::Excellent,
            70..=79 => Status::Fast,
            60..=69 => Status::Good,
            40..=59 => Status::Average,
            20..=39 => Status::Poor,
            _ => Status::Unusable,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Status::Excellent => "🏆 优秀",
            Status::Fast => "🚀 极速",
            Status::Good => "✅ 良好",
            Status::Average => "🐌 一般",
            Status::Poor => "❌ 较差",
            Status::Unusable => "💀 不可用",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityScore {
    pub score: u8,
    pub status: Status,
}

impl QualityScore {
    fn new(score: u32) -> Self {
        let score = score.min(100) as u8;
        Self {
            score,
            status: Status::from_score(score),
        }
    }
}

/// 计算综合评分，任何结果都有分数，未连通直接为 0
pub fn score(result: &ProbeResult) -> QualityScore {
    if !result.is_connected() {
        return QualityScore::new(0);
    }

    let mut total = CONNECTIVITY_POINTS;
    total += result.latency_ms.map(latency_points).unwrap_or(0);
    total += throughput_points(result.throughput_mbps);
    total += result.packet_loss_pct().map(loss_points).unwrap_or(0);
    total += result.jitter_ms().map(jitter_points).unwrap_or(0);
    total += result.unlock_rate().map(unlock_points).unwrap_or(0);

    QualityScore::new(total)
}

/// 带评分的检测结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredResult {
    #[serde(flatten)]
    pub result: ProbeResult,
    pub quality: QualityScore,
}

/// 逐个评分并按分数从高到低排序，同分按延迟升序
pub fn rank(results: Vec<ProbeResult>) -> Vec<ScoredResult> {
    let mut scored: Vec<ScoredResult> = results
        .into_iter()
        .map(|result| ScoredResult {
            quality: score(&result),
            result,
        })
        .collect();

    scored.sort_by(|a, b| {
        b.quality.score.cmp(&a.quality.score).then_with(|| {
            let la = a.result.latency_ms.unwrap_or(f64::MAX);
            let lb = b.result.latency_ms.unwrap_or(f64::MAX);
            la.total_cmp(&lb)
        })
    });
    scored
}

fn below(value: f64, bands: &[(f64, u32)]) -> u32 {
    if !value.is_finite() || value < 0.0 {
        return 0;
    }
    bands
        .iter()
        .find(|(limit, _)| value < *limit)
        .map(|(_, points)| *points)
        .unwrap_or(0)
}

fn latency_points(latency_ms: f64) -> u32 {
    below(latency_ms, &LATENCY_BANDS)
}

fn throughput_points(mbps: f64) -> u32 {
    if !mbps.is_finite() {
        return 0;
    }
    THROUGHPUT_BANDS
        .iter()
        .find(|(floor, _)| mbps > *floor)
        .map(|(_, points)| *points)
        .unwrap_or(0)
}

fn jitter_points(jitter_ms: f64) -> u32 {
    below(jitter_ms, &JITTER_BANDS)
}

fn loss_points(loss_pct: f64) -> u32 {
    if loss_pct == 0.0 {
        5
    } else {
        below(loss_pct, &LOSS_BANDS)
    }
}

/// 每 10% 解锁率得 1 分
fn unlock_points(rate_pct: f64) -> u32 {
    if !rate_pct.is_finite() || rate_pct <= 0.0 {
        return 0;
    }
    ((rate_pct / 10.0) as u32).min(UNLOCK_MAX_POINTS)
}
