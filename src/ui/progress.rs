use crate::check::ProbeResult;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::sync::Arc;

#[derive(Clone)]
pub struct ProgressTracker {
    multi_progress: Option<Arc<MultiProgress>>,
    total_progress: Option<ProgressBar>,
    alive_progress: Option<ProgressBar>,
    speed_progress: Option<ProgressBar>,
}

fn style(template: &str, chars: &str) -> ProgressStyle {
    ProgressStyle::with_template(template)
        .map(|s| s.progress_chars(chars))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

impl ProgressTracker {
    pub fn new(enabled: bool) -> Self {
        if !enabled {
            return Self::disabled();
        }

        let multi_progress = Arc::new(MultiProgress::new());

        // 总进度条
        let total_progress = multi_progress.add(ProgressBar::new(0));
        total_progress.set_style(style(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
            "#>-",
        ));

        // 连通性结果
        let alive_progress = multi_progress.add(ProgressBar::new(0));
        alive_progress.set_style(style(
            "  {spinner:.yellow} 连通检测: [{bar:30.yellow}] {pos}/{len} {msg}",
            "█▉▊▋▌▍▎▏  ",
        ));

        // 测速结果
        let speed_progress = multi_progress.add(ProgressBar::new(0));
        speed_progress.set_style(style(
            "  {spinner:.green} 下载测速: [{bar:30.green}] {pos}/{len} {msg}",
            "█▉▊▋▌▍▎▏  ",
        ));

        Self {
            multi_progress: Some(multi_progress),
            total_progress: Some(total_progress),
            alive_progress: Some(alive_progress),
            speed_progress: Some(speed_progress),
        }
    }

    pub fn disabled() -> Self {
        Self {
            multi_progress: None,
            total_progress: None,
            alive_progress: None,
            speed_progress: None,
        }
    }

    pub fn set_total_nodes(&self, total: u64) {
        for pb in [&self.total_progress, &self.alive_progress, &self.speed_progress]
            .into_iter()
            .flatten()
        {
            pb.set_length(total);
            pb.set_position(0);
        }
    }

    /// 收到一个节点结果
    pub fn record(&self, result: &ProbeResult) {
        if let Some(pb) = &self.total_progress {
            pb.inc(1);
            pb.set_message(result.node.name().to_string());
        }

        if let Some(pb) = &self.alive_progress {
            pb.inc(1);
            pb.set_message(if result.is_connected() { "✅" } else { "❌" });
        }

        if let Some(pb) = &self.speed_progress {
            pb.inc(1);
            pb.set_message(if result.throughput_mbps > 0.0 { "✅" } else { "❌" });
        }
    }

    pub fn finalize(&self) {
        for pb in [&self.alive_progress, &self.speed_progress].into_iter().flatten() {
            pb.finish_with_message("完成");
        }
        if let Some(pb) = &self.total_progress {
            pb.finish_with_message("检测完成");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.multi_progress.is_some()
    }
}
