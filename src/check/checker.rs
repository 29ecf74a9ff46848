//! 并发调度
//! 固定数量的 worker 从队列取节点，结果经通道汇总到单个收集任务

use super::{ProbeError, ProbeResult, Prober, deadline_after};
use crate::proxy::{NodeDescriptor, smart_shuffle_proxies};
use crate::ui::progress::ProgressTracker;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinError;
use tokio::time::{Instant, timeout};

#[derive(Debug, Clone)]
pub struct CheckerSettings {
    pub workers: usize,
    pub per_node_budget: Duration,
    pub batch_budget: Duration,
    /// 单节点超出预算后再等待的时间，之后强制结束
    pub grace: Duration,
    pub smart_shuffle: bool,
    pub cidr_threshold: f64,
    pub print_progress: bool,
}

impl Default for CheckerSettings {
    fn default() -> Self {
        Self {
            workers: 3,
            per_node_budget: Duration::from_secs(90),
            batch_budget: Duration::from_secs(900),
            grace: Duration::from_secs(5),
            smart_shuffle: true,
            cidr_threshold: 0.75,
            print_progress: false,
        }
    }
}

#[derive(Default)]
pub struct Stats {
    pub total_nodes: AtomicU64,
    pub checked_nodes: AtomicU64,
    pub connected_nodes: AtomicU64,
    pub failed_nodes: AtomicU64,
    pub not_attempted_nodes: AtomicU64,
    pub total_bytes: AtomicU64,
}

/// 统计快照，便于展示与保存
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total: u64,
    pub checked: u64,
    pub connected: u64,
    pub failed: u64,
    pub not_attempted: u64,
    pub total_bytes: u64,
}

impl StatsSnapshot {
    pub fn success_rate(&self) -> f64 {
        if self.total > 0 {
            (self.connected as f64 / self.total as f64) * 100.0
        } else {
            0.0
        }
    }
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    fn reset(&self, total: u64) {
        self.total_nodes.store(total, Ordering::Relaxed);
        for counter in [
            &self.checked_nodes,
            &self.connected_nodes,
            &self.failed_nodes,
            &self.not_attempted_nodes,
            &self.total_bytes,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    fn record(&self, result: &ProbeResult) {
        if result.connectivity == super::Connectivity::NotAttempted {
            self.not_attempted_nodes.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.checked_nodes.fetch_add(1, Ordering::Relaxed);
        if result.is_connected() {
            self.connected_nodes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_nodes.fetch_add(1, Ordering::Relaxed);
        }
        self.total_bytes
            .fetch_add(result.downloaded_bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total: self.total_nodes.load(Ordering::Relaxed),
            checked: self.checked_nodes.load(Ordering::Relaxed),
            connected: self.connected_nodes.load(Ordering::Relaxed),
            failed: self.failed_nodes.load(Ordering::Relaxed),
            not_attempted: self.not_attempted_nodes.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
        }
    }

    pub fn get_success_rate(&self) -> f64 {
        self.snapshot().success_rate()
    }
}

pub struct ProxyChecker {
    prober: Arc<dyn Prober>,
    settings: CheckerSettings,
    stats: Arc<Stats>,
}

impl ProxyChecker {
    pub fn new(prober: Arc<dyn Prober>, settings: CheckerSettings) -> Self {
        Self {
            prober,
            settings,
            stats: Arc::new(Stats::new()),
        }
    }

    /// 探测全部节点，每个输入节点恰好对应一个结果，按完成顺序返回
    pub async fn check_proxies(&self, proxies: Vec<NodeDescriptor>) -> Vec<ProbeResult> {
        let total = proxies.len();
        self.stats.reset(total as u64);
        if total == 0 {
            return Vec::new();
        }

        let workers = self.settings.workers.clamp(1, total);
        let mut proxies = proxies;
        if self.settings.smart_shuffle {
            smart_shuffle_proxies(&mut proxies, self.settings.cidr_threshold, workers);
        }

        let progress = ProgressTracker::new(self.settings.print_progress);
        progress.set_total_nodes(total as u64);

        info!(
            "开始检测 {} 个节点，并发 {}，单节点 {}s，总时限 {}s",
            total,
            workers,
            self.settings.per_node_budget.as_secs(),
            self.settings.batch_budget.as_secs()
        );

        let proxies = Arc::new(proxies);
        let queue = Arc::new(Mutex::new((0..total).collect::<VecDeque<usize>>()));
        let batch_deadline = deadline_after(self.settings.batch_budget);

        // 创建通道用于收集结果
        let (tx, mut rx) = mpsc::channel::<(usize, ProbeResult)>(workers * 2);

        let mut tasks = Vec::with_capacity(workers);
        for _ in 0..workers {
            let tx = tx.clone();
            let queue = queue.clone();
            let proxies = proxies.clone();
            let prober = self.prober.clone();
            let budget = self.settings.per_node_budget;
            let grace = self.settings.grace;

            tasks.push(tokio::spawn(async move {
                loop {
                    let Some(index) = queue.lock().await.pop_front() else {
                        break;
                    };
                    let node = proxies[index].clone();

                    let left = batch_deadline.saturating_duration_since(Instant::now());
                    let result = if left.is_zero() {
                        ProbeResult::not_attempted(node)
                    } else {
                        // 临近总时限时缩短单节点预算，留出时间让探测自行收尾
                        let reserve = grace.min(left / 10);
                        let node_budget = budget.min(left - reserve);
                        let hard_limit = budget.saturating_add(grace).min(left);
                        run_guarded(prober.clone(), node, node_budget, hard_limit).await
                    };

                    if tx.send((index, result)).await.is_err() {
                        break;
                    }
                }
            }));
        }

        // 关闭发送端，这样接收端在收完所有消息后会结束
        drop(tx);

        let mut seen = vec![false; total];
        let mut results = Vec::with_capacity(total);

        while let Some((index, result)) = rx.recv().await {
            if std::mem::replace(&mut seen[index], true) {
                warn!("节点 #{} 重复返回结果，已忽略", index);
                continue;
            }
            self.stats.record(&result);
            progress.record(&result);
            results.push(result);

            // 不显示进度条时改为写日志
            if !progress.is_enabled() {
                debug!("检测进度 {}/{}", results.len(), total);
            }
        }

        for task in tasks {
            if let Err(e) = task.await {
                error!("检测 worker 异常退出: {}", e);
            }
        }

        // worker 异常时补齐缺失的结果
        for (index, _) in seen.iter().enumerate().filter(|(_, seen)| !**seen) {
            let result = ProbeResult::failed(
                proxies[index].clone(),
                ProbeError::Internal("检测任务未返回结果".to_string()),
            );
            self.stats.record(&result);
            progress.record(&result);
            results.push(result);
        }

        progress.finalize();
        results
    }

    pub fn print_stats(&self) {
        let stats = self.stats.snapshot();

        println!("检测统计:");
        println!("  总节点数: {}", stats.total);
        println!("  已检测数: {}", stats.checked);
        println!("  可用节点: {}", stats.connected);
        println!("  失败节点: {}", stats.failed);
        if stats.not_attempted > 0 {
            println!("  未检测数: {}", stats.not_attempted);
        }
        println!(
            "  总消耗流量: {:.3} GB",
            stats.total_bytes as f64 / 1024.0 / 1024.0 / 1024.0
        );

        if stats.total > 0 {
            println!("  成功率: {:.2}%", stats.success_rate());
        }
    }

    pub fn get_stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }
}

/// 在独立任务中运行探测，崩溃或超过 hard_limit 都转换为结果
async fn run_guarded(
    prober: Arc<dyn Prober>,
    node: NodeDescriptor,
    budget: Duration,
    hard_limit: Duration,
) -> ProbeResult {
    let task_node = node.clone();
    let handle = tokio::spawn(async move { prober.probe(&task_node, budget).await });
    let abort = handle.abort_handle();

    match timeout(hard_limit, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            let message = join_error_message(e);
            error!("节点 {} 检测异常: {}", node.name(), message);
            ProbeResult::failed(node, ProbeError::Internal(message))
        }
        Err(_) => {
            abort.abort();
            warn!("节点 {} 超出检测时限，已强制结束", node.name());
            ProbeResult::failed(node, ProbeError::BudgetExhausted)
        }
    }
}

fn join_error_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload: Box<dyn Any + Send> = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::Connectivity;
    use crate::proxy::{Credentials, Transport};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    fn nodes(count: usize) -> Vec<NodeDescriptor> {
        (0..count)
            .map(|i| {
                NodeDescriptor::new(
                    Some(format!("node-{}", i)),
                    format!("10.0.{}.{}", i / 250, i % 250 + 1),
                    443,
                    Credentials::Trojan {
                        password: "pw".to_string(),
                    },
                    Transport::default(),
                )
                .unwrap()
            })
            .collect()
    }

    fn settings(workers: usize) -> CheckerSettings {
        CheckerSettings {
            workers,
            per_node_budget: Duration::from_secs(5),
            batch_budget: Duration::from_secs(30),
            grace: Duration::from_millis(200),
            smart_shuffle: false,
            ..CheckerSettings::default()
        }
    }

    /// 按节点名决定行为的测试探测器
    struct ScriptedProber {
        active: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedProber {
        fn new(delay: Duration) -> Self {
            Self {
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                delay,
            }
        }
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self, node: &NodeDescriptor, _budget: Duration) -> ProbeResult {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            let index: usize = node.name().trim_start_matches("node-").parse().unwrap();
            if index % 4 == 1 {
                panic!("boom {}", index);
            }
            if index % 4 == 2 {
                return ProbeResult::failed(node.clone(), ProbeError::Refused("refused".into()));
            }
            let mut result = ProbeResult::new(node.clone());
            result.connectivity = Connectivity::Connected;
            result.downloaded_bytes = 10;
            result
        }
    }

    struct HangingProber;

    /// 按收到的预算睡眠，并记录最大的预算
    struct BudgetAwareProber {
        largest_budget: std::sync::Mutex<Duration>,
    }

    #[async_trait]
    impl Prober for BudgetAwareProber {
        async fn probe(&self, node: &NodeDescriptor, budget: Duration) -> ProbeResult {
            {
                let mut largest = self.largest_budget.lock().unwrap();
                *largest = (*largest).max(budget);
            }
            tokio::time::sleep(budget.min(Duration::from_secs(2))).await;
            let mut result = ProbeResult::new(node.clone());
            result.connectivity = Connectivity::Connected;
            result
        }
    }

    #[async_trait]
    impl Prober for HangingProber {
        async fn probe(&self, node: &NodeDescriptor, _budget: Duration) -> ProbeResult {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            ProbeResult::new(node.clone())
        }
    }

    fn names(results: &[ProbeResult]) -> HashSet<String> {
        results.iter().map(|r| r.node.name().to_string()).collect()
    }

    #[tokio::test]
    async fn test_one_result_per_node_despite_panics() {
        let prober = Arc::new(ScriptedProber::new(Duration::from_millis(20)));
        let checker = ProxyChecker::new(prober.clone(), settings(3));

        let results = checker.check_proxies(nodes(12)).await;

        assert_eq!(results.len(), 12);
        assert_eq!(names(&results).len(), 12);
        assert!(prober.peak.load(Ordering::SeqCst) <= 3);

        let errors: Vec<_> = results
            .iter()
            .filter(|r| r.connectivity == Connectivity::Error)
            .collect();
        assert_eq!(errors.len(), 3);
        assert!(
            errors
                .iter()
                .all(|r| matches!(&r.error, Some(ProbeError::Internal(m)) if m.starts_with("boom")))
        );

        let stats = checker.get_stats().snapshot();
        assert_eq!(stats.total, 12);
        assert_eq!(stats.checked, 12);
        assert_eq!(stats.connected, 6);
        assert_eq!(stats.failed, 6);
        assert_eq!(stats.total_bytes, 60);
    }

    #[tokio::test]
    async fn test_hanging_probe_is_cut_off() {
        let mut settings = settings(2);
        settings.per_node_budget = Duration::from_millis(100);
        let checker = ProxyChecker::new(Arc::new(HangingProber), settings);

        let started = std::time::Instant::now();
        let results = checker.check_proxies(nodes(3)).await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(results.len(), 3);
        assert!(
            results
                .iter()
                .all(|r| r.connectivity == Connectivity::Timeout
                    && r.error == Some(ProbeError::BudgetExhausted))
        );
    }

    #[tokio::test]
    async fn test_batch_deadline_marks_not_attempted() {
        let mut settings = settings(1);
        settings.batch_budget = Duration::from_millis(150);
        let prober = Arc::new(ScriptedProber::new(Duration::from_millis(100)));
        let checker = ProxyChecker::new(prober, settings);

        let results = checker.check_proxies(nodes(10)).await;

        assert_eq!(results.len(), 10);
        assert_eq!(names(&results).len(), 10);

        let not_attempted = results
            .iter()
            .filter(|r| r.connectivity == Connectivity::NotAttempted)
            .count();
        assert!(not_attempted >= 7, "not attempted: {}", not_attempted);
        assert_eq!(
            checker.get_stats().snapshot().not_attempted,
            not_attempted as u64
        );
    }

    #[tokio::test]
    async fn test_batch_deadline_cuts_in_flight_probe() {
        let mut settings = settings(1);
        settings.batch_budget = Duration::from_millis(200);
        let checker = ProxyChecker::new(Arc::new(HangingProber), settings);

        let started = std::time::Instant::now();
        let results = checker.check_proxies(nodes(2)).await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(results.len(), 2);
        assert_eq!(
            results
                .iter()
                .filter(|r| r.connectivity == Connectivity::Timeout)
                .count(),
            1
        );
        assert_eq!(
            results
                .iter()
                .filter(|r| r.connectivity == Connectivity::NotAttempted)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_node_budget_shrinks_near_batch_deadline() {
        let mut settings = settings(1);
        settings.batch_budget = Duration::from_millis(300);
        let prober = Arc::new(BudgetAwareProber {
            largest_budget: std::sync::Mutex::new(Duration::ZERO),
        });
        let checker = ProxyChecker::new(prober.clone(), settings);

        let started = std::time::Instant::now();
        let results = checker.check_proxies(nodes(1)).await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(results[0].connectivity, Connectivity::Connected);
        assert!(*prober.largest_budget.lock().unwrap() < Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_huge_budgets_do_not_overflow() {
        let settings = CheckerSettings {
            per_node_budget: Duration::MAX,
            batch_budget: Duration::MAX,
            grace: Duration::MAX,
            ..settings(2)
        };
        let prober = Arc::new(ScriptedProber::new(Duration::from_millis(1)));
        let checker = ProxyChecker::new(prober, settings);

        let results = checker.check_proxies(nodes(4)).await;
        assert_eq!(results.len(), 4);
        assert!(
            results
                .iter()
                .all(|r| r.connectivity != Connectivity::NotAttempted)
        );
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let checker = ProxyChecker::new(Arc::new(HangingProber), settings(3));
        assert!(checker.check_proxies(Vec::new()).await.is_empty());
        assert_eq!(checker.get_stats().get_success_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_shuffle_keeps_every_node() {
        let mut settings = settings(4);
        settings.smart_shuffle = true;
        let prober = Arc::new(ScriptedProber::new(Duration::from_millis(1)));
        let checker = ProxyChecker::new(prober, settings);

        let results = checker.check_proxies(nodes(20)).await;
        assert_eq!(names(&results).len(), 20);
    }
}
