use anyhow::{Context, Result};
use clap::Parser;
use log::{error, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use subs_probe_rust::check::{ProbeEngine, ProxyChecker, SpeedEndpoint};
use subs_probe_rust::config::{self, Config};
use subs_probe_rust::proxy::{self, NodeDescriptor};
use subs_probe_rust::score::{self, ScoredResult};
use subs_probe_rust::subscription::{FetchError, SubscriptionResolver};
use subs_probe_rust::ui::report;

/// 订阅节点质量检测工具
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 节点分享链接
    links: Vec<String>,

    /// 配置文件路径
    #[arg(short = 'f', long, default_value = "config/config.yaml")]
    config: String,

    /// 订阅链接（多个，用逗号分隔）
    #[arg(short = 's', long)]
    subscriptions: Option<String>,

    /// 每行一个分享链接的文件
    #[arg(short = 'i', long)]
    input: Option<PathBuf>,

    /// 输出目录
    #[arg(short = 'o', long)]
    output: Option<String>,

    /// 日志级别
    #[arg(long)]
    log_level: Option<String>,

    /// 并发数
    #[arg(long)]
    concurrent: Option<usize>,

    /// 连接超时（毫秒）
    #[arg(long)]
    timeout: Option<u64>,

    /// 单节点检测时限（秒）
    #[arg(long)]
    node_timeout: Option<u64>,

    /// 整批检测时限（秒）
    #[arg(long)]
    batch_timeout: Option<u64>,

    /// 是否启用测速
    #[arg(long)]
    speed_test: Option<bool>,

    /// 额外的测速地址，优先使用
    #[arg(long)]
    speed_url: Option<String>,

    /// 是否启用媒体检测
    #[arg(long)]
    media_check: Option<bool>,

    /// 是否显示进度条
    #[arg(long)]
    progress: Option<bool>,

    /// 输出格式：json, yaml, both
    #[arg(long)]
    format: Option<String>,

    /// 详细输出
    #[arg(short, long)]
    verbose: bool,
}

fn load_config(path: &str) -> Config {
    if !Path::new(path).exists() {
        println!("📝 使用默认配置 (配置文件不存在: {})", path);
        return Config::default();
    }

    println!("📁 从配置文件加载设置: {}", path);
    match Config::load_from_file(path) {
        Ok(config) => {
            println!("✅ 配置文件加载成功");
            config
        }
        Err(e) => {
            println!("⚠️  配置文件加载失败: {}", e);
            println!("📝 使用默认配置");
            Config::default()
        }
    }
}

fn apply_args(config: &mut Config, args: &Args) {
    if let Some(concurrent) = args.concurrent {
        config.concurrent = concurrent;
    }
    if let Some(timeout) = args.timeout {
        config.connect_timeout = timeout;
    }
    if let Some(node_timeout) = args.node_timeout {
        config.node_timeout = node_timeout;
    }
    if let Some(batch_timeout) = args.batch_timeout {
        config.batch_timeout = batch_timeout;
    }
    if let Some(speed_test) = args.speed_test {
        config.speed_test = speed_test;
    }
    if let Some(speed_url) = &args.speed_url {
        config
            .speed_test_urls
            .insert(0, SpeedEndpoint::new("自定义", speed_url));
    }
    if let Some(media_check) = args.media_check {
        config.media_check = media_check;
    }
    if let Some(progress) = args.progress {
        config.print_progress = progress;
    }
    if let Some(format) = &args.format {
        config.output_format = format.clone();
    }
    if let Some(output) = &args.output {
        config.output_dir = output.clone();
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }

    // 处理订阅链接
    if let Some(subscriptions) = &args.subscriptions {
        for url in subscriptions.split(',').map(str::trim).filter(|u| !u.is_empty()) {
            config.subscriptions.push(config::Subscription {
                name: format!("订阅-{}", url),
                url: url.to_string(),
                enabled: true,
            });
        }
    }
}

fn print_config(config: &Config) {
    let flag = |on: bool| if on { "✅ 启用" } else { "❌ 禁用" };

    println!("\n⚙️  当前配置:");
    println!("  输出目录: {}", config.output_dir);
    println!("  并发数: {}", config.concurrent);
    println!("  连接超时: {}ms", config.connect_timeout);
    println!(
        "  检测时限: 单节点 {}s / 整批 {}s",
        config.node_timeout, config.batch_timeout
    );
    println!("  测速: {}", flag(config.is_speed_test_enabled()));
    println!("  归属地查询: {}", flag(config.geo_lookup));
    println!("  媒体检测: {}", flag(config.is_media_check_enabled()));
    println!("  进度显示: {}", flag(config.print_progress));
    println!("  输出格式: {}", config.output_format);
}

async fn collect_nodes(config: &Config, args: &Args) -> Result<Vec<NodeDescriptor>> {
    let mut nodes = Vec::new();

    let subscriptions: Vec<_> = config.enabled_subscriptions().collect();
    if !subscriptions.is_empty() {
        let resolver = SubscriptionResolver::new(config.resolver_settings())?;
        for sub in subscriptions {
            match resolver.resolve(&sub.url).await {
                Ok(bundle) => {
                    print!("{}", report::format_subscription(&bundle));
                    nodes.extend(bundle.nodes);
                }
                Err(FetchError::Forbidden) => {
                    error!("{}: {}", sub.name, FetchError::Forbidden);
                    println!("🚫 {} 被拒绝访问 (403)", sub.name);
                }
                Err(e) => {
                    error!("{}: {}", sub.name, e);
                    println!("❌ {} 获取失败: {}", sub.name, e);
                }
            }
        }
    }

    if let Some(path) = &args.input {
        let content = fs::read_to_string(path)
            .with_context(|| format!("读取链接文件失败: {}", path.display()))?;
        let parsed = proxy::parse_links(&content);
        if !parsed.failures.is_empty() {
            warn!(
                "{} 中有 {} 行无法解析",
                path.display(),
                parsed.failures.len()
            );
        }
        nodes.extend(parsed.nodes);
    }

    for link in &args.links {
        match proxy::parse(link) {
            Ok(node) => nodes.push(node),
            Err(e) => println!("⚠️  链接解析失败: {}", e),
        }
    }

    Ok(nodes)
}

fn save_results(results: &[ScoredResult], config: &Config) -> Result<()> {
    let dir = Path::new(&config.output_dir);
    fs::create_dir_all(dir)
        .with_context(|| format!("创建输出目录失败: {}", dir.display()))?;

    let format = config.output_format.as_str();
    if matches!(format, "json" | "both") {
        let path = dir.join("results.json");
        fs::write(&path, serde_json::to_string_pretty(results)?)?;
        println!("  {}", path.display());
    }
    if matches!(format, "yaml" | "both") {
        let path = dir.join("results.yaml");
        fs::write(&path, serde_yaml::to_string(results)?)?;
        println!("  {}", path.display());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // 解析命令行参数
    let args = Args::parse();

    let mut config = load_config(&args.config);
    apply_args(&mut config, &args);
    config.validate()?;

    // RUST_LOG 优先
    let level = if args.verbose {
        "debug".to_string()
    } else {
        config.log_level.clone()
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    println!("🚀 订阅节点检测工具 v{}", env!("CARGO_PKG_VERSION"));
    println!("{:=<80}", "");
    print_config(&config);

    println!("\n📡 获取代理节点...");
    let nodes = collect_nodes(&config, &args).await?;
    if nodes.is_empty() {
        println!("⚠️  没有可检测的节点");
        return Ok(());
    }
    println!("✅ 获取到 {} 个代理节点", nodes.len());

    let engine = ProbeEngine::new(config.probe_settings())?;
    let checker = ProxyChecker::new(Arc::new(engine), config.checker_settings());

    // 执行检测
    println!("\n🔍 开始检测代理节点...");
    println!("{:=<80}", "");
    let results = checker.check_proxies(nodes).await;

    // 打印统计信息
    checker.print_stats();

    let ranked = score::rank(results);
    println!("\n{}", report::format_batch(&ranked));

    if !config.output_dir.is_empty() {
        println!("\n💾 保存检测结果到: {}", config.output_dir);
        save_results(&ranked, &config)?;
        println!("✅ 结果保存完成");
    }

    println!("\n🎉 检测完成!");

    Ok(())
}
