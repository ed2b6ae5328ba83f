/// 视频管线服务 (Sentinel Relay)
///
/// 读取 JSON 配置, 启动全部管线, 通过 HTTP 提供 MJPEG 推流 / 配置 / 健康检查。
/// Ctrl-C 停止全部管线后退出。
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use mimalloc::MiMalloc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sentinel_relay::config::AppConfig;
use sentinel_relay::detection::ModelRegistry;
use sentinel_relay::registry::PipelineRegistry;
use sentinel_relay::server;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// 服务参数
#[derive(Parser, Debug)]
#[command(author, version, about = "视频管线服务 - 采集 / 检测 / 计数 / MJPEG 推流", long_about = None)]
struct Args {
    /// 配置文件 (不存在时写出默认配置)
    #[arg(short, long, default_value = "sentinel.json")]
    config: PathBuf,

    /// 监听地址 (覆盖配置文件)
    #[arg(short, long)]
    bind: Option<String>,

    /// 不自动启动管线
    #[arg(long)]
    no_autostart: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_thread_names(true)
        .init();

    let args = Args::parse();
    info!("🚀 视频管线服务启动");

    let config = AppConfig::load(&args.config)?;
    let bind = args.bind.clone().unwrap_or_else(|| config.bind.clone());

    // 推理后端在此注册; 内置 passthrough 只转发画面
    let models = Arc::new(ModelRegistry::new());
    let registry = PipelineRegistry::from_config(&config, models)?;
    info!("📋 已加载 {} 条管线", config.pipelines.len());

    if config.autostart && !args.no_autostart {
        let starter = registry.clone();
        tokio::task::spawn_blocking(move || starter.start_all()).await?;
    }

    let stopper = registry.clone();
    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("❌ 监听退出信号失败: {}", e);
        }
        info!("🛑 收到退出信号, 停止全部管线");
        let _ = tokio::task::spawn_blocking(move || stopper.stop_all()).await;
    };

    server::serve(&bind, registry.clone(), shutdown).await?;
    registry.stop_all();
    info!("👋 服务已退出");
    Ok(())
}
