use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use tokio::signal;
use tracing::{error, info, warn};

use traffic_core::{init_logging, AppConfig};
use traffic_scheduler::{run_simulation, AppMode, Application, ShutdownManager};

#[tokio::main]
async fn main() -> Result<()> {
    // 解析命令行参数
    let matches = Command::new("traffic-scheduler")
        .version(env!("CARGO_PKG_VERSION"))
        .about("分布式交通微观仿真调度系统")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，缺省时只使用默认值和环境变量"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("运行模式")
                .value_parser(["scheduler", "worker", "supervisor", "all", "simulate"])
                .default_value("all"),
        )
        .arg(
            Arg::new("worker-id")
                .long("worker-id")
                .value_name("ID")
                .help("Worker ID (仅在worker模式下使用)"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，缺省时使用配置文件中的值")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty"]),
        )
        .arg(
            Arg::new("model")
                .long("model")
                .value_name("FILE")
                .help("作业定义文件 (JSON 或 TOML)，simulate模式必需")
                .required_if_eq("mode", "simulate"),
        )
        .arg(
            Arg::new("out")
                .short('o')
                .long("out")
                .value_name("DIR")
                .help("simulate模式的输出目录")
                .default_value("simulation-output"),
        )
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .value_name("FORMAT")
                .help("simulate模式的输出格式")
                .value_parser(["csv", "json"])
                .default_value("csv"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config");
    let mode_str = matches
        .get_one::<String>("mode")
        .map(String::as_str)
        .unwrap_or("all");

    // 加载配置
    let mut config = AppConfig::load(config_path.map(String::as_str))
        .with_context(|| format!("加载配置失败: {config_path:?}"))?;
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.observability.log_format = format.clone();
    }
    if let Some(id) = matches.get_one::<String>("worker-id") {
        config.worker.worker_id = Some(id.clone());
    }

    // 初始化日志系统
    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    )?;

    info!("启动分布式交通仿真调度系统");
    if let Some(path) = config_path {
        info!("配置文件: {path}");
    }
    info!("运行模式: {mode_str}");

    if mode_str == "simulate" {
        let model = matches
            .get_one::<String>("model")
            .context("simulate模式需要 --model")?;
        let out = matches
            .get_one::<String>("out")
            .map(String::as_str)
            .unwrap_or("simulation-output");
        let format = matches
            .get_one::<String>("format")
            .map(String::as_str)
            .unwrap_or("csv");

        let summary = run_simulation(Path::new(model), Path::new(out), format)?;
        info!(
            "结果已写入 {} 和 {}",
            summary.states_path.display(),
            summary.cars_path.display()
        );
        return Ok(());
    }

    let app_mode: AppMode = mode_str.parse()?;
    let app = Arc::new(Application::new(config, app_mode));

    // 创建优雅关闭管理器
    let shutdown_manager = ShutdownManager::new();

    // 启动应用
    let app_handle = {
        let shutdown_rx = shutdown_manager.subscribe().await;
        let app = Arc::clone(&app);
        let shutdown_manager = shutdown_manager.clone();

        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_rx).await {
                error!("应用运行失败: {e:#}");
                shutdown_manager.shutdown().await;
            }
        })
    };

    // 等待关闭信号，应用自行退出时同样结束
    let mut app_exit = shutdown_manager.subscribe().await;
    tokio::select! {
        _ = wait_for_shutdown_signal() => {}
        _ = app_exit.recv() => {}
    }

    info!("开始优雅关闭...");
    shutdown_manager.shutdown().await;

    // 等待应用关闭，设置超时
    match tokio::time::timeout(Duration::from_secs(30), app_handle).await {
        Ok(Ok(())) => info!("应用已优雅关闭"),
        Ok(Err(e)) => error!("应用关闭时发生错误: {e}"),
        Err(_) => warn!("应用关闭超时，强制退出"),
    }

    info!("分布式交通仿真调度系统已退出");
    Ok(())
}

/// 等待关闭信号
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到Ctrl+C信号");
        },
        _ = terminate => {
            info!("收到SIGTERM信号");
        },
    }
}
