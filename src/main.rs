use reachwatch::config;
use reachwatch::monitor::Monitor;
use std::env;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

struct Args {
    config_path: PathBuf,
    state_path: Option<String>,
    check_only: bool,
}

fn parse_args() -> Args {
    let args: Vec<String> = env::args().collect();
    let mut parsed = Args {
        config_path: PathBuf::from(config::DEFAULT_CONFIG_FILE),
        state_path: None,
        check_only: false,
    };
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-d" => {
                let dir = value_for(&args, i, "-d");
                if let Err(e) = env::set_current_dir(dir) {
                    eprintln!("Failed to change directory to {}: {}", dir, e);
                    std::process::exit(2);
                }
                i += 1;
            }
            "-c" => {
                parsed.config_path = PathBuf::from(value_for(&args, i, "-c"));
                i += 1;
            }
            "-s" => {
                parsed.state_path = Some(value_for(&args, i, "-s").to_string());
                i += 1;
            }
            "--check" => parsed.check_only = true,
            other => {
                eprintln!("Unknown argument: {}", other);
                eprintln!("Usage: reachwatch [-d dir] [-c config] [-s state_path] [--check]");
                std::process::exit(2);
            }
        }
        i += 1;
    }
    parsed
}

fn value_for<'a>(args: &'a [String], i: usize, flag: &str) -> &'a str {
    match args.get(i + 1) {
        Some(v) => v.as_str(),
        None => {
            eprintln!("Missing argument for {}", flag);
            std::process::exit(2);
        }
    }
}

#[tokio::main]
async fn main() {
    let args = parse_args();

    // 初始化日志
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "reachwatch=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // 1. 加载配置
    let mut config = match config::load_config(&args.config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration: {:#}", e);
            std::process::exit(2);
        }
    };
    if let Some(state_path) = args.state_path {
        config.run.state_path = state_path;
    }

    if args.check_only {
        println!("Configuration OK: {} targets", config.targets.len());
        return;
    }

    // 2. 执行一次探测
    let monitor = Monitor::from_config(config);
    let summary = monitor.run_once().await;

    // 3. 输出结果
    match serde_json::to_string_pretty(&summary) {
        Ok(json) => println!("{}", json),
        Err(e) => tracing::error!("Failed to serialize run summary: {}", e),
    }
    if !summary.persisted() {
        std::process::exit(1);
    }
}
