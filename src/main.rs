//! 补丁波次编排服务主入口

use patch_orchestrator::{
    cloud::{memory::StaticSecretSource, LogNotifier, ScriptedAnalyst, SecretSource, SimulatedCloud},
    config::{AppConfig, StorageBackend},
    db,
    handlers::health,
    middleware::{AppState, Collaborators},
    repository::{BlobStore, MemoryBlobStore, MemoryRecordStore, PgRecordStore, RecordStore, S3BlobStore},
    routes, telemetry,
};
use secrecy::ExposeSecret;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ===== CLI 参数处理 =====
    let args: Vec<String> = std::env::args().collect();

    if args.len() > 1 {
        match args[1].as_str() {
            "--version" => {
                println!("patch-orchestrator {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" => {
                print_help();
                return Ok(());
            }
            _ => {
                eprintln!("未知参数: {}", args[1]);
                print_help();
                std::process::exit(1);
            }
        }
    }

    // 加载 .env 文件（开发环境）
    // 生产环境应该直接设置环境变量，不依赖 .env 文件
    if let Ok(env) = std::env::var("PATCH_ENV") {
        dotenv::from_filename(format!(".env.{}", env)).ok();
    } else {
        dotenv::from_filename(".env.local").ok();
        dotenv::dotenv().ok();
    }

    health::set_start_time();

    // 1. 加载配置
    let config = AppConfig::from_env().map_err(|e| {
        eprintln!("Configuration error: {}", e);
        anyhow::anyhow!("Failed to load configuration: {}", e)
    })?;

    // 2. 初始化日志
    telemetry::init_telemetry(&config);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Patch orchestrator starting...");

    // 3. 记录存储：有数据库时持久化，否则使用内存
    let db_pool = db::create_pool(&config.database).await?;
    let records: Arc<dyn RecordStore> = match &db_pool {
        Some(pool) => {
            db::run_migrations(pool).await?;
            tracing::info!("Database initialized");
            Arc::new(PgRecordStore::new(pool.clone()))
        }
        None => Arc::new(MemoryRecordStore::new()),
    };

    // 4. 制品存储
    let blobs: Arc<dyn BlobStore> = match config.storage.backend {
        StorageBackend::S3 => Arc::new(S3BlobStore::new(&config.storage)?),
        StorageBackend::Memory => Arc::new(MemoryBlobStore::new()),
    };

    // 5. 外部协作方（本地运行使用模拟云环境）
    let cloud = Arc::new(SimulatedCloud::new());
    let secrets: Option<Arc<dyn SecretSource>> = config
        .approval
        .signing_secret
        .as_ref()
        .map(|s| Arc::new(StaticSecretSource::new(s.expose_secret())) as Arc<dyn SecretSource>);
    if secrets.is_none() && config.approval.enabled {
        tracing::warn!("No approval signing secret configured, approval callbacks will be rejected");
    }

    let app_state = Arc::new(AppState::build(
        config.clone(),
        db_pool,
        Collaborators {
            assumer: cloud.clone(),
            backend: cloud,
            secrets,
            notifier: Arc::new(LogNotifier),
            blobs,
            records,
            analyst: Some(Arc::new(ScriptedAnalyst::new())),
        },
    ));

    // 6. 构建路由
    let app = routes::create_router(app_state);

    // 7. 启动服务器
    let addr = &config.server.addr;
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(addr = %addr, "Server listening");

    // 8. 优雅关闭
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(config.server.graceful_shutdown_timeout_secs))
        .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// 优雅关闭信号处理
async fn shutdown_signal(timeout_secs: u64) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Ctrl+C received, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Terminate signal received, starting graceful shutdown");
        },
    }

    // 超时后强制退出
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(timeout_secs)).await;
        tracing::warn!("Graceful shutdown timeout reached, forcing exit");
        std::process::exit(1);
    });
}

/// 打印帮助信息
fn print_help() {
    println!("patch-orchestrator {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("用法: patch-orchestrator [选项]");
    println!();
    println!("选项:");
    println!("  --version     打印版本信息并退出");
    println!("  --help        打印此帮助信息并退出");
    println!();
    println!("环境变量:");
    println!("  所有配置通过 PATCH_ 前缀的环境变量完成，例如 PATCH_APPROVAL__EXPIRY_MINUTES=60");
}
