use mediaproof_core::api::{self, AppState};
use mediaproof_core::backend::SimulatedBackend;
use mediaproof_core::config::Config;
use mediaproof_core::invoker::AnalysisInvoker;
use mediaproof_core::media::MediaIntake;
use mediaproof_core::workflow::WorkflowController;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ----------------------------------------------------------------
    // 0. 加载配置
    // ----------------------------------------------------------------
    let config = Config::from_env()?;
    info!(
        host = %config.host,
        port = config.port,
        timeout_s = config.analysis_timeout.as_secs(),
        latency_ms = config.simulated_latency.as_millis() as u64,
        seeded = config.backend_seed.is_some(),
        "config loaded"
    );

    // ----------------------------------------------------------------
    // 1. 组装工作流：模拟后端 -> 分析调度 -> 控制器
    // ----------------------------------------------------------------
    let backend = Arc::new(SimulatedBackend::new(config.backend_seed, config.simulated_latency));
    let controller = WorkflowController::new(
        AnalysisInvoker::new(backend, config.analysis_timeout),
        MediaIntake::new(config.preview_max_dim),
    );

    let shared_state = Arc::new(AppState {
        controller: Arc::new(controller),
        max_upload_bytes: config.max_upload_bytes,
    });

    // ----------------------------------------------------------------
    // 2. 启动 HTTP 服务
    // ----------------------------------------------------------------
    let app = api::app(shared_state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;

    info!("listening on http://{}", addr);
    info!("  PUT  /asset   : stage a file (x-file-name header, raw body)");
    info!("  POST /analyze : run analysis on the staged file");
    info!("  GET  /state   : workflow snapshot");

    axum::serve(listener, app).await?;

    Ok(())
}
