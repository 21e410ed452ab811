use std::sync::Arc;
use std::time::Duration;

use bank_recon_rust::{
    api::{self, AppState},
    create_pool,
    db::{PgBillingRepository, PgLedgerRepository},
    gateway::HttpPaymentGateway,
    scheduler, AppConfig, BillingEngine, MatchingEngine, MatchingPolicy,
};
use tower::ServiceBuilder;
use tracing::info;
use tracing_subscriber::fmt::time::ChronoLocal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 初始化日志 - 使用本地时间格式
    tracing_subscriber::fmt()
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_string()))
        .with_target(true)
        .with_level(true)
        .init();

    // 加载配置
    let config = AppConfig::load()?;
    info!(
        host = %config.server.host,
        port = config.server.port,
        review_floor = config.matching.review_floor,
        billing_concurrency = config.billing.concurrency,
        "Starting server"
    );

    // 创建数据库连接池
    let pool = create_pool(&config.database).await?;
    info!("Database pool created");

    let ledger = Arc::new(PgLedgerRepository::new(pool.clone()));
    let billing_repo = Arc::new(PgBillingRepository::new(pool));
    let gateway = Arc::new(HttpPaymentGateway::new(&config.gateway)?);

    let matching = Arc::new(MatchingEngine::new(
        ledger,
        MatchingPolicy::from(&config.matching),
    )?);
    let billing = Arc::new(
        BillingEngine::new(billing_repo, gateway).with_concurrency(config.billing.concurrency),
    );

    // 后台任务
    let jobs = scheduler::start_match_worker(matching.clone(), config.jobs.match_workers);
    scheduler::spawn_billing(
        billing.clone(),
        Duration::from_secs(config.billing.scan_interval_secs),
    );

    let state = AppState {
        matching,
        billing,
        jobs,
    };
    let app = api::router(state).layer(ServiceBuilder::new());

    // 启动服务器
    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Server listening on {}", addr);
    info!("API Endpoints:");
    info!("  POST /api/match/:org/run             - auto-match (?format=csv for review queue)");
    info!("  POST /api/billing/run-monthly        - charge due subscriptions");
    info!("  POST /api/billing/run-retries        - retry past_due subscriptions");
    info!("  POST /api/billing/webhook            - gateway confirmations");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
