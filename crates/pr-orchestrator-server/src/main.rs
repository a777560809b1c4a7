mod dto;
mod logging;
mod routes;

use std::{collections::VecDeque, sync::Arc, time::Instant};

use axum::http::{HeaderValue, Method};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::{Router, extract::Request};
use pr_orchestrator_core::config::Config;
use pr_orchestrator_core::db::DbHandle;
use pr_orchestrator_core::hooks::DefaultPolicyHooks;
use pr_orchestrator_core::scheduler::Scheduler;
use pr_orchestrator_core::status_receiver::StatusReceiver;
use pr_orchestrator_core::watch_loop::WatchLoop;
use pr_orchestrator_executor::MockExecutorAdapter;
use pr_orchestrator_host::github::GitHubHostAdapter;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::info;

pub struct AppState {
    pub db: DbHandle,
    pub config: Arc<Config>,
    pub scheduler: Arc<Scheduler>,
    pub hooks: Arc<dyn pr_orchestrator_core::hooks::PolicyHooks>,
    pub start_time: Instant,
}

async fn no_cache_headers(request: Request, next: Next) -> Response {
    let mut resp = next.run(request).await;
    resp.headers_mut()
        .insert("Pragma", HeaderValue::from_static("no-cache"));
    resp
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let (log_tx, _log_rx) = broadcast::channel::<String>(1024);
    let log_ring = Arc::new(std::sync::Mutex::new(VecDeque::with_capacity(500)));

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "pr_orchestrator_server=info,pr_orchestrator_core=info,pr_orchestrator_host=info,pr_orchestrator_executor=info,tower_http=warn".into());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(logging::BroadcastLayer {
            tx: log_tx,
            ring: log_ring,
        })
        .init();

    let config = Arc::new(Config::from_env()?);

    let db_path = format!("{}.sqlite", config.dbname);
    let db = DbHandle::open(&db_path)?;

    let reconciled = db.startup_reconcile(config.builders.clone()).await?;
    info!(count = reconciled.len(), "builders reconciled from configuration");

    if config.reset_interrupted_on_startup {
        for status in db.list_active_statuses().await? {
            use pr_orchestrator_core::types::BuildStatusCode;
            if matches!(status.status, BuildStatusCode::SCHEDULING | BuildStatusCode::BUILDING) {
                let mut status = status;
                status.status = BuildStatusCode::INQUEUE;
                status.brid = -1;
                status.build_number = -1;
                db.update_status(status).await?;
            }
        }
    }

    let host = Arc::new(GitHubHostAdapter::new(
        config.github_owner.clone(),
        config.github_repo.clone(),
        config.github_token.clone(),
        &config.name,
    )?);
    let executor = Arc::new(MockExecutorAdapter::new());
    let hooks = Arc::new(DefaultPolicyHooks);

    let scheduler = Arc::new(Scheduler::new(db.clone(), executor.clone(), hooks.clone()));
    let _status_receiver = Arc::new(StatusReceiver::new(
        db.clone(),
        executor.clone(),
        scheduler.clone(),
        hooks.clone(),
        config.name.clone(),
    ));

    let watch_loop = Arc::new(WatchLoop::new(
        db.clone(),
        host.clone(),
        scheduler.clone(),
        hooks.clone(),
        config.clone(),
    ));
    watch_loop.spawn();

    let state = Arc::new(AppState {
        db,
        config: config.clone(),
        scheduler,
        hooks: hooks.clone(),
        start_time: Instant::now(),
    });

    let base = format!("/{}", config.urlpath);
    let app = Router::new()
        .route(&base, get(routes::list_root))
        .route(&format!("{base}/:prid"), get(routes::get_pr))
        .route(&format!("{base}/:prid/status"), get(routes::get_public_status))
        .route(&format!("{base}/:prid/:bid"), get(routes::get_status))
        .route(&format!("{base}/:prid/:bid/restart"), get(routes::restart_build))
        .route(&format!("{base}/:prid/:bid/stop"), get(routes::stop_build))
        .route(&format!("{base}/:prid/:bid/revert"), get(routes::revert_build))
        .fallback(routes::not_found)
        .layer(middleware::from_fn(no_cache_headers))
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods([Method::GET]),
        )
        .with_state(state);

    let addr = format!("{}:{}", config.bind, config.port);
    info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
