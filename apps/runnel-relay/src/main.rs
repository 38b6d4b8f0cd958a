use std::net::SocketAddr;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use sqlx::sqlite::SqlitePoolOptions;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Level};

use runnel_relay::{config::AppConfig, routes::build_router, state::AppState, watchdog};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cfg = AppConfig::from_env();
    let state = if let Some(db_url) = &cfg.database_url {
        match SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await
        {
            Ok(pool) => {
                sqlx::migrate!("./migrations").run(&pool).await?;
                info!("database migrations applied");
                AppState::with_db(pool)
            }
            Err(err) => {
                warn!(error = %err, "failed to open database, continuing with in-memory state");
                AppState::new()
            }
        }
    } else {
        info!("DATABASE_URL not set; running with in-memory state");
        AppState::new()
    };

    if cfg.api_token.is_none() {
        warn!("API_TOKEN not set; front-end calls are not gated");
    }
    if let Some(admin) = &cfg.admin_user_id {
        info!(admin = %admin, "administrator identity configured");
    }

    let state = state
        .with_api_token(cfg.api_token.clone())
        .with_admin(cfg.admin_user_id.clone())
        .with_timeouts(
            ChronoDuration::seconds(cfg.dispatch_timeout_secs as i64),
            ChronoDuration::seconds(cfg.execution_timeout_secs as i64),
            ChronoDuration::seconds(cfg.machine_stale_secs as i64),
        );

    watchdog::spawn(
        state.clone(),
        Duration::from_secs(cfg.watchdog_interval_secs),
    );

    let app = build_router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = cfg.bind_addr.parse()?;
    info!("starting runnel relay on {addr}");
    axum::serve(
        tokio::net::TcpListener::bind(addr).await?,
        app.into_make_service(),
    )
    .await?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}
