use std::future::Future;
use std::sync::Arc;

use eyre::{Result, WrapErr};
use tokio::net::TcpListener;

use intake_common::metrics::setup_metrics_routes;
use intake_common::store::{MemoryStore, PgStore, Store};
use intake_common::time::{SystemTime, TimeSource};

use crate::config::Config;
use crate::router::{router, AppState};

async fn build_store(
    config: &Config,
    timesource: Arc<dyn TimeSource + Send + Sync>,
) -> Result<Arc<dyn Store>> {
    if config.memory_store {
        tracing::warn!("using the in-memory store, nothing will survive a restart");
        return Ok(Arc::new(MemoryStore::new(timesource)));
    }

    let store = PgStore::new(&config.database_url, config.max_pg_connections)
        .await
        .wrap_err("failed to connect to postgres")?;

    if config.run_migrations {
        store.migrate().await.wrap_err("failed to run migrations")?;
        tracing::info!("database migrations applied");
    }

    Ok(Arc::new(store))
}

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let timesource: Arc<dyn TimeSource + Send + Sync> = Arc::new(SystemTime {});
    let store = build_store(&config, timesource.clone()).await?;

    if config.admin_token.is_none() {
        tracing::warn!("ADMIN_TOKEN is not set, admin routes are open");
    }

    let state = AppState::new(
        store,
        timesource,
        config.website_data_ttl(),
        config.admin_token.clone(),
    );
    let app = router(state, config.max_body_size, config.concurrency_limit);

    // Installing the recorder is global, so only one server per process may export.
    let app = if config.export_prometheus {
        setup_metrics_routes(app).wrap_err("failed to install prometheus recorder")?
    } else {
        app
    };

    tracing::info!("listening on {:?}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
