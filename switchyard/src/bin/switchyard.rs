//! The switchyard service binary: composition root, foremen, and
//! signal-driven shutdown.
//!
//! Exits 0 on clean shutdown; nonzero only on init-time fatal errors
//! (invalid config, unreachable database or KV store).

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

use switchyard::assets::OrgAssets;
use switchyard::engine::{FlowEngine, FlowResume, FlowTrigger, Sprint};
use switchyard::models::{Contact, ContactId, OrgId, Session};
use switchyard::search::{ContactSearcher, SearchError};
use switchyard::store::RedisStore;
use switchyard::{Config, Foreman, QueueName, Runtime};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!("invalid configuration: {}", err);
            return ExitCode::from(1);
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("fatal: {:#}", err);
            ExitCode::from(2)
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    tracing::info!(state = "starting", "switchyard");

    let db = PgPoolOptions::new()
        .max_connections(config.db_pool_size)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&config.db_url)
        .await?;
    sqlx::query("SELECT 1").execute(&db).await?;
    tracing::info!("db ok");

    let store = RedisStore::connect(&config.redis_url).await?;
    store.ping().await?;
    tracing::info!("redis ok");

    #[cfg(feature = "metrics")]
    switchyard::metrics::init_metrics()?;

    let rt = Arc::new(
        Runtime::builder(config.clone())
            .with_db(db)
            .with_store(Arc::new(store))
            .with_engine(Arc::new(UnconfiguredEngine))
            .with_searcher(Arc::new(UnconfiguredSearcher))
            .build()?,
    );

    let registry = Arc::new(switchyard::tasks::default_registry());
    registry.init(&rt)?;

    let handler_foreman = Foreman::new(QueueName::Handler, config.handler_workers, registry.clone());
    let batch_foreman = Foreman::new(QueueName::Batch, config.batch_workers, registry);

    handler_foreman.start(rt.clone()).await;
    batch_foreman.start(rt.clone()).await;
    tracing::info!("switchyard started");

    wait_for_shutdown_signal().await;

    tracing::info!("switchyard stopping");
    handler_foreman.stop().await;
    batch_foreman.stop().await;
    rt.db.close().await;
    tracing::info!("switchyard stopped");

    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

/// Placeholder engine used until a real engine implementation is linked in
/// by the deployment. Every session attempt fails loudly rather than
/// silently dropping work.
struct UnconfiguredEngine;

#[async_trait]
impl FlowEngine for UnconfiguredEngine {
    async fn new_session(
        &self,
        _assets: &OrgAssets,
        _contact: &Contact,
        _trigger: &FlowTrigger,
    ) -> anyhow::Result<Sprint> {
        anyhow::bail!("no flow engine configured")
    }

    async fn resume(
        &self,
        _assets: &OrgAssets,
        _contact: &Contact,
        _session: &Session,
        _resume: &FlowResume,
    ) -> anyhow::Result<Sprint> {
        anyhow::bail!("no flow engine configured")
    }
}

/// Placeholder searcher: every query is reported as unsupported so starts
/// using queries fail visibly instead of matching nothing.
struct UnconfiguredSearcher;

#[async_trait]
impl ContactSearcher for UnconfiguredSearcher {
    async fn contact_ids_for_query(
        &self,
        _org: OrgId,
        query: &str,
    ) -> Result<Vec<ContactId>, SearchError> {
        Err(SearchError::UserQuery(format!(
            "no search index configured, cannot evaluate: {}",
            query
        )))
    }

    async fn contact_matches(
        &self,
        _org: OrgId,
        _query: &str,
        _contact: ContactId,
    ) -> Result<bool, SearchError> {
        Ok(false)
    }
}
