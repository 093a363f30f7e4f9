//! Runtime wiring and worker supervision.
//!
//! The [`Runtime`] is the composition root: every shared resource the task
//! handlers touch is constructed once at process init and wired in
//! explicitly, so there are no init-order hazards from side-effect
//! registration.

mod foreman;
mod registry;

pub use foreman::{task_deadline, Foreman};
pub use registry::{FnHandler, HandlerRegistry, TaskHandler};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::Notify;

use crate::assets::AssetCache;
use crate::config::Config;
use crate::engine::FlowEngine;
use crate::search::ContactSearcher;
use crate::store::Store;

/// Shared resources handed to every task handler.
pub struct Runtime {
    pub config: Config,
    pub db: PgPool,
    pub store: Arc<dyn Store>,
    pub engine: Arc<dyn FlowEngine>,
    pub searcher: Arc<dyn ContactSearcher>,
    pub assets: AssetCache,
    pub http: reqwest::Client,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn builder(config: Config) -> RuntimeBuilder {
        RuntimeBuilder::new(config)
    }
}

/// Builder validating that all required dependencies are provided before the
/// runtime is constructed.
pub struct RuntimeBuilder {
    config: Config,
    db: Option<PgPool>,
    store: Option<Arc<dyn Store>>,
    engine: Option<Arc<dyn FlowEngine>>,
    searcher: Option<Arc<dyn ContactSearcher>>,
    assets: Option<AssetCache>,
    http: Option<reqwest::Client>,
}

impl RuntimeBuilder {
    pub fn new(config: Config) -> RuntimeBuilder {
        RuntimeBuilder {
            config,
            db: None,
            store: None,
            engine: None,
            searcher: None,
            assets: None,
            http: None,
        }
    }

    pub fn with_db(mut self, db: PgPool) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_engine(mut self, engine: Arc<dyn FlowEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_searcher(mut self, searcher: Arc<dyn ContactSearcher>) -> Self {
        self.searcher = Some(searcher);
        self
    }

    pub fn with_assets(mut self, assets: AssetCache) -> Self {
        self.assets = Some(assets);
        self
    }

    pub fn with_http(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    pub fn build(self) -> anyhow::Result<Runtime> {
        let assets = match self.assets {
            Some(assets) => assets,
            None => AssetCache::new(
                std::time::Duration::from_secs(self.config.asset_cache_ttl_secs),
                std::time::Duration::from_secs(self.config.location_cache_ttl_secs),
            ),
        };

        Ok(Runtime {
            db: self.db.ok_or_else(|| anyhow::anyhow!("db dependency missing"))?,
            store: self
                .store
                .ok_or_else(|| anyhow::anyhow!("store dependency missing"))?,
            engine: self
                .engine
                .ok_or_else(|| anyhow::anyhow!("engine dependency missing"))?,
            searcher: self
                .searcher
                .ok_or_else(|| anyhow::anyhow!("searcher dependency missing"))?,
            assets,
            http: self.http.unwrap_or_default(),
            config: self.config,
        })
    }
}

/// Token for signaling graceful shutdown to workers.
#[derive(Clone, Debug, Default)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug, Default)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.inner.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_shutdown_token_shared_state() {
        let token = ShutdownToken::new();
        let clone1 = token.clone();
        let clone2 = token.clone();

        token.cancel();

        assert!(clone1.is_cancelled());
        assert!(clone2.is_cancelled());

        // cancelled() must return immediately once cancelled
        timeout(Duration::from_secs(1), clone1.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_token_wakes_waiters() {
        let token = ShutdownToken::new();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let t = token.clone();
                tokio::spawn(async move { t.cancelled().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        let results = timeout(Duration::from_secs(5), futures::future::join_all(waiters))
            .await
            .expect("waiters did not observe cancellation");
        for r in results {
            r.expect("waiter panicked");
        }
    }
}
