use std::sync::Arc;

use anyhow::Context as _;

use crate::config::ServiceConfig;
use crate::metrics::RuntimeMetrics;
use crate::store::{PgStore, ProviderStore};
use crate::telemetry::Telemetry;
use crate::transport::Transport;

/// Everything one process shares between its parts.
///
/// Built once in `main` and passed down explicitly. Handles that a role
/// does not need are never opened; `shutdown` closes only the ones that
/// were.
pub struct AppContext {
    pub service: String,
    /// Tags every telemetry point of this process
    pub run_id: String,
    pub config: ServiceConfig,
    pub metrics: Arc<RuntimeMetrics>,
    pub telemetry: Telemetry,
    transport: Option<Transport>,
    store: Option<Arc<dyn ProviderStore>>,
}

impl AppContext {
    pub fn new(service: impl Into<String>, config: ServiceConfig) -> Self {
        let metrics = RuntimeMetrics::shared();
        let telemetry = Telemetry::from_config(&config.influx, metrics.clone());

        Self {
            service: service.into(),
            run_id: uuid::Uuid::new_v4().to_string(),
            config,
            metrics,
            telemetry,
            transport: None,
            store: None,
        }
    }

    pub async fn connect_transport(&mut self) -> anyhow::Result<Transport> {
        let transport = Transport::connect(&self.config.transport, self.config.retry)
            .await
            .context("cannot connect to the broker")?;
        self.transport = Some(transport.clone());
        Ok(transport)
    }

    /// Connects to Postgres and makes sure the tables exist.
    pub async fn connect_store(&mut self) -> anyhow::Result<Arc<dyn ProviderStore>> {
        let pg = PgStore::connect(self.config.postgres()?)
            .await
            .context("cannot connect to Postgres")?;
        pg.ensure_schema().await.context("cannot create tables")?;

        let store: Arc<dyn ProviderStore> = Arc::new(pg);
        self.store = Some(store.clone());
        Ok(store)
    }

    /// Closes every opened handle.
    pub async fn shutdown(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
        if let Some(store) = self.store.take() {
            store.close().await;
        }
        self.telemetry.close();
        log::info!("[{}] shut down. {}", self.service, self.metrics.summary());
    }
}

/// Resolves on SIGINT or SIGTERM (Ctrl+C elsewhere).
pub async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;

    fn context() -> AppContext {
        let cfg = config::parse(r#"{"transport": {"host": "localhost", "port": 6379}}"#).unwrap();
        AppContext::new("core", cfg)
    }

    #[tokio::test]
    async fn shutdown_without_opened_handles_is_a_no_op() {
        let mut ctx = context();
        ctx.shutdown().await;
        ctx.shutdown().await;
        assert!(ctx.transport.is_none());
        assert!(ctx.store.is_none());
    }

    #[tokio::test]
    async fn connecting_a_store_needs_postgres_section() {
        let mut ctx = context();
        let err = ctx.connect_store().await.err().unwrap();
        assert!(err.to_string().contains("postgres"));
    }

    #[test]
    fn every_process_gets_its_own_run_id() {
        assert_ne!(context().run_id, context().run_id);
    }
}
