use crate::{listener, CdcCredentials, ListenerConfig};
use ingest_queue::Queue;
use ingest_sql::tenants_with_salesforce;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// How often the listener fleet is reconciled against the control plane.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(60);
/// How long a listener gets to drain before it is aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Process-wide owner of the CDC listener fleet: one listener task per
/// tenant with Salesforce connected, added and removed as the control-plane
/// flag changes.
pub struct CdcManager {
    control_pool: sqlx::PgPool,
    credentials: Arc<dyn CdcCredentials>,
    queue: Arc<dyn Queue>,
    listeners: HashMap<String, ListenerHandle>,
}

struct ListenerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl ListenerHandle {
    async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let abort = self.task.abort_handle();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.task).await.is_err() {
            abort.abort();
        }
    }
}

impl CdcManager {
    pub fn new(
        control_pool: sqlx::PgPool,
        credentials: Arc<dyn CdcCredentials>,
        queue: Arc<dyn Queue>,
    ) -> Self {
        Self {
            control_pool,
            credentials,
            queue,
            listeners: HashMap::new(),
        }
    }

    /// Run until `shutdown` flips true, then stop every listener cleanly.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.reconcile().await {
                        tracing::error!(?err, "failed to reconcile CDC listener fleet");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!(
            listeners = self.listeners.len(),
            "shutting down CDC listener fleet"
        );
        for (tenant_id, handle) in self.listeners.drain() {
            tracing::info!(tenant_id, "stopping CDC listener");
            handle.stop().await;
        }
    }

    async fn reconcile(&mut self) -> anyhow::Result<()> {
        let desired: HashSet<String> = tenants_with_salesforce(&self.control_pool)
            .await?
            .into_iter()
            .collect();

        let current: Vec<String> = self.listeners.keys().cloned().collect();
        for tenant_id in current {
            if !desired.contains(&tenant_id) {
                if let Some(handle) = self.listeners.remove(&tenant_id) {
                    tracing::info!(tenant_id, "tenant disconnected Salesforce; stopping listener");
                    handle.stop().await;
                }
            }
        }

        for tenant_id in desired {
            if !self.listeners.contains_key(&tenant_id) {
                self.start_listener(tenant_id);
            }
        }
        Ok(())
    }

    fn start_listener(&mut self, tenant_id: String) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = ListenerConfig {
            tenant_id: tenant_id.clone(),
            credentials: self.credentials.clone(),
            queue: self.queue.clone(),
        };
        let task = tokio::spawn(listener(config, shutdown_rx));
        self.listeners
            .insert(tenant_id, ListenerHandle { shutdown_tx, task });
    }
}
