use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use vault::Vault;

const TENANT_DATABASE_URL: &str = "TENANT_DATABASE_URL";

/// Process-wide manager of per-tenant database pools: a pool opens on first
/// use from the tenant's vaulted credential and closes on tenant removal.
pub struct TenantPools {
    vault: Arc<dyn Vault>,
    max_connections: u32,
    // The async lock is held across the initial connect so concurrent jobs
    // for a new tenant share one dial instead of racing.
    pools: tokio::sync::Mutex<HashMap<String, PgPool>>,
}

impl TenantPools {
    pub fn new(vault: Arc<dyn Vault>, max_connections: u32) -> Self {
        Self {
            vault,
            max_connections,
            pools: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub async fn acquire(&self, tenant_id: &str) -> anyhow::Result<PgPool> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(tenant_id) {
            return Ok(pool.clone());
        }

        let url = self
            .vault
            .get_db_credential(tenant_id, TENANT_DATABASE_URL)
            .await?
            .with_context(|| format!("no database credential for tenant {tenant_id}"))?;

        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .connect(&url)
            .await
            .with_context(|| format!("failed to connect tenant {tenant_id} database"))?;

        tracing::info!(tenant_id, "opened tenant database pool");
        pools.insert(tenant_id.to_string(), pool.clone());
        Ok(pool)
    }

    /// Close and drop the tenant's pool, part of the deletion cascade.
    pub async fn remove(&self, tenant_id: &str) {
        let pool = self.pools.lock().await.remove(tenant_id);
        if let Some(pool) = pool {
            pool.close().await;
            tracing::info!(tenant_id, "closed tenant database pool");
        }
    }

    pub async fn open_tenants(&self) -> Vec<String> {
        self.pools.lock().await.keys().cloned().collect()
    }
}
