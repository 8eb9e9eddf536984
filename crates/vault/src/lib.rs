//! Per-tenant credentials vault backed by SSM Parameter Store.
//!
//! Every secret lives under the tenant's path prefix:
//!
//! - `/<tenant>/api-key/<NAME>` for bearer tokens and API keys;
//! - `/<tenant>/signing-secret/<source>` for webhook HMAC secrets;
//! - `/<tenant>/db-credential/<name>` for database URLs.
//!
//! All parameters are SecureString, KMS-encrypted. Reads may be cached with a
//! per-call TTL; writes invalidate the cache immediately. Tenant deletion
//! cascades by removing everything under the prefix.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

mod ssm;
pub use ssm::SsmVault;

/// TTL applied to cached OAuth access tokens.
pub const OAUTH_TOKEN_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("vault {operation} failed: {message}")]
    Backend {
        operation: &'static str,
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

pub fn api_key_name(tenant_id: &str, key_name: &str) -> String {
    format!("/{tenant_id}/api-key/{key_name}")
}

pub fn signing_secret_name(tenant_id: &str, source: &str) -> String {
    format!("/{tenant_id}/signing-secret/{source}")
}

pub fn db_credential_name(tenant_id: &str, credential: &str) -> String {
    format!("/{tenant_id}/db-credential/{credential}")
}

#[async_trait::async_trait]
pub trait Vault: Send + Sync {
    /// Fetch a decrypted parameter. `ttl` bounds how stale a cached value may
    /// be; `None` means any cached value is acceptable.
    async fn get_parameter(&self, name: &str, ttl: Option<Duration>) -> Result<Option<String>>;

    /// Store a SecureString parameter, overwriting and invalidating caches.
    async fn put_parameter(&self, name: &str, value: &str) -> Result<()>;

    /// Delete one parameter. Deleting an absent parameter is a success.
    async fn delete_parameter(&self, name: &str) -> Result<()>;

    /// List all parameter names under a path prefix.
    async fn list_parameters_by_path(&self, path: &str) -> Result<Vec<String>>;

    async fn get_api_key(&self, tenant_id: &str, key_name: &str) -> Result<Option<String>> {
        self.get_parameter(&api_key_name(tenant_id, key_name), None)
            .await
    }

    /// API-key fetch for OAuth access tokens, bounded by the standard 1 h TTL
    /// so rotated tokens are picked up without hammering the backend.
    async fn get_oauth_token(&self, tenant_id: &str, key_name: &str) -> Result<Option<String>> {
        self.get_parameter(&api_key_name(tenant_id, key_name), Some(OAUTH_TOKEN_TTL))
            .await
    }

    async fn store_api_key(&self, tenant_id: &str, key_name: &str, value: &str) -> Result<()> {
        self.put_parameter(&api_key_name(tenant_id, key_name), value)
            .await
    }

    async fn get_signing_secret(&self, tenant_id: &str, source: &str) -> Result<Option<String>> {
        self.get_parameter(&signing_secret_name(tenant_id, source), None)
            .await
    }

    async fn get_db_credential(&self, tenant_id: &str, credential: &str) -> Result<Option<String>> {
        self.get_parameter(&db_credential_name(tenant_id, credential), None)
            .await
    }

    /// Remove every parameter for a tenant. Part of the control-plane
    /// deletion cascade. Returns the number of parameters removed.
    async fn delete_tenant_parameters(&self, tenant_id: &str) -> Result<usize> {
        let names = self
            .list_parameters_by_path(&format!("/{tenant_id}"))
            .await?;
        for name in &names {
            self.delete_parameter(name).await?;
        }
        tracing::info!(tenant_id, deleted = names.len(), "deleted tenant vault parameters");
        Ok(names.len())
    }
}

/// In-memory vault for tests and local development.
#[derive(Default)]
pub struct MemoryVault {
    parameters: Mutex<HashMap<String, String>>,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parameter(self, name: &str, value: &str) -> Self {
        self.parameters
            .lock()
            .unwrap()
            .insert(name.to_string(), value.to_string());
        self
    }
}

#[async_trait::async_trait]
impl Vault for MemoryVault {
    async fn get_parameter(&self, name: &str, _ttl: Option<Duration>) -> Result<Option<String>> {
        Ok(self.parameters.lock().unwrap().get(name).cloned())
    }

    async fn put_parameter(&self, name: &str, value: &str) -> Result<()> {
        self.parameters
            .lock()
            .unwrap()
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn delete_parameter(&self, name: &str) -> Result<()> {
        self.parameters.lock().unwrap().remove(name);
        Ok(())
    }

    async fn list_parameters_by_path(&self, path: &str) -> Result<Vec<String>> {
        Ok(self
            .parameters
            .lock()
            .unwrap()
            .keys()
            .filter(|name| name.starts_with(path))
            .cloned()
            .collect())
    }
}

/// Value cache shared by vault implementations: (value, fetched-at) pairs
/// checked against the caller's TTL.
#[derive(Default)]
pub(crate) struct ParameterCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl ParameterCache {
    pub fn get(&self, name: &str, ttl: Option<Duration>) -> Option<String> {
        let entries = self.entries.lock().unwrap();
        let (value, fetched_at) = entries.get(name)?;
        match ttl {
            Some(ttl) if fetched_at.elapsed() >= ttl => None,
            _ => Some(value.clone()),
        }
    }

    pub fn insert(&self, name: &str, value: &str) {
        self.entries
            .lock()
            .unwrap()
            .insert(name.to_string(), (value.to_string(), Instant::now()));
    }

    pub fn invalidate(&self, name: &str) {
        self.entries.lock().unwrap().remove(name);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn key_scheme() {
        assert_eq!(
            api_key_name("tenant42", "CANVA_REFRESH_TOKEN"),
            "/tenant42/api-key/CANVA_REFRESH_TOKEN"
        );
        assert_eq!(
            signing_secret_name("tenant42", "gitlab"),
            "/tenant42/signing-secret/gitlab"
        );
        assert_eq!(
            db_credential_name("tenant42", "TENANT_DATABASE_URL"),
            "/tenant42/db-credential/TENANT_DATABASE_URL"
        );
    }

    #[tokio::test]
    async fn tenant_deletion_cascades() {
        let vault = MemoryVault::new()
            .with_parameter("/t1/api-key/A", "1")
            .with_parameter("/t1/signing-secret/slack", "2")
            .with_parameter("/t2/api-key/A", "3");

        let deleted = vault.delete_tenant_parameters("t1").await.unwrap();
        assert_eq!(deleted, 2);

        assert_eq!(vault.get_api_key("t1", "A").await.unwrap(), None);
        assert_eq!(
            vault.get_api_key("t2", "A").await.unwrap(),
            Some("3".to_string())
        );
    }

    #[test]
    fn cache_respects_ttl() {
        let cache = ParameterCache::default();
        cache.insert("/t/api-key/X", "value");

        assert_eq!(
            cache.get("/t/api-key/X", None),
            Some("value".to_string())
        );
        assert_eq!(
            cache.get("/t/api-key/X", Some(Duration::from_secs(3600))),
            Some("value".to_string())
        );
        // A zero TTL always misses.
        assert_eq!(cache.get("/t/api-key/X", Some(Duration::ZERO)), None);

        cache.invalidate("/t/api-key/X");
        assert_eq!(cache.get("/t/api-key/X", None), None);
    }
}
