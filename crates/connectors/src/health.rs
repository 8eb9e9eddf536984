//! Per-source health checks: one minimal authenticated call each, dispatched
//! through a central registry by source tag.

use crate::JobContext;
use models::SourceKind;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub healthy: bool,
    pub message: String,
}

impl HealthStatus {
    pub fn healthy(message: impl Into<String>) -> Self {
        Self {
            healthy: true,
            message: message.into(),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: message.into(),
        }
    }
}

#[async_trait::async_trait]
pub trait HealthCheck: Send + Sync {
    fn source(&self) -> SourceKind;

    async fn check(&self, ctx: &JobContext, tenant_id: &str) -> HealthStatus;
}

#[derive(Default)]
pub struct HealthRegistry {
    checks: HashMap<SourceKind, Arc<dyn HealthCheck>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, check: Arc<dyn HealthCheck>) -> Self {
        let source = check.source();
        if self.checks.insert(source, check).is_some() {
            panic!("a HealthCheck for {source} is already registered");
        }
        self
    }

    pub async fn run(&self, ctx: &JobContext, source: SourceKind, tenant_id: &str) -> HealthStatus {
        match self.checks.get(&source) {
            Some(check) => {
                let status = check.check(ctx, tenant_id).await;
                tracing::info!(
                    %source,
                    tenant_id,
                    healthy = status.healthy,
                    message = %status.message,
                    "health check"
                );
                status
            }
            None => HealthStatus::unhealthy(format!("no health check registered for {source}")),
        }
    }

    pub fn sources(&self) -> Vec<SourceKind> {
        let mut sources: Vec<_> = self.checks.keys().copied().collect();
        sources.sort();
        sources
    }
}
