//! SQL access for the ingestion plane: per-tenant pool management, the
//! sync-state config KV, the artifact store, advisory locks, and backfill
//! progress accounting.

mod artifacts;
mod config;
mod control;
mod documents;
mod locks;
mod pool;
mod progress;

pub use artifacts::{ArtifactStore, UPSERT_BATCH_SIZE};
pub use config::{encode_datetime, parse_datetime, ConfigStore};
pub use control::tenants_with_salesforce;
pub use documents::indexed_document_ids;
pub use locks::{advisory_xact_lock, token_refresh_lock_key};
pub use pool::TenantPools;
pub use progress::{BackfillProgress, ProgressCounts};
