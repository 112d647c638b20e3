//! One-shot lock table maintenance: ensure the schema exists, then delete
//! expired leases. Meant to be run from cron; exits non-zero on failure.

use anyhow::Context;
use jobguard_infra::{JobGuardConfig, PostgresLockStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobguard_observability::init();

    let config = JobGuardConfig::from_env().context("invalid configuration")?;
    let database_url = config.require_database_url()?;

    let store = PostgresLockStore::connect(database_url, config.db_max_connections)
        .await
        .context("failed to connect to lock store")?;
    store
        .ensure_schema()
        .await
        .context("failed to ensure job_locks schema")?;

    let locks = config.lock_manager(store);
    let removed = locks
        .cleanup_expired_locks()
        .await
        .context("failed to clean up expired locks")?;

    tracing::info!(removed, "lock cleanup finished");
    Ok(())
}
