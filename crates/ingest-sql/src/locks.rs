use sqlx::{Postgres, Transaction};

/// Take a transaction-scoped advisory lock on a string key. The lock releases
/// with the transaction, so a crashed holder can never wedge the key.
pub async fn advisory_xact_lock(
    txn: &mut Transaction<'_, Postgres>,
    key: &str,
) -> sqlx::Result<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1)::BIGINT)")
        .bind(key)
        .execute(&mut *txn)
        .await?;
    Ok(())
}

/// Lock key serializing credential refresh for one (tenant, source): the
/// refreshing transaction owns both the vault write and the expiry update.
pub fn token_refresh_lock_key(tenant_id: &str, source: &str) -> String {
    format!("{tenant_id}:{source}:token_refresh")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lock_keys_are_scoped_per_tenant_and_source() {
        let a = token_refresh_lock_key("t1", "canva");
        let b = token_refresh_lock_key("t1", "salesforce");
        let c = token_refresh_lock_key("t2", "canva");
        assert_eq!(a, "t1:canva:token_refresh");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
