use sqlx::{PgPool, Row};

/// Tenants flagged in the control plane as having Salesforce connected.
/// The CDC manager reconciles its listener fleet against this set.
pub async fn tenants_with_salesforce(control_pool: &PgPool) -> anyhow::Result<Vec<String>> {
    let rows =
        sqlx::query("SELECT id FROM public.tenants WHERE has_salesforce_connected = true")
            .fetch_all(control_pool)
            .await?;
    rows.into_iter()
        .map(|row| Ok(row.try_get::<String, _>("id")?))
        .collect()
}
