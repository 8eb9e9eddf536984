use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

/// Typed wrapper over the per-tenant `config(key text primary key, value
/// text)` table which records watermarks, completion flags, and non-secret
/// connector settings.
///
/// Getters return `None` for absent keys. Setters with `None` delete.
#[derive(Clone)]
pub struct ConfigStore {
    pool: PgPool,
}

/// Datetime values are RFC 3339 with offset, always UTC on write.
pub fn encode_datetime(value: DateTime<Utc>) -> String {
    value.to_rfc3339()
}

pub fn parse_datetime(value: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("invalid datetime config value {value:?}"))?
        .with_timezone(&Utc))
}

impl ConfigStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM config WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| row.try_get::<String, _>("value"))
            .transpose()
            .context("failed to read config value")
    }

    pub async fn set(&self, key: &str, value: Option<&str>) -> anyhow::Result<()> {
        match value {
            Some(value) => {
                sqlx::query(
                    "INSERT INTO config (key, value) VALUES ($1, $2) \
                     ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
                )
                .bind(key)
                .bind(value)
                .execute(&self.pool)
                .await?;
            }
            None => {
                self.delete(key).await?;
            }
        }
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM config WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete every key under a reserved prefix (used when clearing all
    /// per-container cursors of a source).
    pub async fn delete_prefix(&self, prefix: &str) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM config WHERE key LIKE $1")
            .bind(format!("{prefix}%"))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn get_datetime(&self, key: &str) -> anyhow::Result<Option<DateTime<Utc>>> {
        self.get(key)
            .await?
            .map(|value| parse_datetime(&value))
            .transpose()
    }

    pub async fn set_datetime(
        &self,
        key: &str,
        value: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        self.set(key, value.map(encode_datetime).as_deref()).await
    }

    pub async fn get_bool(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.get(key).await?.as_deref() == Some("true"))
    }

    pub async fn set_bool(&self, key: &str, value: bool) -> anyhow::Result<()> {
        self.set(key, Some(if value { "true" } else { "false" }))
            .await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn datetime_encoding_round_trips() {
        let value = Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap();
        let encoded = encode_datetime(value);
        assert_eq!(parse_datetime(&encoded).unwrap(), value);
    }

    #[test]
    fn offset_datetimes_normalize_to_utc() {
        let parsed = parse_datetime("2026-03-14T11:26:53+02:00").unwrap();
        assert_eq!(
            parsed,
            Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap()
        );
    }

    #[test]
    fn garbage_datetimes_are_rejected() {
        assert!(parse_datetime("last tuesday").is_err());
    }
}
