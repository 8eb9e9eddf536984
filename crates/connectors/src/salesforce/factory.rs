use super::client::{SalesforceClient, RATE_LIMIT};
use crate::util::redact_token;
use crate::JobContext;
use chrono::Utc;
use ingest_sql::{advisory_xact_lock, encode_datetime, parse_datetime, token_refresh_lock_key, ConfigStore};
use limiter::Error;
use sqlx::Row;
use std::time::Duration;

const ACCESS_TOKEN_KEY: &str = "SALESFORCE_ACCESS_TOKEN";
const REFRESH_TOKEN_KEY: &str = "SALESFORCE_REFRESH_TOKEN";
const EXPIRES_AT_KEY: &str = "SALESFORCE_TOKEN_EXPIRES_AT";

/// Salesforce does not return an expiry with refreshed tokens; sessions
/// default to two hours, recorded with a margin.
const ASSUMED_TOKEN_LIFETIME_MINUTES: i64 = 115;
/// Tokens expiring within this window refresh eagerly.
const REFRESH_BUFFER_MINUTES: i64 = 5;

/// Build a ready Salesforce client for one tenant: resolve instance
/// configuration from the tenant database, ensure a fresh access token
/// (refreshing under the tenant's advisory lock when needed), and attach the
/// shared rate-limit bucket.
pub async fn client_for_tenant(
    ctx: &JobContext,
    pool: &sqlx::PgPool,
    tenant_id: &str,
) -> limiter::Result<SalesforceClient> {
    let config = ConfigStore::new(pool.clone());

    let instance_url = config
        .get("SALESFORCE_INSTANCE_URL")
        .await?
        .ok_or_else(|| missing_config(tenant_id, "SALESFORCE_INSTANCE_URL"))?;
    let org_id = config
        .get("SALESFORCE_ORG_ID")
        .await?
        .ok_or_else(|| missing_config(tenant_id, "SALESFORCE_ORG_ID"))?;

    let access_token = ensure_fresh_access_token(ctx, pool, tenant_id, &instance_url).await?;
    tracing::info!(
        tenant_id,
        token_preview = %redact_token(&access_token),
        "Salesforce client credentials loaded"
    );

    let bucket = ctx.limits.bucket(tenant_id, "salesforce", RATE_LIMIT);
    SalesforceClient::new(&instance_url, &org_id, &access_token, bucket)
}

fn missing_config(tenant_id: &str, key: &str) -> Error {
    Error::Other(anyhow::anyhow!(
        "no {key} configured for tenant {tenant_id}"
    ))
}

async fn ensure_fresh_access_token(
    ctx: &JobContext,
    pool: &sqlx::PgPool,
    tenant_id: &str,
    instance_url: &str,
) -> limiter::Result<String> {
    let config = ConfigStore::new(pool.clone());

    // Fast path: a cached token with comfortable margin.
    if let (Some(token), Some(expires_at)) = (
        ctx.vault
            .get_oauth_token(tenant_id, ACCESS_TOKEN_KEY)
            .await
            .map_err(|err| Error::Other(err.into()))?,
        config.get_datetime(EXPIRES_AT_KEY).await?,
    ) {
        if expires_at > Utc::now() + chrono::Duration::minutes(REFRESH_BUFFER_MINUTES) {
            return Ok(token);
        }
    }

    // Slow path: refresh, serialized per tenant by an advisory lock so two
    // workers never spend the same refresh token.
    let mut txn = pool.begin().await.map_err(|err| Error::Other(err.into()))?;
    advisory_xact_lock(&mut txn, &token_refresh_lock_key(tenant_id, "salesforce"))
        .await
        .map_err(|err| Error::Other(err.into()))?;

    // Re-read the expiry inside the lock; another worker may have already
    // refreshed while we waited.
    let expires_at = sqlx::query("SELECT value FROM config WHERE key = $1")
        .bind(EXPIRES_AT_KEY)
        .fetch_optional(&mut txn)
        .await
        .map_err(|err| Error::Other(err.into()))?
        .and_then(|row| row.try_get::<String, _>("value").ok())
        .and_then(|value| parse_datetime(&value).ok());

    if let Some(expires_at) = expires_at {
        if expires_at > Utc::now() + chrono::Duration::minutes(REFRESH_BUFFER_MINUTES) {
            let token = ctx
                .vault
                .get_parameter(
                    &vault::api_key_name(tenant_id, ACCESS_TOKEN_KEY),
                    Some(Duration::ZERO), // skip the cache: it holds the pre-refresh token
                )
                .await
                .map_err(|err| Error::Other(err.into()))?;
            if let Some(token) = token {
                txn.commit().await.map_err(|err| Error::Other(err.into()))?;
                tracing::info!(tenant_id, "reusing access token refreshed by another worker");
                return Ok(token);
            }
        }
    }

    let refresh_token = ctx
        .vault
        .get_api_key(tenant_id, REFRESH_TOKEN_KEY)
        .await
        .map_err(|err| Error::Other(err.into()))?
        .ok_or_else(|| {
            Error::Other(anyhow::anyhow!(
                "no Salesforce refresh token configured for tenant {tenant_id}"
            ))
        })?;

    let client_id = env_var("SALESFORCE_CLIENT_ID")?;
    let client_secret = env_var("SALESFORCE_CONSUMER_SECRET")?;

    let access_token =
        exchange_refresh_token(instance_url, &refresh_token, &client_id, &client_secret).await?;

    // Persist the new token and its expiry within the lock window, so the
    // next reader observes both or neither.
    ctx.vault
        .store_api_key(tenant_id, ACCESS_TOKEN_KEY, &access_token)
        .await
        .map_err(|err| Error::Other(err.into()))?;

    let new_expiry =
        encode_datetime(Utc::now() + chrono::Duration::minutes(ASSUMED_TOKEN_LIFETIME_MINUTES));
    sqlx::query(
        "INSERT INTO config (key, value) VALUES ($1, $2) \
         ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
    )
    .bind(EXPIRES_AT_KEY)
    .bind(&new_expiry)
    .execute(&mut txn)
    .await
    .map_err(|err| Error::Other(err.into()))?;
    txn.commit().await.map_err(|err| Error::Other(err.into()))?;

    tracing::info!(tenant_id, "refreshed Salesforce access token");
    Ok(access_token)
}

fn env_var(name: &'static str) -> limiter::Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Other(anyhow::anyhow!("{name} environment variable is required")))
}

/// Exchange the refresh token for a new access token. Auth failures are
/// terminal; transient failures return to the queue as rate limits without
/// consuming a retry budget.
async fn exchange_refresh_token(
    instance_url: &str,
    refresh_token: &str,
    client_id: &str,
    client_secret: &str,
) -> limiter::Result<String> {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(Error::from)?;

    let token_url = format!(
        "{}/services/oauth2/token",
        instance_url.trim_end_matches('/')
    );
    let response = http
        .post(&token_url)
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client_id),
            ("client_secret", client_secret),
        ])
        .send()
        .await
        .map_err(|err| {
            if err.is_timeout() || err.is_connect() {
                Error::rate_limited(35, format!("Salesforce token refresh transport error: {err}"))
            } else {
                Error::Other(anyhow::Error::new(err).context("Salesforce token refresh"))
            }
        })?;

    let status = response.status().as_u16();
    match status {
        200 => {
            let body: serde_json::Value = response.json().await.map_err(Error::from)?;
            body.get("access_token")
                .and_then(|token| token.as_str())
                .map(str::to_string)
                .ok_or_else(|| Error::Other(anyhow::anyhow!("token response carried no access_token")))
        }
        400 | 401 | 403 => {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status, "Salesforce token refresh auth failure");
            Err(Error::AuthFailed { status, body })
        }
        429 | 500..=599 => Err(Error::rate_limited(
            35,
            format!("Salesforce token refresh failed with status {status}"),
        )),
        _ => {
            let body = response.text().await.unwrap_or_default();
            Err(Error::Api { status, body })
        }
    }
}
