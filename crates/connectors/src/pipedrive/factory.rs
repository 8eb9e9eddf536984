use super::client::{PipedriveClient, RATE_LIMIT};
use crate::JobContext;
use chrono::Utc;
use ingest_sql::{advisory_xact_lock, encode_datetime, parse_datetime, token_refresh_lock_key};
use limiter::Error;
use sqlx::Row;
use std::time::Duration;

const OAUTH_TOKEN_URL: &str = "https://oauth.pipedrive.com/oauth/token";

const ACCESS_TOKEN_KEY: &str = "PIPEDRIVE_ACCESS_TOKEN";
const REFRESH_TOKEN_KEY: &str = "PIPEDRIVE_REFRESH_TOKEN";
const EXPIRES_AT_KEY: &str = "PIPEDRIVE_TOKEN_EXPIRES_AT";

const REFRESH_BUFFER_MINUTES: i64 = 5;
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

/// Build a ready Pipedrive client for one tenant. Refresh tokens rotate
/// only sometimes; when the token response carries a new one it persists in
/// the same lock window as the expiry.
pub async fn client_for_tenant(
    ctx: &JobContext,
    pool: &sqlx::PgPool,
    tenant_id: &str,
) -> limiter::Result<PipedriveClient> {
    let config = ingest_sql::ConfigStore::new(pool.clone());

    let api_domain = config
        .get("PIPEDRIVE_API_DOMAIN")
        .await?
        .ok_or_else(|| {
            Error::Other(anyhow::anyhow!(
                "no Pipedrive API domain configured for tenant {tenant_id}"
            ))
        })?;

    // Fast path outside the lock.
    if let (Some(token), Some(expires_at)) = (
        ctx.vault
            .get_oauth_token(tenant_id, ACCESS_TOKEN_KEY)
            .await
            .map_err(|err| Error::Other(err.into()))?,
        config.get_datetime(EXPIRES_AT_KEY).await?,
    ) {
        if expires_at > Utc::now() + chrono::Duration::minutes(REFRESH_BUFFER_MINUTES) {
            let bucket = ctx.limits.bucket(tenant_id, "pipedrive", RATE_LIMIT);
            return PipedriveClient::new(&token, &api_domain, bucket);
        }
    }

    let mut txn = pool.begin().await.map_err(|err| Error::Other(err.into()))?;
    advisory_xact_lock(&mut txn, &token_refresh_lock_key(tenant_id, "pipedrive"))
        .await
        .map_err(|err| Error::Other(err.into()))?;

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
                    Some(Duration::ZERO),
                )
                .await
                .map_err(|err| Error::Other(err.into()))?;
            if let Some(token) = token {
                txn.commit().await.map_err(|err| Error::Other(err.into()))?;
                let bucket = ctx.limits.bucket(tenant_id, "pipedrive", RATE_LIMIT);
                return PipedriveClient::new(&token, &api_domain, bucket);
            }
        }
    }

    let refresh_token = ctx
        .vault
        .get_parameter(
            &vault::api_key_name(tenant_id, REFRESH_TOKEN_KEY),
            Some(Duration::ZERO),
        )
        .await
        .map_err(|err| Error::Other(err.into()))?
        .ok_or_else(|| {
            Error::Other(anyhow::anyhow!(
                "no Pipedrive refresh token configured for tenant {tenant_id}"
            ))
        })?;
    let client_id = env_var("PIPEDRIVE_CLIENT_ID")?;
    let client_secret = env_var("PIPEDRIVE_CLIENT_SECRET")?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(Error::from)?;
    let basic = base64::encode(format!("{client_id}:{client_secret}"));
    let response = http
        .post(OAUTH_TOKEN_URL)
        .header(reqwest::header::AUTHORIZATION, format!("Basic {basic}"))
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
        ])
        .send()
        .await
        .map_err(|err| {
            if err.is_timeout() || err.is_connect() {
                Error::rate_limited(35, format!("Pipedrive token refresh transport error: {err}"))
            } else {
                Error::Other(anyhow::Error::new(err).context("Pipedrive token refresh"))
            }
        })?;

    let status = response.status().as_u16();
    let body: serde_json::Value = match status {
        200 => response.json().await?,
        400 | 401 | 403 => {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(tenant_id, status, "Pipedrive token refresh auth failure");
            return Err(Error::AuthFailed { status, body });
        }
        429 | 500..=599 => {
            return Err(Error::rate_limited(
                35,
                format!("Pipedrive token refresh failed with status {status}"),
            ))
        }
        _ => {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api { status, body });
        }
    };

    let access_token = body
        .get("access_token")
        .and_then(|token| token.as_str())
        .ok_or_else(|| Error::Other(anyhow::anyhow!("token response carried no access_token")))?
        .to_string();

    ctx.vault
        .store_api_key(tenant_id, ACCESS_TOKEN_KEY, &access_token)
        .await
        .map_err(|err| Error::Other(err.into()))?;
    // Rotation is conditional: only persist a refresh token when one came
    // back.
    if let Some(new_refresh_token) = body.get("refresh_token").and_then(|token| token.as_str()) {
        ctx.vault
            .store_api_key(tenant_id, REFRESH_TOKEN_KEY, new_refresh_token)
            .await
            .map_err(|err| Error::Other(err.into()))?;
    }

    let lifetime = body
        .get("expires_in")
        .and_then(|expires| expires.as_i64())
        .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
    let new_expiry = encode_datetime(Utc::now() + chrono::Duration::seconds(lifetime));
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

    tracing::info!(tenant_id, "refreshed Pipedrive access token");
    let bucket = ctx.limits.bucket(tenant_id, "pipedrive", RATE_LIMIT);
    PipedriveClient::new(&access_token, &api_domain, bucket)
}

fn env_var(name: &'static str) -> limiter::Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Other(anyhow::anyhow!("{name} environment variable is required")))
}
