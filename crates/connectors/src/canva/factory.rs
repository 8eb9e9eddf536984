use super::client::{CanvaClient, RATE_LIMIT};
use crate::JobContext;
use chrono::Utc;
use ingest_sql::{advisory_xact_lock, encode_datetime, parse_datetime, token_refresh_lock_key};
use limiter::Error;
use sqlx::Row;
use std::time::Duration;

const OAUTH_TOKEN_URL: &str = "https://api.canva.com/rest/v1/oauth/token";

const ACCESS_TOKEN_KEY: &str = "CANVA_ACCESS_TOKEN";
const REFRESH_TOKEN_KEY: &str = "CANVA_REFRESH_TOKEN";
const EXPIRES_AT_KEY: &str = "CANVA_TOKEN_EXPIRES_AT";

const REFRESH_BUFFER_MINUTES: i64 = 5;
/// Fallback when the token response omits `expires_in` (it normally says
/// 14400 seconds).
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 14_400;

struct RotatedTokens {
    access_token: String,
    refresh_token: String,
    expires_in_secs: i64,
}

/// Build a ready Canva client for one tenant.
///
/// Canva refresh tokens are one-shot: every refresh rotates both tokens, so
/// the whole exchange is serialized under the tenant's advisory lock and the
/// rotated pair persists before the lock releases. A second concurrent
/// worker re-reads inside the lock and reuses the fresh pair instead of
/// burning the rotated refresh token.
pub async fn client_for_tenant(
    ctx: &JobContext,
    pool: &sqlx::PgPool,
    tenant_id: &str,
) -> limiter::Result<CanvaClient> {
    let config = ingest_sql::ConfigStore::new(pool.clone());

    // Fast path: the current access token is still comfortably fresh.
    if let (Some(token), Some(expires_at)) = (
        ctx.vault
            .get_oauth_token(tenant_id, ACCESS_TOKEN_KEY)
            .await
            .map_err(|err| Error::Other(err.into()))?,
        config.get_datetime(EXPIRES_AT_KEY).await?,
    ) {
        if expires_at > Utc::now() + chrono::Duration::minutes(REFRESH_BUFFER_MINUTES) {
            let bucket = ctx.limits.bucket(tenant_id, "canva", RATE_LIMIT);
            return CanvaClient::new(&token, bucket);
        }
    }

    let mut txn = pool.begin().await.map_err(|err| Error::Other(err.into()))?;
    advisory_xact_lock(&mut txn, &token_refresh_lock_key(tenant_id, "canva"))
        .await
        .map_err(|err| Error::Other(err.into()))?;

    // Re-read inside the lock: a concurrent worker may have rotated already.
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
                tracing::info!(tenant_id, "reusing Canva tokens rotated by another worker");
                let bucket = ctx.limits.bucket(tenant_id, "canva", RATE_LIMIT);
                return CanvaClient::new(&token, bucket);
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
                "no Canva refresh token configured for tenant {tenant_id}"
            ))
        })?;
    let client_id = env_var("CANVA_CLIENT_ID")?;
    let client_secret = env_var("CANVA_CLIENT_SECRET")?;

    let rotated = refresh_tokens(tenant_id, &refresh_token, &client_id, &client_secret).await?;

    // Persist the rotated pair and the expiry together, inside the lock
    // window: losing the new refresh token would strand the tenant.
    ctx.vault
        .store_api_key(tenant_id, ACCESS_TOKEN_KEY, &rotated.access_token)
        .await
        .map_err(|err| Error::Other(err.into()))?;
    ctx.vault
        .store_api_key(tenant_id, REFRESH_TOKEN_KEY, &rotated.refresh_token)
        .await
        .map_err(|err| Error::Other(err.into()))?;

    let new_expiry =
        encode_datetime(Utc::now() + chrono::Duration::seconds(rotated.expires_in_secs));
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

    tracing::info!(tenant_id, "rotated Canva tokens");
    let bucket = ctx.limits.bucket(tenant_id, "canva", RATE_LIMIT);
    CanvaClient::new(&rotated.access_token, bucket)
}

fn env_var(name: &'static str) -> limiter::Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Other(anyhow::anyhow!("{name} environment variable is required")))
}

async fn refresh_tokens(
    tenant_id: &str,
    refresh_token: &str,
    client_id: &str,
    client_secret: &str,
) -> limiter::Result<RotatedTokens> {
    let basic = base64::encode(format!("{client_id}:{client_secret}"));

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(Error::from)?;
    let response = http
        .post(OAUTH_TOKEN_URL)
        .header(reqwest::header::AUTHORIZATION, format!("Basic {basic}"))
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .send()
        .await
        .map_err(|err| {
            if err.is_timeout() || err.is_connect() {
                Error::rate_limited(30, format!("Canva token refresh transport error: {err}"))
            } else {
                Error::Other(anyhow::Error::new(err).context("Canva token refresh"))
            }
        })?;

    let status = response.status().as_u16();
    match status {
        200 => {
            let body: serde_json::Value = response.json().await?;
            let access_token = body
                .get("access_token")
                .and_then(|token| token.as_str())
                .map(str::to_string);
            let new_refresh_token = body
                .get("refresh_token")
                .and_then(|token| token.as_str())
                .map(str::to_string);
            match (access_token, new_refresh_token) {
                (Some(access_token), Some(refresh_token)) => Ok(RotatedTokens {
                    access_token,
                    refresh_token,
                    expires_in_secs: body
                        .get("expires_in")
                        .and_then(|expires| expires.as_i64())
                        .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS),
                }),
                _ => Err(Error::Other(anyhow::anyhow!(
                    "Canva token response missing the rotated token pair"
                ))),
            }
        }
        400 | 401 | 403 => {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(tenant_id, status, "Canva token refresh auth failure");
            Err(Error::AuthFailed { status, body })
        }
        429 => {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse().ok())
                .unwrap_or(60u64);
            Err(Error::rate_limited(
                retry_after.max(30),
                "Canva token refresh rate limited",
            ))
        }
        500..=599 => Err(Error::rate_limited(
            30,
            format!("Canva token refresh failed with status {status}"),
        )),
        _ => {
            let body = response.text().await.unwrap_or_default();
            Err(Error::Api { status, body })
        }
    }
}
