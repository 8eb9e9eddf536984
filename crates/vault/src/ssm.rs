use crate::{Error, ParameterCache, Result, Vault};
use aws_sdk_ssm::error::DisplayErrorContext;
use aws_sdk_ssm::types::{ParameterTier, ParameterType};
use std::time::Duration;

/// SSM Parameter Store vault. Only SecureString parameters, always encrypted
/// with the configured KMS key.
pub struct SsmVault {
    client: aws_sdk_ssm::Client,
    kms_key_id: String,
    cache: ParameterCache,
}

impl SsmVault {
    pub fn new(client: aws_sdk_ssm::Client, kms_key_id: String) -> Self {
        Self {
            client,
            kms_key_id,
            cache: ParameterCache::default(),
        }
    }

    pub async fn from_env() -> anyhow::Result<Self> {
        let kms_key_id = std::env::var("KMS_KEY_ID")
            .map_err(|_| anyhow::anyhow!("KMS_KEY_ID environment variable is required"))?;
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Ok(Self::new(aws_sdk_ssm::Client::new(&config), kms_key_id))
    }

    fn backend_error(operation: &'static str, err: impl std::fmt::Debug + std::fmt::Display) -> Error {
        Error::Backend {
            operation,
            message: format!("{err}"),
        }
    }
}

#[async_trait::async_trait]
impl Vault for SsmVault {
    async fn get_parameter(&self, name: &str, ttl: Option<Duration>) -> Result<Option<String>> {
        if let Some(value) = self.cache.get(name, ttl) {
            tracing::debug!(name, "vault cache hit");
            return Ok(Some(value));
        }

        let response = self
            .client
            .get_parameter()
            .name(name)
            .with_decryption(true)
            .send()
            .await;

        match response {
            Ok(output) => {
                let value = output.parameter.and_then(|p| p.value);
                if let Some(value) = &value {
                    self.cache.insert(name, value);
                }
                Ok(value)
            }
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_parameter_not_found() {
                    tracing::debug!(name, "vault parameter not found");
                    Ok(None)
                } else {
                    Err(Self::backend_error(
                        "get_parameter",
                        DisplayErrorContext(&service_err),
                    ))
                }
            }
        }
    }

    async fn put_parameter(&self, name: &str, value: &str) -> Result<()> {
        self.client
            .put_parameter()
            .name(name)
            .value(value)
            .r#type(ParameterType::SecureString)
            .tier(ParameterTier::Advanced)
            .overwrite(true)
            .key_id(&self.kms_key_id)
            .send()
            .await
            .map_err(|err| Self::backend_error("put_parameter", DisplayErrorContext(&err)))?;

        self.cache.invalidate(name);
        tracing::info!(name, "stored vault parameter");
        Ok(())
    }

    async fn delete_parameter(&self, name: &str) -> Result<()> {
        let response = self.client.delete_parameter().name(name).send().await;

        match response {
            Ok(_) => {
                self.cache.invalidate(name);
                tracing::info!(name, "deleted vault parameter");
                Ok(())
            }
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_parameter_not_found() {
                    self.cache.invalidate(name);
                    Ok(())
                } else {
                    Err(Self::backend_error(
                        "delete_parameter",
                        DisplayErrorContext(&service_err),
                    ))
                }
            }
        }
    }

    async fn list_parameters_by_path(&self, path: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut pages = self
            .client
            .get_parameters_by_path()
            .path(path)
            .recursive(true)
            .with_decryption(false)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|err| {
                Self::backend_error("get_parameters_by_path", DisplayErrorContext(&err))
            })?;
            names.extend(
                page.parameters
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|p| p.name),
            );
        }

        tracing::debug!(path, count = names.len(), "listed vault parameters");
        Ok(names)
    }
}
