//! BMC credential resolution.
//!
//! Credentials are looked up for every driver call and never cached, so a
//! rotated Secret takes effect on the next reconcile.

use crate::error::ControllerError;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use power_driver::Credentials;

#[async_trait::async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, secret_name: &str) -> Result<Credentials, ControllerError>;
}

/// Reads `username` and `password` keys from Secrets in one namespace.
#[derive(Clone)]
pub struct SecretCredentialResolver {
    secrets: Api<Secret>,
}

impl SecretCredentialResolver {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            secrets: Api::namespaced(client, namespace),
        }
    }
}

pub(crate) fn credentials_from_secret(secret: &Secret, secret_name: &str) -> Result<Credentials, ControllerError> {
    let field = |key: &str| -> Result<String, ControllerError> {
        let bytes = secret
            .data
            .as_ref()
            .and_then(|d| d.get(key))
            .map(|b| b.0.clone())
            .or_else(|| {
                secret
                    .string_data
                    .as_ref()
                    .and_then(|d| d.get(key))
                    .map(|s| s.clone().into_bytes())
            })
            .ok_or_else(|| ControllerError::Credentials(format!("Secret {secret_name} has no {key} key")))?;
        String::from_utf8(bytes)
            .map_err(|e| ControllerError::Credentials(format!("Secret {secret_name} key {key}: {e}")))
    };
    Ok(Credentials::new(field("username")?, field("password")?))
}

#[async_trait::async_trait]
impl CredentialResolver for SecretCredentialResolver {
    async fn resolve(&self, secret_name: &str) -> Result<Credentials, ControllerError> {
        let secret = self
            .secrets
            .get_opt(secret_name)
            .await?
            .ok_or_else(|| ControllerError::Credentials(format!("Secret {secret_name} not found")))?;
        credentials_from_secret(&secret, secret_name)
    }
}
