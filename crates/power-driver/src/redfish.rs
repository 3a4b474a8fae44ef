//! Redfish power driver
//!
//! Speaks just enough Redfish to switch a machine: discover the first
//! `ComputerSystem` under `/redfish/v1/Systems`, read its `PowerState`, and
//! post `ComputerSystem.Reset` with `On` or `ForceOff`.

use crate::error::PowerError;
use crate::models::{BmcTarget, Credentials, PowerStatus};
use crate::power_trait::PowerControl;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct SystemCollection {
    #[serde(rename = "Members", default)]
    members: Vec<ODataLink>,
}

#[derive(Debug, Deserialize)]
struct ODataLink {
    #[serde(rename = "@odata.id")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct ComputerSystem {
    #[serde(rename = "PowerState", default)]
    power_state: Option<String>,
}

/// Redfish client shared by all machines using the `redfish` interface.
#[derive(Debug, Clone)]
pub struct RedfishDriver {
    client: Client,
}

impl RedfishDriver {
    /// Create a Redfish driver
    ///
    /// # Arguments
    /// * `timeout` - Per-request timeout
    /// * `insecure_tls` - Accept self-signed BMC certificates
    pub fn new(timeout: Duration, insecure_tls: bool) -> Result<Self, PowerError> {
        let client = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(insecure_tls)
            .build()?;
        Ok(Self { client })
    }

    /// Base URL of a BMC. Bare hosts are reached over HTTPS.
    fn base_url(address: &str) -> String {
        let trimmed = address.trim().trim_end_matches('/');
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            trimmed.to_string()
        } else {
            format!("https://{trimmed}")
        }
    }

    fn require_credentials(credentials: Option<&Credentials>) -> Result<&Credentials, PowerError> {
        credentials.ok_or_else(|| PowerError::Unauthorized("no credentials configured for Redfish BMC".to_string()))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str, creds: &Credentials) -> Result<T, PowerError> {
        debug!(url = %url, "Redfish GET");
        let response = self
            .client
            .get(url)
            .basic_auth(&creds.username, Some(&creds.password))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        check_status(status, &body)?;

        serde_json::from_str(&body)
            .map_err(|e| PowerError::Protocol(format!("unexpected Redfish payload from {url}: {e}")))
    }

    /// Path of the first ComputerSystem, e.g. `/redfish/v1/Systems/1`.
    async fn system_path(&self, base: &str, creds: &Credentials) -> Result<String, PowerError> {
        let collection: SystemCollection = self.get_json(&format!("{base}/redfish/v1/Systems"), creds).await?;
        collection
            .members
            .into_iter()
            .next()
            .map(|m| m.id)
            .ok_or_else(|| PowerError::Protocol("Redfish service lists no ComputerSystem".to_string()))
    }

    async fn reset(&self, target: &BmcTarget, credentials: Option<&Credentials>, reset_type: &str) -> Result<(), PowerError> {
        let creds = Self::require_credentials(credentials)?;
        let base = Self::base_url(&target.address);
        let system = self.system_path(&base, creds).await?;
        let url = format!("{base}{system}/Actions/ComputerSystem.Reset");

        debug!(url = %url, reset_type = %reset_type, "Redfish reset");
        let response = self
            .client
            .post(&url)
            .basic_auth(&creds.username, Some(&creds.password))
            .json(&serde_json::json!({ "ResetType": reset_type }))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        check_status(status, &body)
    }
}

fn transport_error(e: reqwest::Error) -> PowerError {
    if e.is_connect() {
        PowerError::Unreachable(e.to_string())
    } else if e.is_timeout() {
        PowerError::Transient(format!("request timed out: {e}"))
    } else {
        PowerError::Http(e)
    }
}

fn check_status(status: StatusCode, body: &str) -> Result<(), PowerError> {
    if status.is_success() {
        return Ok(());
    }
    let detail = format!("{status} - {body}");
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(PowerError::Unauthorized(detail)),
        StatusCode::CONFLICT | StatusCode::TOO_MANY_REQUESTS => Err(PowerError::Transient(detail)),
        s if s.is_server_error() => Err(PowerError::Transient(detail)),
        _ => Err(PowerError::Protocol(detail)),
    }
}

fn parse_power_state(raw: Option<&str>) -> PowerStatus {
    match raw {
        Some("On" | "PoweringOn") => PowerStatus::On,
        Some("Off" | "PoweringOff") => PowerStatus::Off,
        _ => PowerStatus::Unknown,
    }
}

#[async_trait::async_trait]
impl PowerControl for RedfishDriver {
    async fn power_on(&self, target: &BmcTarget, credentials: Option<&Credentials>) -> Result<(), PowerError> {
        self.reset(target, credentials, "On").await
    }

    async fn power_off(&self, target: &BmcTarget, credentials: Option<&Credentials>) -> Result<(), PowerError> {
        self.reset(target, credentials, "ForceOff").await
    }

    async fn query_power_state(
        &self,
        target: &BmcTarget,
        credentials: Option<&Credentials>,
    ) -> Result<PowerStatus, PowerError> {
        let creds = Self::require_credentials(credentials)?;
        let base = Self::base_url(&target.address);
        let system = self.system_path(&base, creds).await?;
        let system: ComputerSystem = self.get_json(&format!("{base}{system}"), creds).await?;
        Ok(parse_power_state(system.power_state.as_deref()))
    }
}
