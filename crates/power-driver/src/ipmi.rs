//! IPMI power driver
//!
//! Shells out to `ipmitool -I lanplus`. The password travels through the
//! `IPMI_PASSWORD` environment variable (`-E`), never the command line.

use crate::error::PowerError;
use crate::models::{BmcTarget, Credentials, PowerStatus};
use crate::power_trait::PowerControl;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct IpmiDriver {
    tool: String,
    timeout: Duration,
}

impl IpmiDriver {
    /// Create an IPMI driver
    ///
    /// # Arguments
    /// * `tool` - Path to the `ipmitool` binary
    /// * `timeout` - Upper bound for one `ipmitool` invocation
    pub fn new(tool: impl Into<String>, timeout: Duration) -> Self {
        Self {
            tool: tool.into(),
            timeout,
        }
    }

    /// Arguments for `chassis power <action>`, without the password.
    fn command_args(address: &str, username: &str, action: &str) -> Vec<String> {
        let (host, port) = split_host_port(address);
        let mut args = vec!["-I".to_string(), "lanplus".to_string(), "-H".to_string(), host.to_string()];
        if let Some(port) = port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        args.extend(
            ["-U", username, "-E", "chassis", "power", action]
                .iter()
                .map(|s| (*s).to_string()),
        );
        args
    }

    async fn chassis_power(
        &self,
        target: &BmcTarget,
        credentials: Option<&Credentials>,
        action: &str,
    ) -> Result<String, PowerError> {
        let creds = credentials
            .ok_or_else(|| PowerError::Unauthorized("no credentials configured for IPMI BMC".to_string()))?;
        let args = Self::command_args(&target.address, &creds.username, action);
        debug!(address = %target.address, action = %action, "ipmitool chassis power");

        let output = Command::new(&self.tool)
            .args(&args)
            .env("IPMI_PASSWORD", &creds.password)
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout, output)
            .await
            .map_err(|_| PowerError::Transient(format!("ipmitool timed out after {:?}", self.timeout)))??;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(classify_failure(stderr.trim()))
    }
}

/// Split `host:port`. Bare IPv6 addresses (several colons) are left alone.
fn split_host_port(address: &str) -> (&str, Option<&str>) {
    let address = address.trim();
    if address.matches(':').count() == 1 {
        if let Some((host, port)) = address.split_once(':') {
            if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) {
                return (host, Some(port));
            }
        }
    }
    (address, None)
}

fn classify_failure(stderr: &str) -> PowerError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("rakp") || lower.contains("unauthorized") || lower.contains("invalid user") || lower.contains("password") {
        PowerError::Unauthorized(stderr.to_string())
    } else if lower.contains("unable to establish") || lower.contains("no route") || lower.contains("timed out") {
        PowerError::Unreachable(stderr.to_string())
    } else {
        PowerError::Transient(stderr.to_string())
    }
}

fn parse_status(stdout: &str) -> Result<PowerStatus, PowerError> {
    let lower = stdout.trim().to_ascii_lowercase();
    match lower.strip_prefix("chassis power is ") {
        Some("on") => Ok(PowerStatus::On),
        Some("off") => Ok(PowerStatus::Off),
        _ => Err(PowerError::Protocol(format!("unexpected ipmitool output: {}", stdout.trim()))),
    }
}

#[async_trait::async_trait]
impl PowerControl for IpmiDriver {
    async fn power_on(&self, target: &BmcTarget, credentials: Option<&Credentials>) -> Result<(), PowerError> {
        self.chassis_power(target, credentials, "on").await.map(|_| ())
    }

    async fn power_off(&self, target: &BmcTarget, credentials: Option<&Credentials>) -> Result<(), PowerError> {
        self.chassis_power(target, credentials, "off").await.map(|_| ())
    }

    async fn query_power_state(
        &self,
        target: &BmcTarget,
        credentials: Option<&Credentials>,
    ) -> Result<PowerStatus, PowerError> {
        let stdout = self.chassis_power(target, credentials, "status").await?;
        parse_status(&stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureClass;
    use crate::models::Protocol;

    #[test]
    fn test_command_args_keep_password_out() {
        let args = IpmiDriver::command_args("10.0.0.21:6230", "admin", "status");
        assert_eq!(
            args,
            vec!["-I", "lanplus", "-H", "10.0.0.21", "-p", "6230", "-U", "admin", "-E", "chassis", "power", "status"]
        );

        let args = IpmiDriver::command_args("bmc-07", "root", "on");
        assert_eq!(args[3], "bmc-07");
        assert!(!args.contains(&"-p".to_string()));
    }

    #[test]
    fn test_split_host_port_leaves_ipv6() {
        assert_eq!(split_host_port("fd00::21"), ("fd00::21", None));
        assert_eq!(split_host_port("10.0.0.1:623"), ("10.0.0.1", Some("623")));
        assert_eq!(split_host_port("bmc:abc"), ("bmc:abc", None));
    }

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status("Chassis Power is on\n").unwrap(), PowerStatus::On);
        assert_eq!(parse_status("Chassis Power is off").unwrap(), PowerStatus::Off);
        assert!(matches!(parse_status("garbage"), Err(PowerError::Protocol(_))));
    }

    #[test]
    fn test_classify_failure() {
        let auth = classify_failure("Error: Unable to establish IPMI v2 / RMCP+ session\nRAKP 2 message indicates an error : unauthorized name");
        assert!(matches!(auth, PowerError::Unauthorized(_)));
        let gone = classify_failure("Error: Unable to establish IPMI v2 / RMCP+ session");
        assert!(matches!(gone, PowerError::Unreachable(_)));
        let busy = classify_failure("Set Chassis Power Control to Up/On failed: Node busy");
        assert!(matches!(busy, PowerError::Transient(_)));
    }

    #[tokio::test]
    async fn test_missing_tool_is_terminal() {
        let driver = IpmiDriver::new("/nonexistent/ipmitool", Duration::from_secs(5));
        let target = BmcTarget::new(Protocol::Ipmi, "10.0.0.21", "aa:bb:cc:dd:ee:21");
        let creds = Credentials::new("admin", "secret");
        let err = driver.query_power_state(&target, Some(&creds)).await.unwrap_err();
        assert_eq!(err.class(), FailureClass::Terminal, "got {err:?}");
    }

    #[tokio::test]
    async fn test_missing_credentials() {
        let driver = IpmiDriver::new("ipmitool", Duration::from_secs(5));
        let target = BmcTarget::new(Protocol::Ipmi, "10.0.0.21", "aa:bb:cc:dd:ee:21");
        let err = driver.power_on(&target, None).await.unwrap_err();
        assert!(matches!(err, PowerError::Unauthorized(_)));
    }
}
