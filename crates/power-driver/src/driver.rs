//! Driver selection
//!
//! `PowerDriver` is the tagged union of the concrete mechanisms;
//! `DriverSet` holds one of each and routes every call by the target's
//! protocol.

use crate::error::PowerError;
use crate::ipmi::IpmiDriver;
use crate::models::{BmcTarget, Credentials, PowerStatus, Protocol};
use crate::power_trait::PowerControl;
use crate::redfish::RedfishDriver;
use crate::wol::WolDriver;
use std::net::SocketAddr;
use std::time::Duration;

/// Settings shared by all drivers.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub request_timeout: Duration,
    pub redfish_insecure_tls: bool,
    pub ipmitool_path: String,
    pub wol_broadcast: SocketAddr,
    pub wol_probe_port: u16,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            redfish_insecure_tls: false,
            ipmitool_path: "ipmitool".to_string(),
            wol_broadcast: SocketAddr::from(([255, 255, 255, 255], 9)),
            wol_probe_port: 22,
        }
    }
}

#[derive(Debug, Clone)]
pub enum PowerDriver {
    Redfish(RedfishDriver),
    Ipmi(IpmiDriver),
    Wol(WolDriver),
}

impl PowerDriver {
    pub fn protocol(&self) -> Protocol {
        match self {
            PowerDriver::Redfish(_) => Protocol::Redfish,
            PowerDriver::Ipmi(_) => Protocol::Ipmi,
            PowerDriver::Wol(_) => Protocol::Wol,
        }
    }

    fn inner(&self) -> &dyn PowerControl {
        match self {
            PowerDriver::Redfish(d) => d,
            PowerDriver::Ipmi(d) => d,
            PowerDriver::Wol(d) => d,
        }
    }
}

#[async_trait::async_trait]
impl PowerControl for PowerDriver {
    async fn power_on(&self, target: &BmcTarget, credentials: Option<&Credentials>) -> Result<(), PowerError> {
        self.inner().power_on(target, credentials).await
    }

    async fn power_off(&self, target: &BmcTarget, credentials: Option<&Credentials>) -> Result<(), PowerError> {
        self.inner().power_off(target, credentials).await
    }

    async fn query_power_state(
        &self,
        target: &BmcTarget,
        credentials: Option<&Credentials>,
    ) -> Result<PowerStatus, PowerError> {
        self.inner().query_power_state(target, credentials).await
    }
}

/// One driver per protocol.
#[derive(Debug, Clone)]
pub struct DriverSet {
    drivers: Vec<PowerDriver>,
}

impl DriverSet {
    pub fn new(config: &DriverConfig) -> Result<Self, PowerError> {
        Ok(Self::from_drivers(vec![
            PowerDriver::Redfish(RedfishDriver::new(config.request_timeout, config.redfish_insecure_tls)?),
            PowerDriver::Ipmi(IpmiDriver::new(config.ipmitool_path.clone(), config.request_timeout)),
            PowerDriver::Wol(WolDriver::new(config.wol_broadcast, config.wol_probe_port, Duration::from_secs(3))),
        ]))
    }

    pub fn from_drivers(drivers: Vec<PowerDriver>) -> Self {
        Self { drivers }
    }

    fn driver_for(&self, protocol: Protocol) -> Result<&PowerDriver, PowerError> {
        self.drivers
            .iter()
            .find(|d| d.protocol() == protocol)
            .ok_or_else(|| PowerError::Unsupported(format!("no {protocol} driver configured")))
    }
}

#[async_trait::async_trait]
impl PowerControl for DriverSet {
    async fn power_on(&self, target: &BmcTarget, credentials: Option<&Credentials>) -> Result<(), PowerError> {
        self.driver_for(target.protocol)?.power_on(target, credentials).await
    }

    async fn power_off(&self, target: &BmcTarget, credentials: Option<&Credentials>) -> Result<(), PowerError> {
        self.driver_for(target.protocol)?.power_off(target, credentials).await
    }

    async fn query_power_state(
        &self,
        target: &BmcTarget,
        credentials: Option<&Credentials>,
    ) -> Result<PowerStatus, PowerError> {
        self.driver_for(target.protocol)?
            .query_power_state(target, credentials)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_routes_by_protocol() {
        let set = DriverSet::from_drivers(vec![PowerDriver::Wol(WolDriver::new(
            SocketAddr::from(([127, 0, 0, 1], 9)),
            22,
            Duration::from_millis(200),
        ))]);

        let wol = BmcTarget::new(Protocol::Wol, "127.0.0.1", "aa:bb:cc:dd:ee:01");
        let err = set.power_off(&wol, None).await.unwrap_err();
        assert!(matches!(err, PowerError::Unsupported(ref m) if m.contains("Wake-on-LAN")), "got {err:?}");

        let ipmi = BmcTarget::new(Protocol::Ipmi, "10.0.0.21", "aa:bb:cc:dd:ee:21");
        let err = set.power_on(&ipmi, None).await.unwrap_err();
        assert!(matches!(err, PowerError::Unsupported(ref m) if m.contains("ipmi")), "got {err:?}");
    }

    #[test]
    fn test_default_set_has_every_protocol() {
        let set = DriverSet::new(&DriverConfig::default()).unwrap();
        for protocol in [Protocol::Redfish, Protocol::Ipmi, Protocol::Wol] {
            assert_eq!(set.driver_for(protocol).unwrap().protocol(), protocol);
        }
    }
}
