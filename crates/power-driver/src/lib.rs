//! Bare-metal power control
//!
//! A uniform interface over the mechanisms used to switch machines on and
//! off through their management controller:
//!
//! - **Redfish**: HTTPS/JSON, `ComputerSystem.Reset` and `PowerState`
//! - **IPMI**: `ipmitool -I lanplus chassis power ...`
//! - **Wake-on-LAN**: UDP magic packet (power-on only)
//!
//! # Example
//!
//! ```no_run
//! use power_driver::{BmcTarget, Credentials, DriverConfig, DriverSet, PowerControl, Protocol};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let drivers = DriverSet::new(&DriverConfig::default())?;
//!
//! let target = BmcTarget::new(Protocol::Redfish, "10.0.0.11", "aa:bb:cc:dd:ee:01");
//! let credentials = Credentials::new("admin", "secret");
//!
//! let status = drivers.query_power_state(&target, Some(&credentials)).await?;
//! println!("power is {status}");
//! drivers.power_on(&target, Some(&credentials)).await?;
//! # Ok(())
//! # }
//! ```

pub mod driver;
pub mod error;
pub mod ipmi;
pub mod models;
pub mod redfish;
#[path = "trait.rs"]
pub mod power_trait;
pub mod wol;
#[cfg(feature = "test-util")]
pub mod mock;

pub use driver::{DriverConfig, DriverSet, PowerDriver};
pub use error::{FailureClass, PowerError};
pub use ipmi::IpmiDriver;
pub use models::*;
pub use power_trait::PowerControl;
pub use redfish::RedfishDriver;
pub use wol::WolDriver;
#[cfg(feature = "test-util")]
pub use mock::{MockPowerControl, PowerCall};
