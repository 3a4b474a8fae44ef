//! Power driver data types

use std::fmt;

/// Power-control mechanism of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Redfish,
    Ipmi,
    Wol,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Redfish => "redfish",
            Protocol::Ipmi => "ipmi",
            Protocol::Wol => "wol",
        }
    }

    /// Whether calls over this protocol need BMC credentials.
    pub fn needs_credentials(self) -> bool {
        !matches!(self, Protocol::Wol)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Power state as reported by the management controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerStatus {
    On,
    Off,
    Unknown,
}

impl fmt::Display for PowerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PowerStatus::On => "on",
            PowerStatus::Off => "off",
            PowerStatus::Unknown => "unknown",
        })
    }
}

/// The three driver operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    PowerOn,
    PowerOff,
    QueryPowerState,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::PowerOn => "power_on",
            Operation::PowerOff => "power_off",
            Operation::QueryPowerState => "query_power_state",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A machine as seen by a power driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BmcTarget {
    pub protocol: Protocol,
    /// Management address: IP, host, `host:port`, or a Redfish base URL
    pub address: String,
    /// Primary NIC MAC, used by Wake-on-LAN
    pub mac: String,
}

impl BmcTarget {
    pub fn new(protocol: Protocol, address: impl Into<String>, mac: impl Into<String>) -> Self {
        Self {
            protocol,
            address: address.into(),
            mac: mac.into(),
        }
    }
}

/// BMC login. The password never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}
