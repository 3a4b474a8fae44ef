//! PowerControl trait for mocking
//!
//! The concrete drivers implement this trait; tests use `MockPowerControl`
//! from the `test-util` feature.

use crate::error::PowerError;
use crate::models::{BmcTarget, Credentials, PowerStatus};

/// Power operations against a single machine.
///
/// `credentials` is `None` for mechanisms that do not authenticate
/// (Wake-on-LAN). All methods must be `Send` to work with Tokio's
/// work-stealing runtime.
#[async_trait::async_trait]
pub trait PowerControl: Send + Sync {
    async fn power_on(&self, target: &BmcTarget, credentials: Option<&Credentials>) -> Result<(), PowerError>;

    async fn power_off(&self, target: &BmcTarget, credentials: Option<&Credentials>) -> Result<(), PowerError>;

    async fn query_power_state(
        &self,
        target: &BmcTarget,
        credentials: Option<&Credentials>,
    ) -> Result<PowerStatus, PowerError>;
}
