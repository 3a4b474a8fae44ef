//! Mock PowerControl for unit testing
//!
//! Keeps a power state per management address, records every call, and
//! can be told to fail specific operations.

use crate::error::PowerError;
use crate::models::{BmcTarget, Credentials, Operation, PowerStatus};
use crate::power_trait::PowerControl;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

/// One recorded driver call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerCall {
    pub operation: Operation,
    pub address: String,
    pub username: Option<String>,
}

#[derive(Debug, Default)]
struct MockState {
    power: HashMap<String, PowerStatus>,
    queued_failures: HashMap<(String, Operation), VecDeque<PowerError>>,
    unreachable: HashSet<String>,
    calls: Vec<PowerCall>,
}

/// Mock power driver
///
/// Addresses start powered off. A successful `power_on`/`power_off` flips
/// the recorded state, so `query_power_state` follows the commands.
#[derive(Debug, Clone, Default)]
pub struct MockPowerControl {
    state: Arc<Mutex<MockState>>,
}

impl MockPowerControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Set the power state reported for an address
    pub fn set_power(&self, address: &str, status: PowerStatus) {
        self.lock().power.insert(address.to_string(), status);
    }

    pub fn power(&self, address: &str) -> PowerStatus {
        self.lock().power.get(address).copied().unwrap_or(PowerStatus::Off)
    }

    /// Fail the next `operation` against `address` with `error`
    ///
    /// Failures queue up; each call consumes one.
    pub fn fail_next(&self, address: &str, operation: Operation, error: PowerError) {
        self.lock()
            .queued_failures
            .entry((address.to_string(), operation))
            .or_default()
            .push_back(error);
    }

    /// Make every call against `address` fail as unreachable until cleared
    pub fn set_unreachable(&self, address: &str, unreachable: bool) {
        let mut state = self.lock();
        if unreachable {
            state.unreachable.insert(address.to_string());
        } else {
            state.unreachable.remove(address);
        }
    }

    pub fn calls(&self) -> Vec<PowerCall> {
        self.lock().calls.clone()
    }

    /// Number of recorded calls of one kind
    pub fn count(&self, operation: Operation) -> usize {
        self.lock().calls.iter().filter(|c| c.operation == operation).count()
    }

    /// Number of recorded calls of one kind against one address
    pub fn count_for(&self, address: &str, operation: Operation) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation && c.address == address)
            .count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    fn record(&self, target: &BmcTarget, credentials: Option<&Credentials>, operation: Operation) -> Result<(), PowerError> {
        let mut state = self.lock();
        state.calls.push(PowerCall {
            operation,
            address: target.address.clone(),
            username: credentials.map(|c| c.username.clone()),
        });
        if state.unreachable.contains(&target.address) {
            return Err(PowerError::Unreachable(format!("{} is not answering", target.address)));
        }
        if let Some(error) = state
            .queued_failures
            .get_mut(&(target.address.clone(), operation))
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl PowerControl for MockPowerControl {
    async fn power_on(&self, target: &BmcTarget, credentials: Option<&Credentials>) -> Result<(), PowerError> {
        self.record(target, credentials, Operation::PowerOn)?;
        self.set_power(&target.address, PowerStatus::On);
        Ok(())
    }

    async fn power_off(&self, target: &BmcTarget, credentials: Option<&Credentials>) -> Result<(), PowerError> {
        self.record(target, credentials, Operation::PowerOff)?;
        self.set_power(&target.address, PowerStatus::Off);
        Ok(())
    }

    async fn query_power_state(
        &self,
        target: &BmcTarget,
        credentials: Option<&Credentials>,
    ) -> Result<PowerStatus, PowerError> {
        self.record(target, credentials, Operation::QueryPowerState)?;
        Ok(self.power(&target.address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Protocol;

    #[tokio::test]
    async fn test_mock_tracks_power_and_failures() {
        let mock = MockPowerControl::new();
        let target = BmcTarget::new(Protocol::Ipmi, "10.0.0.1", "aa:bb:cc:dd:ee:01");

        assert_eq!(mock.query_power_state(&target, None).await.unwrap(), PowerStatus::Off);

        mock.fail_next("10.0.0.1", Operation::PowerOn, PowerError::Transient("busy".into()));
        assert!(mock.power_on(&target, None).await.is_err());
        mock.power_on(&target, None).await.unwrap();
        assert_eq!(mock.power("10.0.0.1"), PowerStatus::On);
        assert_eq!(mock.count(Operation::PowerOn), 2);

        mock.set_unreachable("10.0.0.1", true);
        assert!(matches!(
            mock.query_power_state(&target, None).await,
            Err(PowerError::Unreachable(_))
        ));
    }
}
