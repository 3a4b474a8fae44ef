//! Wake-on-LAN power driver
//!
//! Power-on only. A magic packet is six `0xFF` bytes followed by the target
//! MAC repeated sixteen times. There is no management controller to ask, so
//! the power state is guessed with a TCP connect probe against the host.

use crate::error::PowerError;
use crate::models::{BmcTarget, Credentials, PowerStatus};
use crate::power_trait::PowerControl;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

pub const MAGIC_PACKET_LEN: usize = 6 + 16 * 6;

#[derive(Debug, Clone)]
pub struct WolDriver {
    broadcast: SocketAddr,
    probe_port: u16,
    probe_timeout: Duration,
}

impl WolDriver {
    /// Create a Wake-on-LAN driver
    ///
    /// # Arguments
    /// * `broadcast` - Destination of magic packets, usually `255.255.255.255:9`
    /// * `probe_port` - TCP port probed when the address carries none
    /// * `probe_timeout` - Connect timeout of the liveness probe
    pub fn new(broadcast: SocketAddr, probe_port: u16, probe_timeout: Duration) -> Self {
        Self {
            broadcast,
            probe_port,
            probe_timeout,
        }
    }

    fn probe_addr(&self, address: &str) -> String {
        let address = address.trim();
        if address.parse::<SocketAddr>().is_ok() {
            return address.to_string();
        }
        if address.contains(':') && !address.starts_with('[') {
            if address.matches(':').count() == 1 {
                return address.to_string();
            }
            return format!("[{address}]:{}", self.probe_port);
        }
        format!("{address}:{}", self.probe_port)
    }
}

/// Parse `aa:bb:cc:dd:ee:ff` (or `-` separated) into six octets.
pub fn parse_mac(mac: &str) -> Result<[u8; 6], PowerError> {
    let invalid = || PowerError::Protocol(format!("invalid MAC address: {mac}"));
    let mut octets = [0u8; 6];
    let mut parts = mac.trim().split([':', '-']);
    for octet in &mut octets {
        let part = parts.next().ok_or_else(invalid)?;
        if part.len() != 2 {
            return Err(invalid());
        }
        *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
    }
    if parts.next().is_some() {
        return Err(invalid());
    }
    Ok(octets)
}

pub fn magic_packet(mac: &str) -> Result<[u8; MAGIC_PACKET_LEN], PowerError> {
    let octets = parse_mac(mac)?;
    let mut packet = [0xFFu8; MAGIC_PACKET_LEN];
    for chunk in packet[6..].chunks_exact_mut(6) {
        chunk.copy_from_slice(&octets);
    }
    Ok(packet)
}

#[async_trait::async_trait]
impl PowerControl for WolDriver {
    async fn power_on(&self, target: &BmcTarget, _credentials: Option<&Credentials>) -> Result<(), PowerError> {
        let packet = magic_packet(&target.mac)?;
        let bind_addr = if self.broadcast.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.set_broadcast(true)?;
        socket.send_to(&packet, self.broadcast).await?;
        debug!(mac = %target.mac, broadcast = %self.broadcast, "Sent Wake-on-LAN magic packet");
        Ok(())
    }

    async fn power_off(&self, _target: &BmcTarget, _credentials: Option<&Credentials>) -> Result<(), PowerError> {
        Err(PowerError::Unsupported("Wake-on-LAN cannot power a machine off".to_string()))
    }

    async fn query_power_state(
        &self,
        target: &BmcTarget,
        _credentials: Option<&Credentials>,
    ) -> Result<PowerStatus, PowerError> {
        let addr = self.probe_addr(&target.address);
        match tokio::time::timeout(self.probe_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(_)) => Ok(PowerStatus::On),
            // A refusal still means a live network stack answered.
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => Ok(PowerStatus::On),
            Ok(Err(e)) => {
                debug!(address = %addr, error = %e, "Wake-on-LAN probe failed");
                Ok(PowerStatus::Unknown)
            }
            Err(_) => Ok(PowerStatus::Unknown),
        }
    }
}
