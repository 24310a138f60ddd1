use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use signal_transport::Endpoint;

/// Ports picked for fresh rendezvous tickets stay inside the ephemeral
/// range so they never collide with registered services.
const PORT_RANGE: std::ops::RangeInclusive<u16> = 49152..=65535;

/// The out-of-band rendezvous payload a host hands to the joining peer:
/// where the host's signaling socket is listening. Carried as flat JSON so
/// it can travel over chat, QR, or the clipboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RendezvousTicket {
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Error)]
pub enum TicketError {
    #[error("invalid ticket: {0}")]
    Parse(String),
    #[error("no usable LAN address found")]
    NoAddress,
}

impl RendezvousTicket {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Ticket for this host: the first non-loopback IPv4 interface address
    /// and a random ephemeral port.
    pub fn for_local_host() -> Result<Self, TicketError> {
        let address = lan_address()?;
        Ok(Self::new(address, random_port()))
    }

    pub fn from_json(raw: &str) -> Result<Self, TicketError> {
        serde_json::from_str(raw).map_err(|err| TicketError::Parse(err.to_string()))
    }

    pub fn to_json(&self) -> String {
        serde_json::json!({ "address": self.address, "port": self.port }).to_string()
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.address.clone(), self.port)
    }
}

fn lan_address() -> Result<String, TicketError> {
    let interfaces =
        if_addrs::get_if_addrs().map_err(|err| TicketError::Parse(err.to_string()))?;
    interfaces
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .find_map(|iface| match iface.addr.ip() {
            std::net::IpAddr::V4(v4) => Some(v4.to_string()),
            std::net::IpAddr::V6(_) => None,
        })
        .ok_or(TicketError::NoAddress)
}

fn random_port() -> u16 {
    rand::thread_rng().gen_range(PORT_RANGE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let ticket = RendezvousTicket::new("192.168.1.20", 50505);
        let parsed = RendezvousTicket::from_json(&ticket.to_json()).expect("parse");
        assert_eq!(parsed, ticket);
    }

    #[test]
    fn accepts_the_wire_shape_directly() {
        let ticket =
            RendezvousTicket::from_json(r#"{"address":"10.0.0.7","port":51000}"#).expect("parse");
        assert_eq!(ticket.address, "10.0.0.7");
        assert_eq!(ticket.port, 51000);
        assert_eq!(ticket.endpoint().to_string(), "10.0.0.7:51000");
    }

    #[test]
    fn rejects_garbage() {
        assert!(RendezvousTicket::from_json("not json").is_err());
        assert!(RendezvousTicket::from_json(r#"{"address":"x"}"#).is_err());
    }

    #[test]
    fn random_ports_stay_in_the_ephemeral_range() {
        for _ in 0..100 {
            assert!(PORT_RANGE.contains(&random_port()));
        }
    }
}
