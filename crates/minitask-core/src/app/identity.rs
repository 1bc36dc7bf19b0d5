//! Process identity used as the lease `master_id`.

use std::net::{IpAddr, UdpSocket};

use ulid::Ulid;

/// Identity of this process within the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub ip: String,
}

impl Identity {
    /// Configured id if given, else the outbound IP, else a generated id.
    /// The id must stay stable for the process lifetime.
    pub fn resolve(configured: Option<&str>) -> Self {
        let ip = outbound_ip().map(|ip| ip.to_string()).unwrap_or_default();
        let id = match configured {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ if !ip.is_empty() => ip.clone(),
            _ => format!("minitask-{}", Ulid::new()),
        };
        Self { id, ip }
    }

    pub fn new(id: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ip: ip.into(),
        }
    }
}

/// Local address the OS would route external traffic from. `connect` on a UDP
/// socket only selects a route; nothing is sent.
fn outbound_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified() && !ip.is_loopback()).then_some(ip)
}
