//! Port mapping shared by the backends.
//!
//! - The VM backend forwards a freshly allocated host port to every declared
//!   container port (QEMU user networking `hostfwd`). Allocation failures are
//!   logged and the port is skipped.
//! - The container backend records the declared ports as a JSON annotation
//!   on the container, in the format nerdctl uses.

use crate::error::Result;
use crate::pod::ContainerPort;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::TcpListener;
use tracing::warn;

/// Maximum number of port mappings per instance.
pub const MAX_PORT_MAPPINGS: usize = 1024;

// =============================================================================
// Protocol
// =============================================================================

/// Network protocol for port forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// Parses a Kubernetes protocol name; anything but UDP is TCP.
    pub fn from_k8s(value: &str) -> Self {
        if value.eq_ignore_ascii_case("udp") {
            Self::Udp
        } else {
            Self::Tcp
        }
    }

    fn as_lower(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "TCP"),
            Self::Udp => write!(f, "UDP"),
        }
    }
}

// =============================================================================
// PortMapping
// =============================================================================

/// A single port mapping from host to guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortMapping {
    pub protocol: Protocol,
    /// Port on the host to listen on.
    pub host_port: u16,
    /// Port inside the guest to forward to.
    pub guest_port: u16,
}

impl PortMapping {
    /// Creates a TCP port mapping.
    #[must_use]
    pub const fn tcp(host_port: u16, guest_port: u16) -> Self {
        Self {
            protocol: Protocol::Tcp,
            host_port,
            guest_port,
        }
    }

    /// QEMU `hostfwd` rule: `tcp::8080-:80`.
    #[must_use]
    pub fn as_hostfwd(self) -> String {
        format!(
            "{}::{}-:{}",
            self.protocol.as_lower(),
            self.host_port,
            self.guest_port
        )
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}->{}", self.protocol, self.host_port, self.guest_port)
    }
}

/// Binds an ephemeral port on loopback and returns its number.
///
/// The port is released before returning, so another process may still
/// grab it before the hypervisor does.
pub fn allocate_host_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// NAT rules mapping a fresh host port to every declared container port.
///
/// Ports whose host side cannot be allocated are logged and skipped.
pub fn nat_rules(ports: &[ContainerPort]) -> Vec<PortMapping> {
    nat_rules_with(ports, allocate_host_port)
}

/// [`nat_rules`] with an explicit host port allocator.
pub fn nat_rules_with<F>(ports: &[ContainerPort], mut allocate: F) -> Vec<PortMapping>
where
    F: FnMut() -> Result<u16>,
{
    let mut rules = Vec::new();
    for port in ports.iter().take(MAX_PORT_MAPPINGS) {
        match allocate() {
            Ok(host_port) => rules.push(PortMapping {
                protocol: Protocol::from_k8s(&port.protocol),
                host_port,
                guest_port: port.container_port,
            }),
            Err(e) => {
                warn!(
                    container_port = port.container_port,
                    error = %e,
                    "could not allocate host port, skipping"
                );
            }
        }
    }
    rules
}

// =============================================================================
// Container Port Annotation
// =============================================================================

/// One entry of the `nerdctl/ports` annotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortAnnotation {
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: String,
    #[serde(rename = "HostIP")]
    pub host_ip: String,
}

/// JSON value of the ports annotation, `None` when no ports are declared.
pub fn ports_annotation(ports: &[ContainerPort]) -> Result<Option<String>> {
    if ports.is_empty() {
        return Ok(None);
    }

    let entries: Vec<PortAnnotation> = ports
        .iter()
        .take(MAX_PORT_MAPPINGS)
        .map(|p| PortAnnotation {
            host_port: p.host_port.unwrap_or(0),
            container_port: p.container_port,
            protocol: Protocol::from_k8s(&p.protocol).as_lower().to_string(),
            host_ip: String::new(),
        })
        .collect();

    Ok(Some(serde_json::to_string(&entries)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn port(container_port: u16, protocol: &str) -> ContainerPort {
        ContainerPort {
            name: None,
            container_port,
            protocol: protocol.to_string(),
            host_port: None,
        }
    }

    #[test]
    fn test_hostfwd_format() {
        assert_eq!(PortMapping::tcp(8080, 80).as_hostfwd(), "tcp::8080-:80");
    }

    #[test]
    fn test_allocation_failure_is_skipped() {
        let ports = [port(80, "TCP"), port(53, "UDP")];
        let mut calls = 0;
        let rules = nat_rules_with(&ports, || {
            calls += 1;
            if calls == 1 {
                Err(Error::Internal("no ports left".to_string()))
            } else {
                Ok(40000)
            }
        });
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].guest_port, 53);
        assert_eq!(rules[0].protocol, Protocol::Udp);
    }

    #[test]
    fn test_allocate_host_port() {
        assert!(allocate_host_port().unwrap() > 0);
    }

    #[test]
    fn test_ports_annotation() {
        assert_eq!(ports_annotation(&[]).unwrap(), None);
        let json = ports_annotation(&[port(80, "TCP")]).unwrap().unwrap();
        assert!(json.contains("\"ContainerPort\":80"));
        assert!(json.contains("\"Protocol\":\"tcp\""));
    }
}
