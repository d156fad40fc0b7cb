//! Network interface discovery and socket binding
//!
//! - Linux: binds with SO_BINDTODEVICE via socket2::bind_device()
//! - macOS: binds with IP_BOUND_IF via socket2::bind_device_by_index_v4()

use anyhow::{Result, anyhow};
use pnet::datalink::{self, NetworkInterface};
use socket2::Socket;
use std::net::{IpAddr, Ipv4Addr};

/// Validated interface information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    /// Interface name (e.g., "eth0", "wlan0")
    pub name: String,
    /// Interface index (used for macOS binding)
    pub index: u32,
    /// First IPv4 address on the interface
    pub ipv4: Ipv4Addr,
}

fn first_ipv4(iface: &NetworkInterface, allow_loopback: bool) -> Option<Ipv4Addr> {
    iface.ips.iter().find_map(|addr| match addr.ip() {
        IpAddr::V4(v4) if allow_loopback || !v4.is_loopback() => Some(v4),
        _ => None,
    })
}

/// Pick the first interface that is up, not loopback, and has an IPv4 address
pub fn find_default_interface() -> Result<InterfaceInfo> {
    select_default(&datalink::interfaces())
        .ok_or_else(|| anyhow!("No non-loopback interface with an IPv4 address found"))
}

fn select_default(interfaces: &[NetworkInterface]) -> Option<InterfaceInfo> {
    interfaces
        .iter()
        .filter(|iface| iface.is_up() && !iface.is_loopback())
        .find_map(|iface| {
            first_ipv4(iface, false).map(|ipv4| InterfaceInfo {
                name: iface.name.clone(),
                index: iface.index,
                ipv4,
            })
        })
}

/// Look up a named interface and require it to carry an IPv4 address
pub fn validate_interface(name: &str) -> Result<InterfaceInfo> {
    let interfaces = datalink::interfaces();

    if let Some(iface) = interfaces.iter().find(|i| i.name == name) {
        let ipv4 = first_ipv4(iface, iface.is_loopback())
            .ok_or_else(|| anyhow!("Interface '{}' has no IPv4 address", name))?;
        return Ok(InterfaceInfo {
            name: name.to_string(),
            index: iface.index,
            ipv4,
        });
    }

    let available: Vec<_> = interfaces
        .iter()
        .filter(|i| !i.ips.is_empty())
        .map(|i| i.name.clone())
        .collect();

    Err(anyhow!(
        "Interface '{}' not found. Available interfaces: {}",
        name,
        if available.is_empty() {
            "(none with IP addresses)".to_string()
        } else {
            available.join(", ")
        }
    ))
}

/// Bind a socket to a specific network interface
pub fn bind_socket_to_interface(socket: &Socket, info: &InterfaceInfo) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        socket.bind_device(Some(info.name.as_bytes())).map_err(|e| {
            anyhow!(
                "Failed to bind socket to interface '{}': {}. \
                 This requires CAP_NET_RAW capability or root privileges.",
                info.name,
                e
            )
        })
    }

    #[cfg(target_os = "macos")]
    {
        use std::num::NonZeroU32;
        socket
            .bind_device_by_index_v4(NonZeroU32::new(info.index))
            .map_err(|e| {
                anyhow!(
                    "Failed to bind socket to interface '{}' (index {}): {}",
                    info.name,
                    info.index,
                    e
                )
            })
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = (socket, info);
        Err(anyhow!(
            "Interface binding is only available on Linux and macOS"
        ))
    }
}
