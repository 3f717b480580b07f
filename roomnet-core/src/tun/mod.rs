//! Virtual Layer-3 adapter (TUN) backends.
//!
//! A TUN device is a kernel-provided virtual NIC exposing raw IP
//! datagrams to userspace; the bridge reads outbound packets from it and
//! injects inbound packets into it. This module provides a uniform
//! capability interface over three platform backends:
//!
//! - Linux: `/dev/net/tun` with `IFF_TUN | IFF_NO_PI` framing
//! - macOS: `utun` kernel control socket (4-byte AF prefix handled here)
//! - Windows: Wintun driver sessions
//!
//! Backend selection is done at compile time by [`create_tun`].
//!
//! # Safety
//!
//! The Unix backends use FFI and `unsafe` code, which is isolated to the
//! platform submodules with clear safety invariants.

use std::io;
use std::net::Ipv4Addr;

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "macos")]
pub mod macos;

#[cfg(target_os = "windows")]
pub mod wintun;

#[cfg(target_os = "linux")]
pub use linux::LinuxTun;

#[cfg(target_os = "macos")]
pub use macos::MacosTun;

#[cfg(target_os = "windows")]
pub use wintun::WintunTun;

/// Capability interface for TUN device implementations.
///
/// Devices are opened by their constructors and closed on drop. The
/// access discipline is exactly one reader and exactly one writer at a
/// time; implementations are not required to be thread-safe beyond that.
pub trait TunDevice: Send + Sync {
    /// The concrete interface name the platform assigned.
    fn name(&self) -> &str;

    /// The configured MTU.
    fn mtu(&self) -> u16;

    /// Read one IP datagram into `buf`.
    ///
    /// Returns the datagram length, with any platform framing already
    /// stripped. In non-blocking mode an empty queue surfaces as
    /// `io::ErrorKind::WouldBlock`.
    fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one full IP datagram.
    ///
    /// Returns the number of payload bytes accepted. A full kernel queue
    /// surfaces as `io::ErrorKind::WouldBlock`.
    fn write_packet(&self, buf: &[u8]) -> io::Result<usize>;

    /// Assign the interface address and netmask.
    fn set_ip(&self, address: Ipv4Addr, netmask: Ipv4Addr) -> io::Result<()>;

    /// Set the interface MTU.
    fn set_mtu(&self, mtu: u16) -> io::Result<()>;

    /// Bring the link up or down.
    fn set_up(&self, up: bool) -> io::Result<()>;

    /// Switch the device between blocking and non-blocking reads. The
    /// bridge requires non-blocking mode before starting its read loop.
    fn set_non_blocking(&self, on: bool) -> io::Result<()>;
}

/// The default device name for this platform.
///
/// Linux accepts a printf-style `%d` template the kernel fills in;
/// macOS appends the chosen unit to `utun`; Windows names the adapter
/// directly.
pub fn default_device_name() -> &'static str {
    #[cfg(target_os = "linux")]
    {
        "roomnet%d"
    }
    #[cfg(target_os = "macos")]
    {
        "utun"
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        "roomnet"
    }
}

/// Open the platform TUN backend.
///
/// An empty `name` selects [`default_device_name`]. Fails when the
/// kernel rejects the request, typically for lack of privileges.
pub fn create_tun(name: &str, mtu: u16) -> io::Result<Box<dyn TunDevice>> {
    let name = if name.is_empty() {
        default_device_name()
    } else {
        name
    };

    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(linux::LinuxTun::open(name, mtu)?))
    }

    #[cfg(target_os = "macos")]
    {
        Ok(Box::new(macos::MacosTun::open(name, mtu)?))
    }

    #[cfg(target_os = "windows")]
    {
        Ok(Box::new(wintun::WintunTun::open(name, mtu)?))
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        let _ = (name, mtu);
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "no TUN backend for this platform",
        ))
    }
}

/// Netmask to CIDR prefix length.
#[cfg(unix)]
pub(crate) fn netmask_to_prefix(netmask: Ipv4Addr) -> u8 {
    u32::from(netmask).count_ones() as u8
}

/// Run a platform network-configuration command, failing on a non-zero
/// exit status.
#[cfg(any(unix, windows))]
pub(crate) fn run_config_command(program: &str, args: &[&str]) -> io::Result<()> {
    use std::process::Command;

    tracing::debug!("running: {program} {}", args.join(" "));
    let output = Command::new(program).args(args).output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(io::Error::other(format!(
            "{program} {} failed ({}): {}",
            args.join(" "),
            output.status,
            stderr.trim()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_device_name() {
        assert!(!default_device_name().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_netmask_to_prefix() {
        assert_eq!(netmask_to_prefix(Ipv4Addr::new(255, 255, 255, 0)), 24);
        assert_eq!(netmask_to_prefix(Ipv4Addr::new(255, 255, 0, 0)), 16);
        assert_eq!(netmask_to_prefix(Ipv4Addr::new(255, 255, 255, 255)), 32);
        assert_eq!(netmask_to_prefix(Ipv4Addr::new(0, 0, 0, 0)), 0);
    }
}
