//! Wintun adapter implementation for Windows.
//!
//! Wraps the Wintun driver's ring-based session API. Reads are
//! non-blocking by construction (`try_receive` on the receive ring), so
//! `set_non_blocking` is a no-op. Address and MTU configuration go
//! through `netsh`.
//!
//! # Safety Requirements
//!
//! - `wintun.dll` must be present in the executable directory or system PATH
//! - Adapter creation requires Administrator privileges
//! - The Wintun library is loaded dynamically at runtime
//!
//! # Platform
//!
//! This module is Windows-only and will not compile on other platforms.

#![cfg(target_os = "windows")]

use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use wintun::Session;

use super::{run_config_command, TunDevice};

/// Wintun tunnel type identifier.
const TUNNEL_TYPE: &str = "RoomNet";

/// Wintun adapter GUID (tunnel type identifier).
///
/// Consistent across installations so Windows can recognize and reuse
/// the adapter instead of accumulating stale ones.
const ADAPTER_GUID: &str = "9c2cb9d3-5a14-4f76-b1e8-0d3a6f24c7e1";

/// Wintun TUN device.
pub struct WintunTun {
    name: String,
    mtu: AtomicU16,
    session: Arc<Session>,
}

impl WintunTun {
    /// Create or reopen a Wintun adapter and start a session on it.
    ///
    /// # Errors
    ///
    /// Fails when `wintun.dll` cannot be loaded, the caller lacks
    /// Administrator privileges, or the driver rejects the session.
    pub fn open(name: &str, mtu: u16) -> io::Result<Self> {
        use wintun::Adapter;

        // SAFETY: wintun::load performs the dynamic library load; the
        // returned handle keeps the DLL alive for the session's lifetime.
        let library = unsafe {
            wintun::load().map_err(|e| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("failed to load wintun.dll: {e}"),
                )
            })?
        };

        let guid = ADAPTER_GUID
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid GUID: {e}")))?;

        let adapter = match Adapter::open(&library, name) {
            Ok(adapter) => adapter,
            Err(_) => Adapter::create(&library, name, TUNNEL_TYPE, Some(guid)).map_err(|e| {
                io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("failed to create Wintun adapter (Administrator required): {e}"),
                )
            })?,
        };

        let session = adapter.start_session(wintun::MAX_RING_CAPACITY).map_err(|e| {
            io::Error::other(format!("failed to start Wintun session: {e}"))
        })?;

        tracing::info!("opened Wintun adapter '{name}'");

        Ok(Self {
            name: name.to_string(),
            mtu: AtomicU16::new(mtu),
            session: Arc::new(session),
        })
    }
}

impl TunDevice for WintunTun {
    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> u16 {
        self.mtu.load(Ordering::Relaxed)
    }

    fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.session.try_receive() {
            Ok(Some(packet)) => {
                let bytes = packet.bytes();
                if bytes.len() > buf.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!(
                            "packet too large for buffer: {} bytes (buffer: {})",
                            bytes.len(),
                            buf.len()
                        ),
                    ));
                }
                buf[..bytes.len()].copy_from_slice(bytes);
                Ok(bytes.len())
            }
            Ok(None) => Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "no packet available",
            )),
            Err(wintun::Error::ShuttingDown) => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "Wintun session is shutting down",
            )),
            Err(e) => Err(io::Error::other(format!("Wintun receive failed: {e}"))),
        }
    }

    fn write_packet(&self, buf: &[u8]) -> io::Result<usize> {
        let mut packet = self
            .session
            .allocate_send_packet(buf.len() as u16)
            .map_err(|e| {
                io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    format!("failed to allocate send packet: {e}"),
                )
            })?;

        packet.bytes_mut().copy_from_slice(buf);
        self.session.send_packet(packet);
        Ok(buf.len())
    }

    fn set_ip(&self, address: Ipv4Addr, netmask: Ipv4Addr) -> io::Result<()> {
        let name_arg = format!("name={}", self.name);
        run_config_command(
            "netsh",
            &[
                "interface",
                "ip",
                "set",
                "address",
                &name_arg,
                "static",
                &address.to_string(),
                &netmask.to_string(),
            ],
        )?;

        tracing::info!("assigned {address} {netmask} to '{}'", self.name);
        Ok(())
    }

    fn set_mtu(&self, mtu: u16) -> io::Result<()> {
        run_config_command(
            "netsh",
            &[
                "interface",
                "ipv4",
                "set",
                "subinterface",
                &self.name,
                &format!("mtu={mtu}"),
                "store=persistent",
            ],
        )?;
        self.mtu.store(mtu, Ordering::Relaxed);
        Ok(())
    }

    fn set_up(&self, _up: bool) -> io::Result<()> {
        // The adapter is up for as long as the session exists.
        Ok(())
    }

    fn set_non_blocking(&self, _on: bool) -> io::Result<()> {
        // try_receive never blocks; the ring API has no blocking mode to
        // leave.
        Ok(())
    }
}

impl std::fmt::Debug for WintunTun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WintunTun")
            .field("name", &self.name)
            .field("mtu", &self.mtu())
            .finish()
    }
}
