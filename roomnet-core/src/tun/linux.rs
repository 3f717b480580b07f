//! Linux TUN device implementation.
//!
//! Allocates a device through `/dev/net/tun` with `IFF_TUN | IFF_NO_PI`,
//! so reads and writes carry bare IP datagrams with no packet-info
//! header. Interface configuration goes through the `ip` command.
//!
//! # Safety Requirements
//!
//! - Root privileges or `CAP_NET_ADMIN` are required for device creation
//! - The TUN kernel module must be loaded (`modprobe tun`)
//!
//! # Platform
//!
//! This module is Linux-only and will not compile on other platforms.

#![cfg(target_os = "linux")]

use std::fs::{File, OpenOptions};
use std::io;
use std::net::Ipv4Addr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU16, Ordering};

use super::{netmask_to_prefix, run_config_command, TunDevice};

const TUN_DEVICE_PATH: &str = "/dev/net/tun";

/// IFF_TUN flag - TUN device (no Ethernet headers).
const IFF_TUN: libc::c_short = 0x0001;

/// IFF_NO_PI flag - Do not provide packet information.
const IFF_NO_PI: libc::c_short = 0x1000;

/// TUNSETIFF ioctl number.
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

/// Interface request structure for ioctl calls.
#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _padding: [u8; 22],
}

impl IfReq {
    fn new(name: &str) -> Self {
        let mut ifr = Self {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: 0,
            _padding: [0; 22],
        };

        // Copy name into ifr_name (truncate if too long)
        let name_bytes = name.as_bytes();
        let copy_len = name_bytes.len().min(libc::IFNAMSIZ - 1);
        for (i, &byte) in name_bytes[..copy_len].iter().enumerate() {
            ifr.ifr_name[i] = byte as libc::c_char;
        }

        ifr
    }

    fn with_flags(mut self, flags: libc::c_short) -> Self {
        self.ifr_flags = flags;
        self
    }

    fn name(&self) -> String {
        let bytes: Vec<u8> = self
            .ifr_name
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Linux TUN device.
///
/// The file descriptor is owned for the lifetime of the value; dropping
/// it closes the device and, for non-persistent devices, removes the
/// interface.
pub struct LinuxTun {
    file: File,
    name: String,
    mtu: AtomicU16,
}

impl LinuxTun {
    /// Allocate a TUN interface.
    ///
    /// `name` may be a concrete name or a template ending in `%d`, which
    /// the kernel fills with the first free index. The name the kernel
    /// actually assigned is readable via [`TunDevice::name`].
    ///
    /// # Errors
    ///
    /// Fails when `/dev/net/tun` cannot be opened (missing module or
    /// permissions) or the `TUNSETIFF` ioctl is rejected.
    pub fn open(name: &str, mtu: u16) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(TUN_DEVICE_PATH)?;

        let mut ifr = IfReq::new(name).with_flags(IFF_TUN | IFF_NO_PI);

        // SAFETY: fd is a valid open descriptor and ifr is a properly
        // initialized ifreq that outlives the call.
        let result = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &mut ifr) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }

        let actual_name = ifr.name();
        tracing::info!("opened TUN device '{actual_name}'");

        Ok(Self {
            file,
            name: actual_name,
            mtu: AtomicU16::new(mtu),
        })
    }
}

impl TunDevice for LinuxTun {
    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> u16 {
        self.mtu.load(Ordering::Relaxed)
    }

    fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: buf is valid for writes of buf.len() bytes and the fd
        // is open for the lifetime of self.
        let n = unsafe {
            libc::read(
                self.file.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn write_packet(&self, buf: &[u8]) -> io::Result<usize> {
        // SAFETY: buf is valid for reads of buf.len() bytes.
        let n = unsafe {
            libc::write(
                self.file.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn set_ip(&self, address: Ipv4Addr, netmask: Ipv4Addr) -> io::Result<()> {
        let cidr = format!("{}/{}", address, netmask_to_prefix(netmask));

        if run_config_command("ip", &["addr", "add", &cidr, "dev", &self.name]).is_err() {
            // The address may already be assigned from a previous run;
            // flush and retry once.
            run_config_command("ip", &["addr", "flush", "dev", &self.name])?;
            run_config_command("ip", &["addr", "add", &cidr, "dev", &self.name])?;
        }

        tracing::info!("assigned {cidr} to '{}'", self.name);
        Ok(())
    }

    fn set_mtu(&self, mtu: u16) -> io::Result<()> {
        run_config_command(
            "ip",
            &["link", "set", "dev", &self.name, "mtu", &mtu.to_string()],
        )?;
        self.mtu.store(mtu, Ordering::Relaxed);
        Ok(())
    }

    fn set_up(&self, up: bool) -> io::Result<()> {
        let state = if up { "up" } else { "down" };
        run_config_command("ip", &["link", "set", "dev", &self.name, state])
    }

    fn set_non_blocking(&self, on: bool) -> io::Result<()> {
        let fd = self.file.as_raw_fd();

        // SAFETY: fcntl on an owned, open descriptor.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }

        let flags = if on {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };

        // SAFETY: as above.
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }
}

impl std::fmt::Debug for LinuxTun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinuxTun")
            .field("name", &self.name)
            .field("mtu", &self.mtu())
            .finish()
    }
}
