//! macOS utun device implementation.
//!
//! macOS exposes TUN functionality through the `utun` kernel control:
//! a `PF_SYSTEM` datagram socket connected to the control's id, with the
//! unit number selecting the interface. Every datagram on the socket is
//! prefixed with a 4-byte network-order address family word, which this
//! backend strips on read and prepends on write so callers only ever see
//! bare IP packets.
//!
//! Interface configuration goes through `ifconfig`. Because utun is a
//! point-to-point interface, `set_ip` also derives a peer address inside
//! the netmask.
//!
//! # Safety Requirements
//!
//! - Root privileges are required to create utun devices
//!
//! # Platform
//!
//! This module is macOS-only and will not compile on other platforms.

#![cfg(target_os = "macos")]

use std::io;
use std::mem;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicU16, Ordering};

use super::{netmask_to_prefix, run_config_command, TunDevice};

const UTUN_CONTROL_NAME: &str = "com.apple.net.utun_control";

/// Highest unit probed when the caller lets the kernel pick.
const MAX_UTUN_UNIT: u32 = 256;

/// macOS utun device.
pub struct MacosTun {
    fd: OwnedFd,
    name: String,
    mtu: AtomicU16,
}

impl MacosTun {
    /// Open a utun device.
    ///
    /// `name` is either the bare `utun` template, in which case units are
    /// scanned from 0 until one connects, or a concrete `utunN`, which is
    /// attempted exactly once.
    pub fn open(name: &str, mtu: u16) -> io::Result<Self> {
        let requested_unit = parse_unit(name);

        // SAFETY: plain socket(2) call; the fd is checked before wrapping.
        let raw = unsafe { libc::socket(libc::PF_SYSTEM, libc::SOCK_DGRAM, libc::SYSPROTO_CONTROL) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: raw is a valid fd we own exclusively.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // Resolve the utun control id.
        let mut info: libc::ctl_info = unsafe { mem::zeroed() };
        for (i, byte) in UTUN_CONTROL_NAME.bytes().enumerate() {
            info.ctl_name[i] = byte as libc::c_char;
        }
        // SAFETY: fd is open and info is a properly initialized ctl_info.
        if unsafe { libc::ioctl(fd.as_raw_fd(), libc::CTLIOCGINFO, &mut info) } < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut addr: libc::sockaddr_ctl = unsafe { mem::zeroed() };
        addr.sc_len = mem::size_of::<libc::sockaddr_ctl>() as libc::c_uchar;
        addr.sc_family = libc::AF_SYSTEM as libc::c_uchar;
        addr.ss_sysaddr = libc::AF_SYS_CONTROL as u16;
        addr.sc_id = info.ctl_id;

        // sc_unit is the utun number plus one; zero asks for nothing.
        let unit = match requested_unit {
            Some(unit) => {
                addr.sc_unit = unit + 1;
                connect_ctl(&fd, &addr)?;
                unit
            }
            None => {
                let mut connected = None;
                for unit in 0..MAX_UTUN_UNIT {
                    addr.sc_unit = unit + 1;
                    if connect_ctl(&fd, &addr).is_ok() {
                        connected = Some(unit);
                        break;
                    }
                }
                connected.ok_or_else(|| {
                    io::Error::other("no free utun unit")
                })?
            }
        };

        let name = format!("utun{unit}");
        tracing::info!("opened TUN device '{name}'");

        Ok(Self {
            fd,
            name,
            mtu: AtomicU16::new(mtu),
        })
    }
}

fn parse_unit(name: &str) -> Option<u32> {
    name.strip_prefix("utun")
        .filter(|rest| !rest.is_empty())
        .and_then(|rest| rest.parse().ok())
}

fn connect_ctl(fd: &OwnedFd, addr: &libc::sockaddr_ctl) -> io::Result<()> {
    // SAFETY: addr is a fully initialized sockaddr_ctl and the length
    // passed matches its size.
    let result = unsafe {
        libc::connect(
            fd.as_raw_fd(),
            addr as *const libc::sockaddr_ctl as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_ctl>() as libc::socklen_t,
        )
    };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl TunDevice for MacosTun {
    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> u16 {
        self.mtu.load(Ordering::Relaxed)
    }

    fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        // Scatter read: the 4-byte AF prefix lands in its own buffer so
        // the payload arrives in place without a second copy.
        let mut af = [0u8; 4];
        let mut iov = [
            libc::iovec {
                iov_base: af.as_mut_ptr() as *mut libc::c_void,
                iov_len: af.len(),
            },
            libc::iovec {
                iov_base: buf.as_mut_ptr() as *mut libc::c_void,
                iov_len: buf.len(),
            },
        ];

        // SAFETY: both iovecs point at live buffers of the stated sizes.
        let n = unsafe { libc::readv(self.fd.as_raw_fd(), iov.as_mut_ptr(), 2) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        if n <= 4 {
            return Ok(0);
        }
        Ok(n as usize - 4)
    }

    fn write_packet(&self, buf: &[u8]) -> io::Result<usize> {
        // The AF prefix is derived from the IP version nibble; anything
        // unrecognizable goes out as AF_INET, matching what the kernel
        // expects for odd but routable traffic.
        let family = match buf.first().map(|b| b >> 4) {
            Some(6) => libc::AF_INET6,
            _ => libc::AF_INET,
        };
        let af = (family as u32).to_be_bytes();

        let iov = [
            libc::iovec {
                iov_base: af.as_ptr() as *mut libc::c_void,
                iov_len: af.len(),
            },
            libc::iovec {
                iov_base: buf.as_ptr() as *mut libc::c_void,
                iov_len: buf.len(),
            },
        ];

        // SAFETY: both iovecs point at live buffers of the stated sizes.
        let n = unsafe { libc::writev(self.fd.as_raw_fd(), iov.as_ptr(), 2) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        if n <= 4 {
            return Ok(0);
        }
        Ok(n as usize - 4)
    }

    fn set_ip(&self, address: Ipv4Addr, netmask: Ipv4Addr) -> io::Result<()> {
        // utun is point-to-point: derive a peer address inside the mask,
        // network+1 unless that is the local address itself.
        let addr = u32::from(address);
        let mask = u32::from(netmask);
        let network = addr & mask;
        let peer = if network | 1 == addr {
            network | 2
        } else {
            network | 1
        };
        let peer = Ipv4Addr::from(peer);

        run_config_command(
            "ifconfig",
            &[
                &self.name,
                &address.to_string(),
                &peer.to_string(),
                "netmask",
                &netmask.to_string(),
                "up",
            ],
        )?;

        tracing::info!(
            "assigned {}/{} (peer {peer}) to '{}'",
            address,
            netmask_to_prefix(netmask),
            self.name
        );
        Ok(())
    }

    fn set_mtu(&self, mtu: u16) -> io::Result<()> {
        run_config_command("ifconfig", &[&self.name, "mtu", &mtu.to_string()])?;
        self.mtu.store(mtu, Ordering::Relaxed);
        Ok(())
    }

    fn set_up(&self, up: bool) -> io::Result<()> {
        let state = if up { "up" } else { "down" };
        run_config_command("ifconfig", &[&self.name, state])
    }

    fn set_non_blocking(&self, on: bool) -> io::Result<()> {
        let fd = self.fd.as_raw_fd();

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

impl std::fmt::Debug for MacosTun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacosTun")
            .field("name", &self.name)
            .field("mtu", &self.mtu())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unit() {
        assert_eq!(parse_unit("utun"), None);
        assert_eq!(parse_unit("utun0"), Some(0));
        assert_eq!(parse_unit("utun12"), Some(12));
        assert_eq!(parse_unit("tun0"), None);
        assert_eq!(parse_unit("utunx"), None);
    }

    #[test]
    #[ignore] // Requires root privileges
    fn test_open_auto_scan() {
        let tun = match MacosTun::open("utun", 1420) {
            Ok(tun) => tun,
            Err(e) => {
                eprintln!("skipping (no privileges?): {e}");
                return;
            }
        };
        assert!(tun.name().starts_with("utun"));
    }
}
