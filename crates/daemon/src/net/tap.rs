//! Linux TAP network stack
//!
//! Each session gets a non-persistent TAP device from `/dev/net/tun`, named
//! `<prefix><n>` by the kernel. Registering brings the link up and starts a
//! reader thread that hands every frame the host sends to the driver;
//! unregistering stops the reader and takes the link down. Releasing closes
//! the file descriptor, which removes the device.

use common::MacAddress;
use driver::{
    BufferAllocator, DriverError, Frame, FramePool, NetInterface, NetworkStack, SessionId,
    TransmitEntry,
};
use nix::errno::Errno;
use nix::libc;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socket};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use tracing::{debug, info, trace, warn};

const TUN_DEVICE: &str = "/dev/net/tun";

/// Ethernet header plus one VLAN tag
const FRAME_HEADER_ROOM: usize = 14 + 4;

/// How often the reader re-checks its stop flag
const READER_POLL_MS: u16 = 100;

nix::ioctl_readwrite_bad!(
    tun_set_iff,
    nix::request_code_write!(b'T', 202, std::mem::size_of::<libc::c_int>()),
    libc::ifreq
);
nix::ioctl_write_ptr_bad!(set_hw_addr, libc::SIOCSIFHWADDR, libc::ifreq);
nix::ioctl_write_ptr_bad!(set_mtu, libc::SIOCSIFMTU, libc::ifreq);
nix::ioctl_readwrite_bad!(get_flags, libc::SIOCGIFFLAGS, libc::ifreq);
nix::ioctl_write_ptr_bad!(set_flags, libc::SIOCSIFFLAGS, libc::ifreq);

/// Zeroed `ifreq` naming `name`, truncated to fit `IFNAMSIZ`
fn ifreq_for(name: &str) -> libc::ifreq {
    // SAFETY: ifreq is plain old data; all-zero is a valid value
    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, src) in ifr
        .ifr_name
        .iter_mut()
        .zip(name.bytes().take(libc::IFNAMSIZ - 1))
    {
        *dst = src as libc::c_char;
    }
    ifr
}

fn ifreq_name(ifr: &libc::ifreq) -> String {
    ifr.ifr_name
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8 as char)
        .collect()
}

fn hw_sockaddr(mac: MacAddress) -> libc::sockaddr {
    // SAFETY: sockaddr is plain old data; all-zero is a valid value
    let mut addr: libc::sockaddr = unsafe { std::mem::zeroed() };
    addr.sa_family = libc::ARPHRD_ETHER;
    for (dst, src) in addr.sa_data.iter_mut().zip(mac.0) {
        *dst = src as libc::c_char;
    }
    addr
}

fn registration_error(what: &str, name: &str, e: impl std::fmt::Display) -> DriverError {
    DriverError::RegistrationFailed(format!("{} {}: {}", what, name, e))
}

/// A TAP device backing one session
pub struct TapInterface {
    name: String,
    mac: MacAddress,
    device: Arc<File>,
    reader: Option<TapReader>,
}

impl NetInterface for TapInterface {
    fn name(&self) -> &str {
        &self.name
    }

    fn mac(&self) -> MacAddress {
        self.mac
    }
}

struct TapReader {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// [`NetworkStack`] over Linux TAP devices
pub struct TapStack {
    prefix: String,
    mtu: u32,
    pool: FramePool,
    /// Socket used for interface ioctls
    control: OwnedFd,
}

impl TapStack {
    pub fn new(prefix: &str, mtu: u32, pool: FramePool) -> common::Result<Self> {
        let control = socket(
            AddressFamily::Inet,
            SockType::Datagram,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(|e| common::Error::Network(format!("control socket: {}", e)))?;

        Ok(Self {
            prefix: prefix.to_string(),
            mtu,
            pool,
            control,
        })
    }

    /// Name template handed to the kernel, which substitutes a free index
    pub fn name_template(&self) -> String {
        format!("{}%d", self.prefix)
    }

    fn set_link_up(&self, name: &str, up: bool) -> nix::Result<()> {
        let mut ifr = ifreq_for(name);
        // SAFETY: ifr is a valid ifreq for the duration of both calls, and
        // SIOCGIFFLAGS fills in ifru_flags before it is read
        unsafe {
            get_flags(self.control.as_raw_fd(), &mut ifr)?;
            let mut flags = ifr.ifr_ifru.ifru_flags;
            if up {
                flags |= libc::IFF_UP as libc::c_short;
            } else {
                flags &= !(libc::IFF_UP as libc::c_short);
            }
            ifr.ifr_ifru.ifru_flags = flags;
            set_flags(self.control.as_raw_fd(), &ifr)?;
        }
        Ok(())
    }
}

impl NetworkStack for TapStack {
    type Interface = TapInterface;

    fn allocate_interface(
        &mut self,
        session: SessionId,
        mac: MacAddress,
    ) -> driver::Result<TapInterface> {
        let template = self.name_template();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(TUN_DEVICE)
            .map_err(|e| registration_error("open", TUN_DEVICE, e))?;

        let mut ifr = ifreq_for(&template);
        ifr.ifr_ifru.ifru_flags = (libc::IFF_TAP | libc::IFF_NO_PI) as libc::c_short;
        // SAFETY: ifr is a valid ifreq; the kernel writes the chosen name back into it
        unsafe { tun_set_iff(file.as_raw_fd(), &mut ifr) }
            .map_err(|e| registration_error("TUNSETIFF", &template, e))?;
        let name = ifreq_name(&ifr);

        let mut ifr = ifreq_for(&name);
        ifr.ifr_ifru.ifru_hwaddr = hw_sockaddr(mac);
        // SAFETY: ifr is a valid ifreq naming an existing interface
        unsafe { set_hw_addr(self.control.as_raw_fd(), &ifr) }
            .map_err(|e| registration_error("SIOCSIFHWADDR", &name, e))?;

        let mut ifr = ifreq_for(&name);
        ifr.ifr_ifru.ifru_mtu = self.mtu as libc::c_int;
        // SAFETY: as above
        unsafe { set_mtu(self.control.as_raw_fd(), &ifr) }
            .map_err(|e| registration_error("SIOCSIFMTU", &name, e))?;

        debug!("{}: allocated {} ({})", session, name, mac);
        Ok(TapInterface {
            name,
            mac,
            device: Arc::new(file),
            reader: None,
        })
    }

    fn register(
        &mut self,
        interface: &mut TapInterface,
        entry: TransmitEntry,
    ) -> driver::Result<()> {
        self.set_link_up(&interface.name, true)
            .map_err(|e| registration_error("link up", &interface.name, e))?;

        let stop = Arc::new(AtomicBool::new(false));
        let reader = TapFrameReader {
            name: interface.name.clone(),
            device: interface.device.clone(),
            stop: stop.clone(),
            pool: self.pool.clone(),
            frame_len: self.mtu as usize + FRAME_HEADER_ROOM,
            entry,
        };
        let thread = std::thread::Builder::new()
            .name(format!("tap-{}", interface.name))
            .spawn(move || reader.run())
            .map_err(|e| registration_error("spawn reader for", &interface.name, e))?;

        interface.reader = Some(TapReader { stop, thread });
        info!("{} is up", interface.name);
        Ok(())
    }

    fn unregister(&mut self, interface: &mut TapInterface) {
        if let Some(reader) = interface.reader.take() {
            reader.stop.store(true, Ordering::Release);
            if reader.thread.join().is_err() {
                warn!("{}: reader thread panicked", interface.name);
            }
        }
        if let Err(e) = self.set_link_up(&interface.name, false) {
            debug!("{}: link down failed: {}", interface.name, e);
        }
        info!("{} is down", interface.name);
    }

    fn release(&mut self, interface: TapInterface) {
        debug!("{}: released", interface.name);
    }

    fn ingest(&mut self, interface: &TapInterface, frame: Frame) {
        match (&*interface.device).write(frame.data()) {
            Ok(_) => trace!(
                "{}: rx {} bytes, proto {:#06x}",
                interface.name,
                frame.len(),
                frame.protocol()
            ),
            Err(e) => debug!("{}: dropped inbound frame: {}", interface.name, e),
        }
    }
}

/// Reads outbound frames from a TAP device and hands them to the driver
struct TapFrameReader {
    name: String,
    device: Arc<File>,
    stop: Arc<AtomicBool>,
    pool: FramePool,
    frame_len: usize,
    entry: TransmitEntry,
}

impl TapFrameReader {
    fn run(self) {
        debug!("{}: reader started", self.name);
        let mut scratch = vec![0u8; self.frame_len];

        while !self.stop.load(Ordering::Acquire) {
            let mut fds = [PollFd::new(self.device.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(READER_POLL_MS)) {
                Ok(0) | Err(Errno::EINTR) => continue,
                Ok(_) => {}
                Err(e) => {
                    warn!("{}: poll failed: {}", self.name, e);
                    break;
                }
            }

            let n = match (&*self.device).read(&mut scratch) {
                Ok(0) => continue,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("{}: read failed: {}", self.name, e);
                    break;
                }
            };

            match self.pool.allocate(n) {
                Ok(mut frame) => {
                    frame.extend_from_slice(&scratch[..n]);
                    self.entry.transmit(frame);
                }
                Err(e) => trace!("{}: dropped outbound frame: {}", self.name, e),
            }
        }
        debug!("{}: reader stopped", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ifreq_name_round_trip() {
        let ifr = ifreq_for("usbeth3");
        assert_eq!(ifreq_name(&ifr), "usbeth3");
    }

    #[test]
    fn test_ifreq_name_is_truncated() {
        let ifr = ifreq_for("a-name-longer-than-ifnamsiz");
        let name = ifreq_name(&ifr);
        assert_eq!(name.len(), libc::IFNAMSIZ - 1);
        assert!("a-name-longer-than-ifnamsiz".starts_with(&name));
    }

    #[test]
    fn test_hw_sockaddr_carries_mac() {
        let mac = MacAddress([0x02, 0x11, 0x22, 0x33, 0x44, 0x55]);
        let addr = hw_sockaddr(mac);
        assert_eq!(addr.sa_family, libc::ARPHRD_ETHER);
        let bytes: Vec<u8> = addr.sa_data[..6].iter().map(|&c| c as u8).collect();
        assert_eq!(bytes, mac.0);
    }
}
