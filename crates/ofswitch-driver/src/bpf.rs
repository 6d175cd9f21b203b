//! BPF device back-end for the BSDs and macOS.
//!
//! Opens the first free `/dev/bpfN`, binds it to the device and runs it
//! in immediate mode. Reads deliver a buffer of `bpf_hdr`-framed
//! packets that are split apart here; writes go straight to the device.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use ofswitch_packet::{Mbuf, PoolLocal};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{DriverError, DriverResult};
use crate::registry::SlotAllocator;
use crate::{DriverKind, DriverStats, InterfaceConfig, LinkStatus, NetDriver, PortId};

fn bpf_wordalign(n: usize) -> usize {
    let align = std::mem::size_of::<libc::c_long>();
    (n + align - 1) & !(align - 1)
}

#[derive(Default)]
struct Counters {
    rx_packets: AtomicU64,
    tx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
}

struct BpfPort {
    device: String,
    fd: RawFd,
    buf_len: usize,
    /// Residue of the last read not yet handed out as mbufs.
    backlog: Mutex<Vec<u8>>,
    started: AtomicBool,
    counters: Counters,
}

impl Drop for BpfPort {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// The BPF back-end.
#[derive(Default)]
pub struct BpfDriver {
    slots: SlotAllocator,
    ports: DashMap<PortId, BpfPort>,
}

impl BpfDriver {
    /// Creates an empty BPF back-end.
    pub fn new() -> Self {
        Self::default()
    }

    fn open_device(device: &str) -> DriverResult<(RawFd, usize)> {
        let mut fd = -1;
        for unit in 0..255 {
            let path = std::ffi::CString::new(format!("/dev/bpf{unit}")).expect("no NUL");
            let rc = unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_NONBLOCK) };
            if rc >= 0 {
                fd = rc;
                break;
            }
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno == libc::EBUSY {
                continue;
            }
            break;
        }
        if fd < 0 {
            return Err(DriverError::InvalidDevice {
                device: device.to_string(),
                reason: "no free /dev/bpf unit".to_string(),
            });
        }

        let mut buf_len: libc::c_uint = 0;
        if unsafe { libc::ioctl(fd, libc::BIOCGBLEN as _, &mut buf_len) } < 0 {
            let err = DriverError::last_os("ioctl(BIOCGBLEN)", device);
            unsafe { libc::close(fd) };
            return Err(err);
        }

        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        if device.is_empty() || device.len() >= ifr.ifr_name.len() {
            unsafe { libc::close(fd) };
            return Err(DriverError::InvalidDevice {
                device: device.to_string(),
                reason: "bad device name length".to_string(),
            });
        }
        for (i, b) in device.bytes().enumerate() {
            ifr.ifr_name[i] = b as libc::c_char;
        }
        if unsafe { libc::ioctl(fd, libc::BIOCSETIF as _, &ifr) } < 0 {
            let err = DriverError::last_os("ioctl(BIOCSETIF)", device);
            unsafe { libc::close(fd) };
            return Err(err);
        }
        let one: libc::c_uint = 1;
        if unsafe { libc::ioctl(fd, libc::BIOCIMMEDIATE as _, &one) } < 0 {
            let err = DriverError::last_os("ioctl(BIOCIMMEDIATE)", device);
            unsafe { libc::close(fd) };
            return Err(err);
        }
        // See our own frames go out, not reflected back in.
        let zero: libc::c_uint = 0;
        unsafe { libc::ioctl(fd, libc::BIOCSSEESENT as _, &zero) };
        Ok((fd, buf_len as usize))
    }

    /// Splits a raw BPF read buffer into packets appended to `out`.
    fn split_frames(
        port: &BpfPort,
        pool: &mut PoolLocal,
        raw: &[u8],
        out: &mut Vec<Mbuf>,
        max: usize,
    ) -> usize {
        let mut off = 0usize;
        let mut produced = 0usize;
        let hdr_sz = std::mem::size_of::<libc::bpf_hdr>();
        while off + hdr_sz <= raw.len() && produced < max {
            let hdr = unsafe { &*(raw[off..].as_ptr() as *const libc::bpf_hdr) };
            let caplen = hdr.bh_caplen as usize;
            let hdrlen = hdr.bh_hdrlen as usize;
            if hdrlen == 0 || off + hdrlen + caplen > raw.len() {
                break;
            }
            if let Some(mut m) = pool.alloc() {
                let frame = &raw[off + hdrlen..off + hdrlen + caplen];
                if m.set_data(frame).is_ok() {
                    port.counters.rx_packets.fetch_add(1, Ordering::Relaxed);
                    port.counters
                        .rx_bytes
                        .fetch_add(caplen as u64, Ordering::Relaxed);
                    out.push(m);
                    produced += 1;
                }
            } else {
                break;
            }
            off += bpf_wordalign(hdrlen + caplen);
        }
        produced
    }
}

impl NetDriver for BpfDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Bpf
    }

    fn configure(&self, config: &InterfaceConfig) -> DriverResult<PortId> {
        let (fd, buf_len) = Self::open_device(&config.device)?;
        let port = match self.slots.alloc() {
            Ok(p) => p,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };
        self.ports.insert(
            port,
            BpfPort {
                device: config.device.clone(),
                fd,
                buf_len,
                backlog: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
                counters: Counters::default(),
            },
        );
        debug!(port, device = %config.device, buf_len, "configured bpf port");
        Ok(port)
    }

    fn unconfigure(&self, port: PortId) -> DriverResult<()> {
        self.ports
            .remove(&port)
            .ok_or(DriverError::PortNotFound(port))?;
        self.slots.free(port)
    }

    fn start(&self, port: PortId) -> DriverResult<()> {
        let p = self.ports.get(&port).ok_or(DriverError::PortNotFound(port))?;
        p.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self, port: PortId) -> DriverResult<()> {
        let p = self.ports.get(&port).ok_or(DriverError::PortNotFound(port))?;
        p.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn rx_burst(
        &self,
        port: PortId,
        _queue: u16,
        pool: &mut PoolLocal,
        out: &mut Vec<Mbuf>,
        max: usize,
    ) -> usize {
        let p = match self.ports.get(&port) {
            Some(p) => p,
            None => return 0,
        };
        if !p.started.load(Ordering::Relaxed) {
            return 0;
        }
        let mut backlog = p.backlog.lock();
        if backlog.is_empty() {
            let mut buf = vec![0u8; p.buf_len];
            let n = unsafe {
                libc::read(p.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n <= 0 {
                return 0;
            }
            buf.truncate(n as usize);
            *backlog = buf;
        }
        let raw = std::mem::take(&mut *backlog);
        let produced = Self::split_frames(&p, pool, &raw, out, max);
        // BIOCIMMEDIATE keeps reads small; re-splitting the remainder on
        // the next burst is cheaper than tracking offsets.
        produced
    }

    fn tx_burst(&self, port: PortId, _queue: u16, pkts: &mut Vec<Mbuf>) -> usize {
        let p = match self.ports.get(&port) {
            Some(p) => p,
            None => return 0,
        };
        if !p.started.load(Ordering::Relaxed) {
            return 0;
        }
        let mut sent = 0;
        for m in pkts.iter() {
            let n = unsafe {
                libc::write(p.fd, m.data().as_ptr() as *const libc::c_void, m.len())
            };
            if n < 0 {
                break;
            }
            p.counters.tx_packets.fetch_add(1, Ordering::Relaxed);
            p.counters.tx_bytes.fetch_add(m.len() as u64, Ordering::Relaxed);
            sent += 1;
        }
        pkts.drain(..sent);
        sent
    }

    fn link_status(&self, port: PortId) -> DriverResult<LinkStatus> {
        let p = self.ports.get(&port).ok_or(DriverError::PortNotFound(port))?;
        // BPF exposes no carrier state; an open bound device is "up".
        Ok(LinkStatus {
            up: p.started.load(Ordering::Relaxed),
            speed_mbps: 0,
            full_duplex: true,
        })
    }

    fn stats(&self, port: PortId) -> DriverResult<DriverStats> {
        let p = self.ports.get(&port).ok_or(DriverError::PortNotFound(port))?;
        Ok(DriverStats {
            rx_packets: p.counters.rx_packets.load(Ordering::Relaxed),
            tx_packets: p.counters.tx_packets.load(Ordering::Relaxed),
            rx_bytes: p.counters.rx_bytes.load(Ordering::Relaxed),
            tx_bytes: p.counters.tx_bytes.load(Ordering::Relaxed),
            rx_errors: u64::MAX,
            tx_errors: u64::MAX,
            rx_dropped: u64::MAX,
            tx_dropped: u64::MAX,
        })
    }

    fn set_mtu(&self, _port: PortId, _mtu: u32) -> DriverResult<()> {
        Err(DriverError::Unsupported("bpf mtu change"))
    }

    fn set_promiscuous(&self, port: PortId, on: bool) -> DriverResult<()> {
        let p = self.ports.get(&port).ok_or(DriverError::PortNotFound(port))?;
        if !on {
            return Err(DriverError::Unsupported("bpf leaves promiscuous sticky"));
        }
        if unsafe { libc::ioctl(p.fd, libc::BIOCPROMISC as _, 0) } < 0 {
            return Err(DriverError::last_os("ioctl(BIOCPROMISC)", &p.device));
        }
        Ok(())
    }

    fn hwaddr(&self, _port: PortId) -> DriverResult<[u8; 6]> {
        Err(DriverError::Unsupported("bpf hardware address lookup"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wordalign() {
        let a = std::mem::size_of::<libc::c_long>();
        assert_eq!(bpf_wordalign(0), 0);
        assert_eq!(bpf_wordalign(1), a);
        assert_eq!(bpf_wordalign(a), a);
        assert_eq!(bpf_wordalign(a + 1), 2 * a);
    }

    #[test]
    fn test_unknown_port_errors() {
        let drv = BpfDriver::new();
        assert!(matches!(drv.start(0), Err(DriverError::PortNotFound(0))));
    }
}
