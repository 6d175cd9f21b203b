//! Physical-port back-end over AF_PACKET fanout.
//!
//! One socket per RX queue, all joined to a PACKET_FANOUT_HASH group so
//! the kernel spreads flows across queues the way NIC RSS would. Link
//! transitions are detected by the management poll timer through
//! [`NetDriver::poll_link`], which fires the registered callback.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use ofswitch_packet::{Mbuf, PoolLocal, MAX_PACKET_SZ};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{DriverError, DriverResult};
use crate::linux;
use crate::registry::SlotAllocator;
use crate::{
    DriverKind, DriverStats, InterfaceConfig, LinkCallback, LinkStatus, NetDriver, PortId,
};

// Fanout constants predate their libc bindings.
const PACKET_FANOUT: libc::c_int = 18;
const PACKET_FANOUT_HASH: libc::c_int = 0;

#[derive(Default)]
struct Counters {
    rx_packets: AtomicU64,
    tx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
    rx_errors: AtomicU64,
    tx_errors: AtomicU64,
}

struct PhyPort {
    device: String,
    ifindex: i32,
    fds: Vec<RawFd>,
    started: AtomicBool,
    last_up: AtomicBool,
    callback: Mutex<Option<LinkCallback>>,
    counters: Counters,
}

impl Drop for PhyPort {
    fn drop(&mut self) {
        for &fd in &self.fds {
            unsafe { libc::close(fd) };
        }
    }
}

/// The AF_PACKET fanout back-end.
#[derive(Default)]
pub struct PhyDriver {
    slots: SlotAllocator,
    ports: DashMap<PortId, PhyPort>,
}

impl PhyDriver {
    /// Creates an empty physical back-end.
    pub fn new() -> Self {
        Self::default()
    }

    fn join_fanout(fd: RawFd, device: &str, group: u16) -> DriverResult<()> {
        let arg: libc::c_int = (group as libc::c_int) | (PACKET_FANOUT_HASH << 16);
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_PACKET,
                PACKET_FANOUT,
                &arg as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(DriverError::last_os("setsockopt(PACKET_FANOUT)", device));
        }
        Ok(())
    }
}

impl NetDriver for PhyDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::EthernetPhy
    }

    fn configure(&self, config: &InterfaceConfig) -> DriverResult<PortId> {
        let n_queues = config.rx_queues.max(1);
        let mut fds = Vec::with_capacity(n_queues as usize);
        let mut ifindex = 0;
        let close_all = |fds: &[RawFd]| {
            for &fd in fds {
                unsafe { libc::close(fd) };
            }
        };
        for q in 0..n_queues {
            let (fd, idx) = match linux::open_packet_socket(&config.device) {
                Ok(v) => v,
                Err(e) => {
                    close_all(&fds);
                    return Err(e);
                }
            };
            ifindex = idx;
            if n_queues > 1 {
                // The fanout group id must be unique per device; derive
                // it from the interface index.
                if let Err(e) = Self::join_fanout(fd, &config.device, (idx & 0xffff) as u16) {
                    unsafe { libc::close(fd) };
                    close_all(&fds);
                    return Err(e);
                }
            }
            if q == 0 && config.promiscuous {
                if let Err(e) = linux::set_promisc(fd, &config.device, idx, true) {
                    warn!(device = %config.device, error = %e, "promiscuous mode unavailable");
                }
            }
            fds.push(fd);
        }
        if config.mtu != 0 {
            if let Err(e) = linux::set_mtu(fds[0], &config.device, config.mtu) {
                warn!(device = %config.device, mtu = config.mtu, error = %e, "MTU change rejected by the device");
            }
        }
        let port = match self.slots.alloc() {
            Ok(p) => p,
            Err(e) => {
                close_all(&fds);
                return Err(e);
            }
        };
        let up = linux::link_is_up(fds[0], &config.device).unwrap_or(false);
        self.ports.insert(
            port,
            PhyPort {
                device: config.device.clone(),
                ifindex,
                fds,
                started: AtomicBool::new(false),
                last_up: AtomicBool::new(up),
                callback: Mutex::new(None),
                counters: Counters::default(),
            },
        );
        info!(port, device = %config.device, queues = n_queues, "configured physical port");
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
        debug!(port, device = %p.device, "started physical port");
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
        queue: u16,
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
        let fd = match p.fds.get(queue as usize) {
            Some(&fd) => fd,
            None => return 0,
        };
        let mut received = 0;
        while received < max {
            let mut m = match pool.alloc() {
                Some(m) => m,
                None => break,
            };
            let n = {
                let room = match m.append(MAX_PACKET_SZ) {
                    Ok(room) => room,
                    Err(_) => break,
                };
                unsafe { libc::recv(fd, room.as_mut_ptr() as *mut libc::c_void, room.len(), 0) }
            };
            if n <= 0 {
                break;
            }
            let excess = MAX_PACKET_SZ - n as usize;
            if m.trim(excess).is_err() {
                p.counters.rx_errors.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            p.counters.rx_packets.fetch_add(1, Ordering::Relaxed);
            p.counters.rx_bytes.fetch_add(n as u64, Ordering::Relaxed);
            out.push(m);
            received += 1;
        }
        received
    }

    fn tx_burst(&self, port: PortId, queue: u16, pkts: &mut Vec<Mbuf>) -> usize {
        let p = match self.ports.get(&port) {
            Some(p) => p,
            None => return 0,
        };
        if !p.started.load(Ordering::Relaxed) {
            return 0;
        }
        let fd = p.fds[queue as usize % p.fds.len()];
        let mut sent = 0;
        for m in pkts.iter() {
            let n = unsafe {
                libc::send(fd, m.data().as_ptr() as *const libc::c_void, m.len(), 0)
            };
            if n < 0 {
                p.counters.tx_errors.fetch_add(1, Ordering::Relaxed);
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
        let up = linux::link_is_up(p.fds[0], &p.device)?;
        Ok(LinkStatus {
            up,
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
            rx_errors: p.counters.rx_errors.load(Ordering::Relaxed),
            tx_errors: p.counters.tx_errors.load(Ordering::Relaxed),
            rx_dropped: u64::MAX,
            tx_dropped: u64::MAX,
        })
    }

    fn set_mtu(&self, port: PortId, mtu: u32) -> DriverResult<()> {
        let p = self.ports.get(&port).ok_or(DriverError::PortNotFound(port))?;
        linux::set_mtu(p.fds[0], &p.device, mtu)
    }

    fn set_promiscuous(&self, port: PortId, on: bool) -> DriverResult<()> {
        let p = self.ports.get(&port).ok_or(DriverError::PortNotFound(port))?;
        linux::set_promisc(p.fds[0], &p.device, p.ifindex, on)
    }

    fn hwaddr(&self, port: PortId) -> DriverResult<[u8; 6]> {
        let p = self.ports.get(&port).ok_or(DriverError::PortNotFound(port))?;
        linux::get_hwaddr(p.fds[0], &p.device)
    }

    fn set_link_callback(&self, port: PortId, cb: LinkCallback) -> DriverResult<()> {
        let p = self.ports.get(&port).ok_or(DriverError::PortNotFound(port))?;
        *p.callback.lock() = Some(cb);
        Ok(())
    }

    fn poll_link(&self, port: PortId) {
        let (cb, status) = {
            let p = match self.ports.get(&port) {
                Some(p) => p,
                None => return,
            };
            let up = match linux::link_is_up(p.fds[0], &p.device) {
                Ok(up) => up,
                Err(_) => return,
            };
            let was = p.last_up.swap(up, Ordering::SeqCst);
            if was == up {
                return;
            }
            info!(port, device = %p.device, up, "link transition");
            let result = (
                p.callback.lock().clone(),
                LinkStatus {
                    up,
                    speed_mbps: 0,
                    full_duplex: true,
                },
            );
            result
        };
        if let Some(cb) = cb {
            cb(port, status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_port_errors() {
        let drv = PhyDriver::new();
        assert!(matches!(drv.stop(1), Err(DriverError::PortNotFound(1))));
        assert!(matches!(drv.hwaddr(0), Err(DriverError::PortNotFound(0))));
    }

    #[test]
    fn test_poll_link_unknown_port_is_noop() {
        let drv = PhyDriver::new();
        drv.poll_link(42);
    }
}
