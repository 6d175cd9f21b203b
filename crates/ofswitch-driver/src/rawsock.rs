//! Raw-socket back-end.
//!
//! One non-blocking AF_PACKET socket per port, bound to the device's
//! ifindex. Link state is polled from the interface flags; there is no
//! checksum offload and no multi-queue support.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use ofswitch_packet::{Mbuf, PoolLocal, MAX_PACKET_SZ};
use tracing::{debug, warn};

use crate::error::{DriverError, DriverResult};
use crate::linux;
use crate::registry::SlotAllocator;
use crate::{DriverKind, DriverStats, InterfaceConfig, LinkStatus, NetDriver, PortId};

#[derive(Default)]
struct Counters {
    rx_packets: AtomicU64,
    tx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
    rx_errors: AtomicU64,
    tx_errors: AtomicU64,
}

struct RawPort {
    device: String,
    fd: RawFd,
    ifindex: i32,
    started: AtomicBool,
    counters: Counters,
}

impl Drop for RawPort {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// The raw-socket back-end.
#[derive(Default)]
pub struct RawSockDriver {
    slots: SlotAllocator,
    ports: DashMap<PortId, RawPort>,
}

impl RawSockDriver {
    /// Creates an empty raw-socket back-end.
    pub fn new() -> Self {
        Self::default()
    }
}

impl NetDriver for RawSockDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::RawSocket
    }

    fn configure(&self, config: &InterfaceConfig) -> DriverResult<PortId> {
        let (fd, ifindex) = linux::open_packet_socket(&config.device)?;
        if config.promiscuous {
            if let Err(e) = linux::set_promisc(fd, &config.device, ifindex, true) {
                warn!(device = %config.device, error = %e, "promiscuous mode unavailable");
            }
        }
        let port = match self.slots.alloc() {
            Ok(p) => p,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };
        self.ports.insert(
            port,
            RawPort {
                device: config.device.clone(),
                fd,
                ifindex,
                started: AtomicBool::new(false),
                counters: Counters::default(),
            },
        );
        debug!(port, device = %config.device, ifindex, "configured raw socket");
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
                unsafe {
                    libc::recv(
                        p.fd,
                        room.as_mut_ptr() as *mut libc::c_void,
                        room.len(),
                        0,
                    )
                }
            };
            if n <= 0 {
                // EAGAIN or error: stop this burst, the mbuf goes back.
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
                libc::send(
                    p.fd,
                    m.data().as_ptr() as *const libc::c_void,
                    m.len(),
                    0,
                )
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
        let up = linux::link_is_up(p.fd, &p.device)?;
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
            // The plain socket cannot see kernel-side drops.
            rx_dropped: u64::MAX,
            tx_dropped: u64::MAX,
        })
    }

    fn set_mtu(&self, port: PortId, mtu: u32) -> DriverResult<()> {
        let p = self.ports.get(&port).ok_or(DriverError::PortNotFound(port))?;
        linux::set_mtu(p.fd, &p.device, mtu)
    }

    fn set_promiscuous(&self, port: PortId, on: bool) -> DriverResult<()> {
        let p = self.ports.get(&port).ok_or(DriverError::PortNotFound(port))?;
        linux::set_promisc(p.fd, &p.device, p.ifindex, on)
    }

    fn hwaddr(&self, port: PortId) -> DriverResult<[u8; 6]> {
        let p = self.ports.get(&port).ok_or(DriverError::PortNotFound(port))?;
        linux::get_hwaddr(p.fd, &p.device)
    }
}
