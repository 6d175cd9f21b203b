//! Shared AF_PACKET plumbing for the Linux back-ends.

use std::os::unix::io::RawFd;

use crate::error::{DriverError, DriverResult};

/// Builds an `ifreq` with the device name filled in.
pub(crate) fn ifreq_for(device: &str) -> DriverResult<libc::ifreq> {
    if device.is_empty() || device.len() >= libc::IFNAMSIZ {
        return Err(DriverError::InvalidDevice {
            device: device.to_string(),
            reason: format!("name must be 1..{} bytes", libc::IFNAMSIZ - 1),
        });
    }
    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    for (i, b) in device.bytes().enumerate() {
        ifr.ifr_name[i] = b as libc::c_char;
    }
    Ok(ifr)
}

/// Opens a non-blocking AF_PACKET socket bound to `device`, returning
/// the fd and the interface index.
pub(crate) fn open_packet_socket(device: &str) -> DriverResult<(RawFd, i32)> {
    let proto = (libc::ETH_P_ALL as u16).to_be() as libc::c_int;
    let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW | libc::SOCK_NONBLOCK, proto) };
    if fd < 0 {
        return Err(DriverError::last_os("socket", device));
    }
    let mut ifr = match ifreq_for(device) {
        Ok(ifr) => ifr,
        Err(e) => {
            unsafe { libc::close(fd) };
            return Err(e);
        }
    };
    if unsafe { libc::ioctl(fd, libc::SIOCGIFINDEX as _, &mut ifr) } < 0 {
        let err = DriverError::last_os("ioctl(SIOCGIFINDEX)", device);
        unsafe { libc::close(fd) };
        return Err(err);
    }
    let ifindex = unsafe { ifr.ifr_ifru.ifru_ifindex };

    let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    sll.sll_family = libc::AF_PACKET as libc::sa_family_t;
    sll.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
    sll.sll_ifindex = ifindex;
    let rc = unsafe {
        libc::bind(
            fd,
            &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        let err = DriverError::last_os("bind", device);
        unsafe { libc::close(fd) };
        return Err(err);
    }
    Ok((fd, ifindex))
}

/// Reads the interface flags word.
pub(crate) fn if_flags(fd: RawFd, device: &str) -> DriverResult<i32> {
    let mut ifr = ifreq_for(device)?;
    if unsafe { libc::ioctl(fd, libc::SIOCGIFFLAGS as _, &mut ifr) } < 0 {
        return Err(DriverError::last_os("ioctl(SIOCGIFFLAGS)", device));
    }
    Ok(unsafe { ifr.ifr_ifru.ifru_flags } as i32)
}

/// True when the interface reports a running carrier.
pub(crate) fn link_is_up(fd: RawFd, device: &str) -> DriverResult<bool> {
    Ok(if_flags(fd, device)? & libc::IFF_RUNNING != 0)
}

/// Reads the device MTU.
pub(crate) fn get_mtu(fd: RawFd, device: &str) -> DriverResult<u32> {
    let mut ifr = ifreq_for(device)?;
    if unsafe { libc::ioctl(fd, libc::SIOCGIFMTU as _, &mut ifr) } < 0 {
        return Err(DriverError::last_os("ioctl(SIOCGIFMTU)", device));
    }
    Ok(unsafe { ifr.ifr_ifru.ifru_mtu } as u32)
}

/// Sets the device MTU.
pub(crate) fn set_mtu(fd: RawFd, device: &str, mtu: u32) -> DriverResult<()> {
    let mut ifr = ifreq_for(device)?;
    ifr.ifr_ifru.ifru_mtu = mtu as libc::c_int;
    if unsafe { libc::ioctl(fd, libc::SIOCSIFMTU as _, &mut ifr) } < 0 {
        return Err(DriverError::last_os("ioctl(SIOCSIFMTU)", device));
    }
    Ok(())
}

/// Reads the device hardware address.
pub(crate) fn get_hwaddr(fd: RawFd, device: &str) -> DriverResult<[u8; 6]> {
    let mut ifr = ifreq_for(device)?;
    if unsafe { libc::ioctl(fd, libc::SIOCGIFHWADDR as _, &mut ifr) } < 0 {
        return Err(DriverError::last_os("ioctl(SIOCGIFHWADDR)", device));
    }
    let sa = unsafe { ifr.ifr_ifru.ifru_hwaddr };
    let mut mac = [0u8; 6];
    for i in 0..6 {
        mac[i] = sa.sa_data[i] as u8;
    }
    Ok(mac)
}

/// Adds or drops promiscuous-mode membership on the packet socket.
pub(crate) fn set_promisc(fd: RawFd, device: &str, ifindex: i32, on: bool) -> DriverResult<()> {
    let mut mreq: libc::packet_mreq = unsafe { std::mem::zeroed() };
    mreq.mr_ifindex = ifindex;
    mreq.mr_type = libc::PACKET_MR_PROMISC as libc::c_ushort;
    let opt = if on {
        libc::PACKET_ADD_MEMBERSHIP
    } else {
        libc::PACKET_DROP_MEMBERSHIP
    };
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_PACKET,
            opt,
            &mreq as *const libc::packet_mreq as *const libc::c_void,
            std::mem::size_of::<libc::packet_mreq>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(DriverError::last_os("setsockopt(PACKET_MEMBERSHIP)", device));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ifreq_rejects_long_name() {
        let long = "x".repeat(libc::IFNAMSIZ);
        assert!(matches!(
            ifreq_for(&long),
            Err(DriverError::InvalidDevice { .. })
        ));
    }

    #[test]
    fn test_ifreq_rejects_empty_name() {
        assert!(matches!(
            ifreq_for(""),
            Err(DriverError::InvalidDevice { .. })
        ));
    }

    #[test]
    fn test_ifreq_copies_name() {
        let ifr = ifreq_for("eth0").unwrap();
        assert_eq!(ifr.ifr_name[0] as u8, b'e');
        assert_eq!(ifr.ifr_name[3] as u8, b'0');
        assert_eq!(ifr.ifr_name[4], 0);
    }
}
