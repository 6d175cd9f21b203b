//! CPU pinning for pipeline threads.

use tracing::{debug, warn};

/// Pins the calling thread to one logical CPU. Best effort: a refusal
/// (cpuset restrictions, too few CPUs) downgrades to a warning, the
/// thread keeps running unpinned.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(cpu: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            warn!(cpu, "sched_setaffinity failed, running unpinned");
        } else {
            debug!(cpu, "thread pinned");
        }
    }
}

/// No pinning support off Linux.
#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(cpu: usize) {
    debug!(cpu, "thread pinning unavailable on this platform");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_does_not_panic() {
        // CPU 0 always exists; an affinity failure only warns.
        pin_current_thread(0);
    }
}
