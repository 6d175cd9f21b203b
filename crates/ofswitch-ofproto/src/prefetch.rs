//! Software prefetch shim.
//!
//! The worker loop prefetches the next one or two packets' headers
//! before processing the current one. On x86_64 this is a real prefetch
//! instruction; elsewhere it compiles away.

/// Hints that `data` will be read soon.
#[inline(always)]
pub fn prefetch_read(data: &[u8]) {
    #[cfg(target_arch = "x86_64")]
    {
        if !data.is_empty() {
            unsafe {
                core::arch::x86_64::_mm_prefetch(
                    data.as_ptr() as *const i8,
                    core::arch::x86_64::_MM_HINT_T0,
                );
            }
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = data;
    }
}
