//! Platform abstractions for the SSI driver.
//!
//! Everything the driver needs from its host environment comes in through the
//! traits here: microsecond timing, DMA-safe shared memory, fragment
//! completion delivery and optional raw PCM capture to a log sink.

use core::ptr::NonNull;

use crate::{Direction, SsiError};

/// Physical address type.
pub type PhysAddr = u64;

/// DMA-safe memory region descriptor.
///
/// The region must be physically contiguous and mapped uncached so that FIFO
/// data written by the DMA engine is visible without explicit cache
/// maintenance.
#[derive(Debug, Clone, Copy)]
pub struct MemoryBuffer {
    pub virt_addr: NonNull<u8>,
    pub phys_addr: PhysAddr,
    pub size: usize,
}

impl MemoryBuffer {
    /// View the region as a byte slice.
    ///
    /// # Safety
    ///
    /// The caller must ensure no DMA transfer is concurrently writing the
    /// addressed range.
    pub unsafe fn as_slice(&self) -> &[u8] {
        core::slice::from_raw_parts(self.virt_addr.as_ptr(), self.size)
    }

    /// View the region as a mutable byte slice.
    ///
    /// # Safety
    ///
    /// Same aliasing requirements as [`Self::as_slice`].
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        core::slice::from_raw_parts_mut(self.virt_addr.as_ptr(), self.size)
    }
}

/// Services the host platform must provide.
pub trait Osal {
    /// Current timestamp in microseconds.
    fn now_us(&self) -> u64;

    /// Busy-wait for the given number of microseconds.
    fn udelay(&self, us: u32);

    /// Allocate a physically contiguous, uncached buffer suitable for DMA.
    fn shm_alloc(&self, size: usize) -> Result<MemoryBuffer, SsiError>;

    /// Release a buffer obtained from [`Self::shm_alloc`].
    fn shm_free(&self, buf: MemoryBuffer);
}

/// Receiver for stream progress notifications.
///
/// Called from interrupt context with the device lock held, so
/// implementations must not call back into the driver.
pub trait EventSink: Send + Sync {
    /// A fragment of `bytes` completed on the stream identified by
    /// `direction` and `subchn` (always 0 for playback).
    fn fragment_done(&self, direction: Direction, subchn: usize, bytes: usize);
}

/// Optional raw PCM tap used for debugging audio paths.
///
/// When enabled, every fragment that crosses the driver is mirrored to this
/// sink before it is handed to the client.
pub trait PcmLog: Send + Sync {
    /// Open the log for one direction. Returns false when logging for that
    /// direction is disabled, in which case no further calls are made.
    fn open(&self, direction: Direction) -> bool;

    /// Append raw PCM bytes.
    fn write(&self, direction: Direction, data: &[u8]);

    /// Close the log for one direction.
    fn close(&self, direction: Direction);
}

/// Poll `cond` until it holds, waiting `step_us` between probes, for at most
/// `max_polls` iterations.
///
/// Returns `Err(())` when the condition never held. Callers log the expiry
/// and continue; an expired poll is never surfaced as an operation failure.
pub fn bounded_poll<O: Osal>(
    osal: &O,
    max_polls: u32,
    step_us: u32,
    mut cond: impl FnMut() -> bool,
) -> Result<(), ()> {
    for _ in 0..max_polls {
        if cond() {
            return Ok(());
        }
        osal.udelay(step_us);
    }
    if cond() {
        Ok(())
    } else {
        Err(())
    }
}
