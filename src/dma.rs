//! Contract with the platform DMA service.
//!
//! The SSI has no DMA engine of its own; it raises request events at the
//! FIFO watermark and an external DMA controller moves the data. The driver
//! consumes that controller through [`DmaDriver`], configured per channel by
//! an option string and per transfer by a [`DmaTransfer`] scatter list.

use alloc::{format, string::String, vec::Vec};

use crate::{
    osal::{MemoryBuffer, PhysAddr},
    Direction, SsiError,
};

/// Opaque handle to an attached DMA channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaChannel(pub u32);

/// Static properties of the DMA service.
#[derive(Debug, Clone, Copy)]
pub struct DmaInfo {
    pub max_priority: u32,
}

/// Completion event delivery policy for an attached channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachMode {
    /// One completion event per scatter-list segment.
    EventPerSegment,
    /// A single event when the whole transfer finishes.
    EventOnComplete,
}

/// One physically contiguous piece of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaFragment {
    pub paddr: PhysAddr,
    pub len: usize,
}

/// Scatter list describing a complete transfer.
#[derive(Debug, Clone)]
pub struct DmaTransfer {
    pub fragments: Vec<DmaFragment>,
    /// FIFO access width in bits, 16 or 32 by sample size.
    pub unit_size: u32,
    /// Total bytes moved per pass over the list.
    pub bytes: usize,
}

impl DmaTransfer {
    /// Cut `buf` into `frag_size`-sized fragments. `buf.size` must be a
    /// multiple of `frag_size`.
    pub fn from_buffer(buf: &MemoryBuffer, frag_size: usize, unit_size: u32) -> Self {
        let count = buf.size / frag_size;
        let mut fragments = Vec::with_capacity(count);
        for idx in 0..count {
            fragments.push(DmaFragment {
                paddr: buf.phys_addr + (idx * frag_size) as PhysAddr,
                len: frag_size,
            });
        }
        Self {
            fragments,
            unit_size,
            bytes: count * frag_size,
        }
    }
}

/// Function table of the platform DMA service.
///
/// Mirrors the attach/setup/start/abort/complete/release lifecycle the
/// service exposes. All methods are called with the device lock held.
pub trait DmaDriver: Send {
    fn init(&self) -> Result<(), SsiError>;

    fn driver_info(&self) -> DmaInfo;

    /// Attach a channel described by `options` (see [`build_dma_options`]).
    /// `channel_type` selects the peripheral bus arbitration class.
    fn channel_attach(
        &self,
        options: &str,
        direction: Direction,
        channel_type: u32,
        priority: u32,
        mode: AttachMode,
    ) -> Result<DmaChannel, SsiError>;

    fn setup_xfer(&self, chn: DmaChannel, transfer: &DmaTransfer) -> Result<(), SsiError>;

    fn xfer_start(&self, chn: DmaChannel) -> Result<(), SsiError>;

    fn xfer_abort(&self, chn: DmaChannel) -> Result<(), SsiError>;

    /// Acknowledge a finished (non-looping) transfer so the channel can be
    /// re-armed with `setup_xfer`.
    fn xfer_complete(&self, chn: DmaChannel) -> Result<(), SsiError>;

    /// Bytes remaining in the current pass, used for position queries.
    fn bytes_left(&self, chn: DmaChannel) -> usize;

    fn channel_release(&self, chn: DmaChannel);

    fn fini(&self);
}

/// Render the channel option string consumed by the DMA service.
///
/// `watermark` must match the FIFO watermark programmed into SFCSR. With a
/// single consumer the channel loops over its scatter list autonomously
/// (`regen,contloop`); with multiple capture subchannels every pass is
/// re-armed by software so the fan-out copier stays in step.
pub fn build_dma_options(
    fifo_paddr: PhysAddr,
    event: u32,
    watermark: u32,
    subchn_count: usize,
) -> String {
    let mut opts = format!(
        "eventnum={},watermark={},fifopaddr={:#x}",
        event, watermark, fifo_paddr
    );
    if subchn_count == 1 {
        opts.push_str(",regen,contloop");
    }
    opts
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::ptr::NonNull;

    extern crate std;

    #[test]
    fn option_string_single_consumer_loops() {
        let opts = build_dma_options(0x0202_8000, 38, 4, 1);
        assert_eq!(opts, "eventnum=38,watermark=4,fifopaddr=0x2028000,regen,contloop");
    }

    #[test]
    fn option_string_multi_subchannel_rearms() {
        let opts = build_dma_options(0x0202_8008, 37, 4, 3);
        assert_eq!(opts, "eventnum=37,watermark=4,fifopaddr=0x2028008");
    }

    #[test]
    fn transfer_covers_buffer_in_order() {
        let mut backing = [0u8; 16];
        let buf = MemoryBuffer {
            virt_addr: NonNull::new(backing.as_mut_ptr()).unwrap(),
            phys_addr: 0x8000_0000,
            size: 4096,
        };
        let t = DmaTransfer::from_buffer(&buf, 1024, 16);
        assert_eq!(t.fragments.len(), 4);
        assert_eq!(t.bytes, 4096);
        assert_eq!(t.unit_size, 16);
        for (idx, frag) in t.fragments.iter().enumerate() {
            assert_eq!(frag.paddr, 0x8000_0000 + (idx as u64) * 1024);
            assert_eq!(frag.len, 1024);
        }
    }
}
