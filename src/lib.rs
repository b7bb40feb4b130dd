//! Low-level building blocks for driving the i.MX SSI audio serializer.
//!
//! The crate keeps the register descriptions and streaming state machines in
//! Rust so that higher-level audio components can avoid hard-coded offsets
//! and rely on type safe accessors instead.
//!
//! Platform-dependent services (DMA engine, DMA-safe memory, timing, fragment
//! completion delivery and raw PCM logging) are injected through small traits,
//! which also makes the whole driver exercisable against mock hardware.

#![no_std]

extern crate alloc;
#[macro_use]
extern crate log;

mod config;
mod device;
mod dma;
mod err;
mod osal;
mod registers;
mod stream;

pub use config::*;
pub use device::*;
pub use dma::*;
pub use err::*;
pub use osal::*;
pub use registers::SsiRegisters;
pub use stream::*;

/// Upper bound on simultaneously open capture subchannels multiplexed onto
/// the single hardware RX DMA engine.
pub const MAX_CAP_SUBCHN_COUNT: usize = 3;

/// FIFO watermark programmed into SFCSR for both directions. The DMA channel
/// trigger string must carry the same value.
pub const FIFO_WATERMARK: u32 = 4;

/// TX FIFO fill level waited for before the transmitter is enabled.
pub const TX_FIFO_PREFILL: u32 = 12;

/// Transfer direction of a logical audio stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Playback,
    Capture,
}
