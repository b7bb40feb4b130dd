//! Driver configuration.
//!
//! Configuration arrives as a comma-separated `key=value` option string
//! (`ssibase=0x2028000,rate=8000:48000,clk_mode=i2s_master,...`). The parsed
//! [`SsiConfig`] is fixed at attach and never mutated afterwards.

use crate::{osal::PhysAddr, SsiError, MAX_CAP_SUBCHN_COUNT};

/// Sample rates accepted by the `rate` option.
pub const SUPPORTED_RATES: &[u32] = &[
    5512, 8000, 11025, 16000, 22050, 32000, 44100, 48000, 64000, 88200, 96000, 176400, 192000,
];

/// Whether `rate` appears in the supported-rate table.
pub fn rate_supported(rate: u32) -> bool {
    SUPPORTED_RATES.contains(&rate)
}

/// Bit-clock and frame-sync direction of the SSI port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockMode {
    /// I2S framing, SSI generates bit clock and frame sync.
    I2sMaster,
    /// I2S framing, codec generates the clocks.
    I2sSlave,
    /// Network ("normal") framing, SSI is clock source.
    NormalMaster,
    /// Network framing, codec is clock source.
    NormalSlave,
}

impl ClockMode {
    pub fn is_master(self) -> bool {
        matches!(self, Self::I2sMaster | Self::NormalMaster)
    }

    pub fn is_normal(self) -> bool {
        matches!(self, Self::NormalMaster | Self::NormalSlave)
    }
}

/// Serial protocol selecting the default polarity/frame-sync flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    I2s,
    Pcm,
}

/// Frame-sync assertion length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncLen {
    /// One bit clock.
    Bit,
    /// One full word.
    Word,
}

/// Capabilities of the SSI silicon revision being driven.
///
/// Resolved once from the `variant` option at attach; all behavior branches
/// consult this descriptor instead of re-deriving from the SoC type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SsiVariant {
    /// A second FIFO instance (STX1/SRX1) exists and is enabled alongside
    /// FIFO 0.
    pub dual_fifo: bool,
    /// The transmit path must be drained through the shift register on stop
    /// and the RX FIFO emptied by reads on prepare. Variants without this
    /// flag flush through the SOR strobes instead.
    pub explicit_drain: bool,
}

impl SsiVariant {
    /// i.MX6 family: dual FIFO, explicit drain.
    pub const fn mx6x() -> Self {
        Self {
            dual_fifo: true,
            explicit_drain: true,
        }
    }

    /// i.MX53: single FIFO, explicit drain.
    pub const fn mx53() -> Self {
        Self {
            dual_fifo: false,
            explicit_drain: true,
        }
    }

    /// Older parts: single FIFO, SOR flush strobes.
    pub const fn legacy() -> Self {
        Self {
            dual_fifo: false,
            explicit_drain: false,
        }
    }
}

/// Parsed driver configuration.
#[derive(Debug, Clone)]
pub struct SsiConfig {
    /// Physical base address of the SSI register block.
    pub ssibase: PhysAddr,
    /// TX DMA request event number.
    pub tx_dma_event: u32,
    /// TX DMA channel type (peripheral vs. shared peripheral bus).
    pub tx_dma_ctype: u32,
    /// RX DMA request event number.
    pub rx_dma_event: u32,
    /// RX DMA channel type.
    pub rx_dma_ctype: u32,
    pub sample_rate_min: u32,
    pub sample_rate_max: u32,
    pub clk_mode: ClockMode,
    /// System clock feeding the bit-clock prescaler, in Hz.
    pub sys_clk: u32,
    /// Number of capture subchannels multiplexed onto the RX DMA engine.
    pub cap_subchn: usize,
    pub voices: u32,
    /// Bytes per sample: 2 or 4.
    pub sample_size: usize,
    pub protocol: Protocol,
    /// TX on rising edge when set.
    pub xclk_pol: bool,
    /// RX on rising edge when set.
    pub rclk_pol: bool,
    /// Frame sync active high when set.
    pub xfsync_pol: bool,
    /// One bit-clock delay before the first data bit.
    pub bit_delay: bool,
    pub xfsync_len: FsyncLen,
    /// Words per frame. Defaults to the voice count.
    pub nslots: u32,
    /// Mirror streamed PCM to the diagnostic log sink.
    pub log_enabled: bool,
    pub variant: SsiVariant,
}

impl Default for SsiConfig {
    fn default() -> Self {
        let mut cfg = Self {
            ssibase: 0,
            tx_dma_event: 0,
            tx_dma_ctype: 0,
            rx_dma_event: 0,
            rx_dma_ctype: 0,
            sample_rate_min: 8000,
            sample_rate_max: 48000,
            clk_mode: ClockMode::I2sMaster,
            sys_clk: 12_288_000,
            cap_subchn: 1,
            voices: 2,
            sample_size: 2,
            protocol: Protocol::I2s,
            xclk_pol: false,
            rclk_pol: true,
            xfsync_pol: false,
            bit_delay: true,
            xfsync_len: FsyncLen::Word,
            nslots: 2,
            log_enabled: false,
            variant: SsiVariant::mx6x(),
        };
        cfg.apply_protocol_defaults();
        cfg
    }
}

impl SsiConfig {
    /// Transfer unit width in bits for the configured sample size.
    pub fn sample_bits(&self) -> u32 {
        if self.sample_size == 2 {
            16
        } else {
            32
        }
    }

    /// Reset the polarity/frame-sync flags to the chosen protocol's
    /// conventions. Called whenever `protocol` changes; individual flags may
    /// still be overridden by later options.
    pub fn apply_protocol_defaults(&mut self) {
        match self.protocol {
            Protocol::Pcm => {
                if self.clk_mode.is_normal() {
                    // Short frame sync, one valid word per frame.
                    self.xfsync_len = FsyncLen::Bit;
                    self.nslots = 1;
                } else {
                    self.xfsync_len = FsyncLen::Word;
                }
                self.xclk_pol = true;
                self.rclk_pol = true;
                self.bit_delay = false;
                self.xfsync_pol = true;
            }
            Protocol::I2s => {
                if self.clk_mode.is_normal() {
                    // Only the first slot carries data; the frame still needs
                    // at least two slots for the word-length sync.
                    self.voices = 1;
                    if self.nslots < 2 {
                        self.nslots = 2;
                    }
                }
                self.xfsync_len = FsyncLen::Word;
                self.xclk_pol = false;
                self.rclk_pol = true;
                self.bit_delay = true;
                self.xfsync_pol = false;
            }
        }
    }

    /// Parse a comma-separated `key=value` option string on top of the
    /// defaults. Unknown keys are ignored.
    pub fn parse(options: &str) -> Result<Self, SsiError> {
        let mut cfg = Self::default();

        for opt in options.split(',').filter(|o| !o.is_empty()) {
            let (key, value) = match opt.split_once('=') {
                Some((k, v)) => (k, v),
                None => (opt, ""),
            };

            match key {
                "ssibase" => cfg.ssibase = parse_num(value)?,
                "tevt" => cfg.tx_dma_event = parse_num(value)? as u32,
                "tchn" => cfg.tx_dma_ctype = parse_num(value)? as u32,
                "revt" => cfg.rx_dma_event = parse_num(value)? as u32,
                "rchn" => cfg.rx_dma_ctype = parse_num(value)? as u32,
                "rate" => {
                    let (min, max) = match value.split_once(':') {
                        Some((lo, hi)) => (parse_num(lo)? as u32, parse_num(hi)? as u32),
                        None => {
                            let r = parse_num(value)? as u32;
                            (r, r)
                        }
                    };
                    if !rate_supported(min) || !rate_supported(max) {
                        error!("unsupported sample rate {}:{}", min, max);
                        return Err(SsiError::InvalidParameter);
                    }
                    cfg.sample_rate_min = min;
                    cfg.sample_rate_max = max;
                }
                "clk_mode" => {
                    cfg.clk_mode = match value {
                        "i2s_master" => ClockMode::I2sMaster,
                        "i2s_slave" => ClockMode::I2sSlave,
                        "normal_master" => ClockMode::NormalMaster,
                        "normal_slave" => ClockMode::NormalSlave,
                        _ => {
                            error!("unsupported clock mode '{}'", value);
                            return Err(SsiError::InvalidParameter);
                        }
                    };
                }
                "sys_clk" => cfg.sys_clk = parse_num(value)? as u32,
                "capture_subchn" => {
                    let n = parse_num(value)? as usize;
                    if (1..=MAX_CAP_SUBCHN_COUNT).contains(&n) {
                        cfg.cap_subchn = n;
                    } else {
                        warn!(
                            "capture subchannel count {} out of range 1..={}, using 1",
                            n, MAX_CAP_SUBCHN_COUNT
                        );
                        cfg.cap_subchn = 1;
                    }
                }
                "voices" => {
                    let n = parse_num(value)? as u32;
                    if n == 0 {
                        error!("voices must be at least 1");
                        return Err(SsiError::InvalidParameter);
                    }
                    cfg.voices = n;
                }
                "sample_size" => {
                    cfg.sample_size = match parse_num(value)? {
                        2 | 16 => 2,
                        4 | 32 => 4,
                        n => {
                            error!("invalid sample size {}", n);
                            return Err(SsiError::InvalidParameter);
                        }
                    };
                }
                "protocol" => {
                    cfg.protocol = match value {
                        "i2s" => Protocol::I2s,
                        "pcm" => Protocol::Pcm,
                        _ => {
                            error!("unsupported protocol '{}'", value);
                            return Err(SsiError::InvalidParameter);
                        }
                    };
                    cfg.apply_protocol_defaults();
                }
                "xclk_pol" => cfg.xclk_pol = parse_flag(value)?,
                "rclk_pol" => cfg.rclk_pol = parse_flag(value)?,
                "xfsync_pol" => cfg.xfsync_pol = parse_flag(value)?,
                "bit_delay" => cfg.bit_delay = parse_flag(value)?,
                "xfsync_size" => {
                    cfg.xfsync_len = match value {
                        "bit" => FsyncLen::Bit,
                        "word" => FsyncLen::Word,
                        _ => {
                            error!("unsupported frame sync length '{}'", value);
                            return Err(SsiError::InvalidParameter);
                        }
                    };
                }
                "nslots" => {
                    if !value.is_empty() {
                        let n = parse_num(value)? as u32;
                        if n == 0 {
                            error!("nslots must be at least 1");
                            return Err(SsiError::InvalidParameter);
                        }
                        cfg.nslots = n;
                    }
                }
                "debug" => cfg.log_enabled = true,
                "variant" => {
                    cfg.variant = match value {
                        "mx6x" => SsiVariant::mx6x(),
                        "mx53" => SsiVariant::mx53(),
                        "legacy" => SsiVariant::legacy(),
                        _ => {
                            error!("unsupported variant '{}'", value);
                            return Err(SsiError::InvalidParameter);
                        }
                    };
                }
                _ => debug!("ignoring unknown option '{}'", key),
            }
        }

        if !cfg.clk_mode.is_master() && cfg.sample_rate_min != cfg.sample_rate_max {
            error!("slave mode must be locked down to a single rate");
            return Err(SsiError::InvalidParameter);
        }

        if cfg.clk_mode.is_normal() {
            // Only the first slot of a normal-mode frame carries valid data.
            cfg.voices = 1;
        }

        Ok(cfg)
    }
}

fn parse_num(value: &str) -> Result<u64, SsiError> {
    let res = if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        value.parse()
    };
    res.map_err(|_| {
        error!("invalid numeric option value '{}'", value);
        SsiError::InvalidParameter
    })
}

fn parse_flag(value: &str) -> Result<bool, SsiError> {
    match parse_num(value)? {
        0 => Ok(false),
        1 => Ok(true),
        n => {
            error!("flag option must be 0 or 1, got {}", n);
            Err(SsiError::InvalidParameter)
        }
    }
}
