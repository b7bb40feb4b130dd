//! The SSI hardware context and every operation on it.
//!
//! One [`MxSsi`] instance owns the register block, the two DMA channels and
//! all stream state for a single SSI port. Client calls (acquire, release,
//! prepare, trigger), the FIFO error interrupt and the DMA completion
//! handlers all serialize on one internal lock; no operation is asynchronous
//! from the caller's point of view.

use alloc::boxed::Box;
use core::ptr::NonNull;

use spin::Mutex;
use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};

use crate::{
    config::{rate_supported, SsiConfig},
    dma::{build_dma_options, AttachMode, DmaChannel, DmaDriver, DmaTransfer},
    osal::{bounded_poll, MemoryBuffer, Osal},
    registers::{CCR, SCR, SFCSR, SIER, SISR, SLOT_0_1, SLOT_MASK_ALL, SOR, SRCR,
        SRX0_OFFSET, SsiRegisters, STCR, STX0_OFFSET},
    stream::{num_open_capture, CaptureStream, PlaybackStream},
    Direction, EventSink, PcmLog, SsiError, FIFO_WATERMARK, MAX_CAP_SUBCHN_COUNT,
    TX_FIFO_PREFILL,
};

const POLL_LIMIT: u32 = 1000;
const POLL_STEP_US: u32 = 1;

/// Stream trigger command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Go,
    Stop,
}

/// Buffer geometry and rate of an acquire request.
#[derive(Debug, Clone, Copy)]
pub struct AcquireParams {
    pub rate: u32,
    /// Total ring size in bytes, a multiple of `frag_size`.
    pub buf_size: usize,
    pub frag_size: usize,
}

/// Result of a capability query for one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// A free (sub)channel exists for this direction.
    pub available: bool,
    pub min_rate: u32,
    pub max_rate: u32,
}

/// Speaker position of one interleaved voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPosition {
    Mono,
    FrontLeft,
    FrontRight,
    RearLeft,
    RearRight,
}

/// Mutable hardware and stream state, all behind the device lock.
struct SsiHw {
    /// Rate currently programmed into the bit-clock prescaler. Shared by
    /// both directions.
    sample_rate: u32,
    play: PlaybackStream,
    cap: [CaptureStream; MAX_CAP_SUBCHN_COUNT],
    /// Which ping-pong half the next capture completion refers to.
    frag_index: u32,
    /// Shared hardware-filled capture buffer, multi-subchannel mode only.
    capture_buf: Option<MemoryBuffer>,
    capture_buf_size: usize,
    /// Pending shrink of the shared buffer, applied at the next pong
    /// boundary so the DMA engine is never reprogrammed mid-pass.
    capture_buf_size_mod: usize,
    capture_xfer: Option<DmaTransfer>,
    play_log_open: bool,
    cap_log_open: bool,
}

/// Driver context for one SSI port.
pub struct MxSsi<O: Osal> {
    regs: SsiRegisters,
    cfg: SsiConfig,
    osal: O,
    dma: Box<dyn DmaDriver>,
    sink: Box<dyn EventSink>,
    pcm_log: Option<Box<dyn PcmLog>>,
    play_chn: DmaChannel,
    cap_chn: DmaChannel,
    hw: Mutex<SsiHw>,
}

unsafe impl<O: Osal + Send> Send for MxSsi<O> {}
unsafe impl<O: Osal + Send + Sync> Sync for MxSsi<O> {}

impl<O: Osal> MxSsi<O> {
    /// Attach the driver: bring up the DMA service, attach one channel per
    /// direction and run the full register init sequence.
    ///
    /// `base` is the virtual mapping of the register block whose physical
    /// address is `cfg.ssibase`. Failures unwind in reverse order.
    ///
    /// # Safety
    ///
    /// `base` must be a valid uncached mapping of the SSI register file,
    /// valid for the lifetime of the returned device.
    pub unsafe fn attach(
        base: NonNull<u8>,
        cfg: SsiConfig,
        osal: O,
        dma: Box<dyn DmaDriver>,
        sink: Box<dyn EventSink>,
        pcm_log: Option<Box<dyn PcmLog>>,
    ) -> Result<Self, SsiError> {
        dma.init()?;
        let info = dma.driver_info();

        // The playback channel loops over its scatter list autonomously;
        // capture loops only when a single subchannel consumes it.
        let play_opts =
            build_dma_options(cfg.ssibase + STX0_OFFSET, cfg.tx_dma_event, FIFO_WATERMARK, 1);
        debug!("playback dma options: {}", play_opts);
        let play_chn = match dma.channel_attach(
            &play_opts,
            Direction::Playback,
            cfg.tx_dma_ctype,
            info.max_priority,
            AttachMode::EventPerSegment,
        ) {
            Ok(chn) => chn,
            Err(e) => {
                error!("playback dma channel attach failed: {}", e);
                dma.fini();
                return Err(e);
            }
        };

        let cap_opts = build_dma_options(
            cfg.ssibase + SRX0_OFFSET,
            cfg.rx_dma_event,
            FIFO_WATERMARK,
            cfg.cap_subchn,
        );
        debug!("capture dma options: {}", cap_opts);
        let cap_chn = match dma.channel_attach(
            &cap_opts,
            Direction::Capture,
            cfg.rx_dma_ctype,
            info.max_priority,
            AttachMode::EventPerSegment,
        ) {
            Ok(chn) => chn,
            Err(e) => {
                error!("capture dma channel attach failed: {}", e);
                dma.channel_release(play_chn);
                dma.fini();
                return Err(e);
            }
        };

        let dev = Self {
            regs: SsiRegisters::new(base),
            cfg,
            osal,
            dma,
            sink,
            pcm_log,
            play_chn,
            cap_chn,
            hw: Mutex::new(SsiHw {
                sample_rate: 0,
                play: PlaybackStream::default(),
                cap: Default::default(),
                frag_index: 0,
                capture_buf: None,
                capture_buf_size: 0,
                capture_buf_size_mod: 0,
                capture_xfer: None,
                play_log_open: false,
                cap_log_open: false,
            }),
        };

        {
            let mut hw = dev.hw.lock();
            dev.ssi_init(&mut hw);
        }
        info!("ssi at {:#x} attached", dev.cfg.ssibase);
        Ok(dev)
    }

    pub fn config(&self) -> &SsiConfig {
        &self.cfg
    }

    /// Availability and rate window for one direction. When the device is
    /// rate-locked master and the opposite direction is active, the window
    /// narrows to the programmed rate.
    pub fn capabilities(&self, direction: Direction) -> Capabilities {
        let hw = self.hw.lock();
        let rate_range = self.cfg.sample_rate_min != self.cfg.sample_rate_max;
        let mut caps = Capabilities {
            available: true,
            min_rate: self.cfg.sample_rate_min,
            max_rate: self.cfg.sample_rate_max,
        };
        match direction {
            Direction::Playback => {
                if hw.play.acquired {
                    caps.available = false;
                } else if self.cfg.clk_mode.is_master()
                    && rate_range
                    && num_open_capture(&hw.cap) != 0
                {
                    caps.min_rate = hw.sample_rate;
                    caps.max_rate = hw.sample_rate;
                }
            }
            Direction::Capture => {
                if num_open_capture(&hw.cap) == self.cfg.cap_subchn {
                    caps.available = false;
                } else if rate_range && hw.play.acquired {
                    caps.min_rate = hw.sample_rate;
                    caps.max_rate = hw.sample_rate;
                }
            }
        }
        caps
    }

    /// Fixed speaker map for the configured voice count. Playback and
    /// capture share the same wiring.
    pub fn channel_map(&self) -> Option<&'static [ChannelPosition]> {
        use ChannelPosition::*;
        match self.cfg.voices {
            1 => Some(&[Mono]),
            2 => Some(&[FrontLeft, FrontRight]),
            4 => Some(&[FrontLeft, FrontRight, RearLeft, RearRight]),
            _ => None,
        }
    }

    pub fn playback_acquire(&self, params: &AcquireParams) -> Result<(), SsiError> {
        let mut hw = self.hw.lock();
        if hw.play.acquired {
            return Err(SsiError::Busy);
        }
        let capture_active = num_open_capture(&hw.cap) > 0;
        self.check_rate_switch(&mut hw, params.rate, capture_active)?;

        let buf = self.osal.shm_alloc(params.buf_size)?;
        let xfer = DmaTransfer::from_buffer(&buf, params.frag_size, self.cfg.sample_bits());
        if let Err(e) = self.dma.setup_xfer(self.play_chn, &xfer) {
            error!("playback dma setup failed: {}", e);
            self.osal.shm_free(buf);
            return Err(e);
        }

        hw.play.buf = Some(buf);
        hw.play.frag_size = params.frag_size;
        hw.play.acquired = true;
        hw.play.completed_frag = 0;
        Ok(())
    }

    pub fn playback_release(&self) {
        let mut hw = self.hw.lock();
        hw.play.acquired = false;
        hw.play.go = false;
        if let Some(buf) = hw.play.buf.take() {
            self.osal.shm_free(buf);
        }
    }

    /// The playback ring the client writes into, valid between acquire and
    /// release.
    pub fn playback_buffer(&self) -> Option<MemoryBuffer> {
        self.hw.lock().play.buf
    }

    /// Acquire a capture subchannel, returning its index.
    ///
    /// With a single configured subchannel the client ring is the DMA target
    /// itself. With several, the first acquire also allocates the shared
    /// hardware ping-pong buffer and registers it with the DMA engine; later
    /// acquires only get a private ring served by the fan-out copier.
    pub fn capture_acquire(&self, params: &AcquireParams) -> Result<usize, SsiError> {
        let mut hw = self.hw.lock();
        let idx = match hw.cap[..self.cfg.cap_subchn].iter().position(|s| !s.acquired) {
            Some(idx) => idx,
            None => return Err(SsiError::Busy),
        };

        let playback_active = hw.play.acquired;
        self.check_rate_switch(&mut hw, params.rate, playback_active)?;

        if self.cfg.cap_subchn == 1 {
            let buf = self.osal.shm_alloc(params.buf_size)?;
            let xfer = DmaTransfer::from_buffer(&buf, params.frag_size, self.cfg.sample_bits());
            if let Err(e) = self.dma.setup_xfer(self.cap_chn, &xfer) {
                error!("capture dma setup failed: {}", e);
                self.osal.shm_free(buf);
                return Err(e);
            }
            let strm = &mut hw.cap[0];
            strm.buf = Some(buf);
            strm.frag_size = params.frag_size;
            strm.offset = 0;
            strm.acquired = true;
            strm.completed_frag = 0;
            return Ok(0);
        }

        // Multi-subchannel: private client ring first.
        let client_buf = self.osal.shm_alloc(params.buf_size)?;

        // A smaller ring than the shared buffer shrinks the shared buffer at
        // the next pong boundary, so the slowest consumer still sees whole
        // fragments.
        if hw.capture_buf.is_some() && params.buf_size < hw.capture_buf_size {
            hw.capture_buf_size_mod = params.buf_size;
        }

        if num_open_capture(&hw.cap) == 0 {
            let shared = match self.osal.shm_alloc(params.buf_size) {
                Ok(b) => b,
                Err(e) => {
                    self.osal.shm_free(client_buf);
                    return Err(e);
                }
            };
            let xfer =
                DmaTransfer::from_buffer(&shared, params.buf_size / 2, self.cfg.sample_bits());
            if let Err(e) = self.dma.setup_xfer(self.cap_chn, &xfer) {
                error!("capture dma setup failed: {}", e);
                self.osal.shm_free(shared);
                self.osal.shm_free(client_buf);
                return Err(e);
            }
            hw.capture_buf = Some(shared);
            hw.capture_buf_size = params.buf_size;
            hw.capture_buf_size_mod = params.buf_size;
            hw.capture_xfer = Some(xfer);
            hw.frag_index = 0;
        }

        let strm = &mut hw.cap[idx];
        strm.buf = Some(client_buf);
        strm.frag_size = params.frag_size;
        strm.offset = 0;
        strm.acquired = true;
        strm.completed_frag = 0;
        Ok(idx)
    }

    pub fn capture_release(&self, subchn: usize) {
        let mut hw = self.hw.lock();
        if subchn >= MAX_CAP_SUBCHN_COUNT {
            return;
        }
        hw.cap[subchn].acquired = false;
        hw.cap[subchn].go = false;
        if let Some(buf) = hw.cap[subchn].buf.take() {
            self.osal.shm_free(buf);
        }
        if self.cfg.cap_subchn > 1 && num_open_capture(&hw.cap) == 0 {
            if let Some(shared) = hw.capture_buf.take() {
                self.osal.shm_free(shared);
            }
            hw.capture_xfer = None;
            hw.capture_buf_size = 0;
            hw.capture_buf_size_mod = 0;
        }
    }

    pub fn capture_buffer(&self, subchn: usize) -> Option<MemoryBuffer> {
        self.hw.lock().cap.get(subchn).and_then(|s| s.buf)
    }

    /// Reset fragment bookkeeping ahead of a trigger. On explicit-drain
    /// variants a capture prepare also empties the RX FIFOs by reading, so a
    /// new session never sees residue from the previous one.
    pub fn prepare(&self, direction: Direction, subchn: usize) {
        let mut hw = self.hw.lock();
        match direction {
            Direction::Playback => {
                hw.play.completed_frag = 0;
            }
            Direction::Capture => {
                if let Some(strm) = hw.cap.get_mut(subchn) {
                    strm.completed_frag = 0;
                    strm.offset = 0;
                }
                if self.cfg.variant.explicit_drain {
                    self.drain_rx_fifos();
                }
            }
        }
    }

    pub fn playback_trigger(&self, cmd: Trigger) -> Result<(), SsiError> {
        let mut hw = self.hw.lock();
        if !hw.play.acquired {
            return Ok(());
        }
        let mut result = Ok(());

        match cmd {
            Trigger::Go => {
                if self.cfg.log_enabled {
                    if let Some(log) = &self.pcm_log {
                        hw.play_log_open = log.open(Direction::Playback);
                    }
                }

                if !self.cfg.variant.explicit_drain {
                    self.regs.sor.modify(SOR::TX_CLR::SET);
                }

                if let Err(e) = self.dma.xfer_start(self.play_chn) {
                    error!("playback dma start failed: {}", e);
                    result = Err(e);
                }

                // Let DMA bring the FIFO up to the prefill level before the
                // transmitter starts draining it.
                if bounded_poll(&self.osal, POLL_LIMIT, POLL_STEP_US, || {
                    self.regs.tx_fifo0_count() >= TX_FIFO_PREFILL
                })
                .is_err()
                {
                    error!("tx fifo0 did not fill");
                }
                if self.cfg.variant.dual_fifo {
                    if bounded_poll(&self.osal, POLL_LIMIT, POLL_STEP_US, || {
                        self.regs.tx_fifo1_count() >= TX_FIFO_PREFILL
                    })
                    .is_err()
                    {
                        error!("tx fifo1 did not fill");
                    }
                    self.regs.sisr.write(SISR::TUE0::SET + SISR::TUE1::SET);
                    self.regs
                        .sier
                        .modify(SIER::TIE::SET + SIER::TUE0IE::SET + SIER::TUE1IE::SET);
                } else {
                    self.regs.sisr.write(SISR::TUE0::SET);
                    self.regs.sier.modify(SIER::TIE::SET + SIER::TUE0IE::SET);
                }

                self.regs.scr.modify(SCR::TE::SET);
                hw.play.go = true;
            }
            Trigger::Stop => {
                self.regs
                    .sier
                    .modify(SIER::TIE::CLEAR + SIER::TUE0IE::CLEAR + SIER::TUE1IE::CLEAR);

                if let Err(e) = self.dma.xfer_abort(self.play_chn) {
                    error!("playback dma stop failed: {}", e);
                    result = Err(e);
                }

                if self.cfg.variant.explicit_drain {
                    self.disable_tx_on_empty();
                } else {
                    self.regs.scr.modify(SCR::TE::CLEAR);
                }

                if hw.play_log_open {
                    if let Some(log) = &self.pcm_log {
                        log.close(Direction::Playback);
                    }
                    hw.play_log_open = false;
                }
                hw.play.go = false;
            }
        }
        result
    }

    pub fn capture_trigger(&self, subchn: usize, cmd: Trigger) -> Result<(), SsiError> {
        let mut hw = self.hw.lock();
        if subchn >= MAX_CAP_SUBCHN_COUNT || !hw.cap[subchn].acquired {
            return Ok(());
        }
        let mut result = Ok(());
        let running = hw.cap.iter().filter(|s| s.go).count();

        match cmd {
            Trigger::Go => {
                // Only the first running subchannel touches the hardware;
                // later ones just join the fan-out.
                if !hw.cap[subchn].go && running == 0 {
                    if self.cfg.log_enabled {
                        if let Some(log) = &self.pcm_log {
                            hw.cap_log_open = log.open(Direction::Capture);
                        }
                    }

                    if !self.cfg.variant.explicit_drain {
                        self.regs.sor.modify(SOR::RX_CLR::SET);
                    }
                    let residue = self.regs.rx_fifo0_count();
                    if residue != 0 {
                        error!("rx fifo0 not empty - {}", residue);
                    }
                    if self.cfg.variant.dual_fifo {
                        let residue = self.regs.rx_fifo1_count();
                        if residue != 0 {
                            error!("rx fifo1 not empty - {}", residue);
                        }
                    }

                    if let Err(e) = self.dma.xfer_start(self.cap_chn) {
                        error!("capture dma start failed: {}", e);
                        result = Err(e);
                    }

                    if self.cfg.variant.dual_fifo {
                        self.regs.sisr.write(SISR::ROE0::SET + SISR::ROE1::SET);
                        self.regs
                            .sier
                            .modify(SIER::RIE::SET + SIER::ROE0IE::SET + SIER::ROE1IE::SET);
                    } else {
                        self.regs.sisr.write(SISR::ROE0::SET);
                        self.regs.sier.modify(SIER::RIE::SET + SIER::ROE0IE::SET);
                    }
                    self.regs.scr.modify(SCR::RE::SET);
                }
                hw.cap[subchn].go = true;
            }
            Trigger::Stop => {
                let was_running = hw.cap[subchn].go;
                hw.cap[subchn].go = false;
                if was_running && running == 1 {
                    self.regs.scr.modify(SCR::RE::CLEAR);
                    self.regs
                        .sier
                        .modify(SIER::RIE::CLEAR + SIER::ROE0IE::CLEAR + SIER::ROE1IE::CLEAR);

                    if let Err(e) = self.dma.xfer_abort(self.cap_chn) {
                        error!("capture dma stop failed: {}", e);
                        result = Err(e);
                    }

                    if self.cfg.variant.explicit_drain {
                        if bounded_poll(&self.osal, POLL_LIMIT, POLL_STEP_US, || {
                            self.regs.sisr.is_set(SISR::RFRC)
                        })
                        .is_err()
                        {
                            error!("rx disable failed - {:#x}", self.regs.sisr.get());
                        }
                        self.regs.sisr.write(SISR::RFRC::SET);
                    }

                    if hw.cap_log_open {
                        if let Some(log) = &self.pcm_log {
                            log.close(Direction::Capture);
                        }
                        hw.cap_log_open = false;
                    }
                }
            }
        }
        result
    }

    /// Bytes into the current fragment, from the DMA engine's residue
    /// counter. Resolution depends on what the engine reports.
    pub fn position(&self, direction: Direction) -> usize {
        let hw = self.hw.lock();
        let (chn, frag) = match direction {
            Direction::Playback => (self.play_chn, hw.play.frag_size),
            Direction::Capture => (self.cap_chn, hw.cap[0].frag_size),
        };
        frag.saturating_sub(self.dma.bytes_left(chn))
    }

    /// FIFO error interrupt: log and clear every asserted condition.
    /// Recovery is left to whoever watches the log stream.
    pub fn fifo_interrupt(&self) {
        let _hw = self.hw.lock();
        let sisr = &self.regs.sisr;

        if sisr.is_set(SISR::ROE0) {
            error!("rx fifo0 overrun ({:#x})", sisr.get());
            sisr.write(SISR::ROE0::SET);
        }
        if sisr.is_set(SISR::ROE1) {
            error!("rx fifo1 overrun ({:#x})", sisr.get());
            sisr.write(SISR::ROE1::SET);
        }
        if sisr.is_set(SISR::TUE0) {
            error!("tx fifo0 underrun ({:#x})", sisr.get());
            sisr.write(SISR::TUE0::SET);
        }
        if sisr.is_set(SISR::TUE1) {
            error!("tx fifo1 underrun ({:#x})", sisr.get());
            sisr.write(SISR::TUE1::SET);
        }
        if self.regs.sier.is_set(SIER::RFSIE) && sisr.is_set(SISR::RFS) {
            error!("rx frame sync error ({:#x})", sisr.get());
            sisr.write(SISR::RFS::SET);
        }
        if self.regs.sier.is_set(SIER::TFSIE) && sisr.is_set(SISR::TFS) {
            error!("tx frame sync error ({:#x})", sisr.get());
            sisr.write(SISR::TFS::SET);
        }
    }

    /// Playback DMA completion: mirror the finished fragment to the PCM log
    /// and notify the client.
    pub fn playback_complete(&self) {
        let mut hw = self.hw.lock();
        if !hw.play.acquired {
            return;
        }
        if hw.play_log_open {
            let offset = hw.play.next_log_offset();
            if let (Some(buf), Some(log)) = (hw.play.buf, &self.pcm_log) {
                let data = unsafe { &buf.as_slice()[offset..offset + hw.play.frag_size] };
                log.write(Direction::Playback, data);
            }
        }
        let frag = hw.play.frag_size;
        self.sink.fragment_done(Direction::Playback, 0, frag);
    }

    /// Capture DMA completion.
    ///
    /// Single-subchannel mode notifies the client directly. Multi-subchannel
    /// mode runs the ping-pong dance: fan the just-filled half out to every
    /// running subchannel, and on the pong half first apply any pending
    /// shared-buffer shrink and re-arm the engine for the next pass.
    pub fn capture_complete(&self) {
        let mut hw = self.hw.lock();

        if self.cfg.cap_subchn == 1 {
            if !hw.cap[0].acquired {
                return;
            }
            if hw.cap_log_open {
                let offset = hw.cap[0].next_log_offset();
                if let (Some(buf), Some(log)) = (hw.cap[0].buf, &self.pcm_log) {
                    let data = unsafe { &buf.as_slice()[offset..offset + hw.cap[0].frag_size] };
                    log.write(Direction::Capture, data);
                }
            }
            let frag = hw.cap[0].frag_size;
            self.sink.fragment_done(Direction::Capture, 0, frag);
            return;
        }

        let shared = match hw.capture_buf {
            Some(buf) => buf,
            None => return,
        };
        let half = hw.capture_buf_size / 2;
        if half == 0 {
            return;
        }

        if hw.frag_index == 1 {
            // Next pass starts at the top of the ping-pong buffer, so this
            // is the only safe point to change its geometry.
            if hw.capture_buf_size_mod != hw.capture_buf_size {
                let xfer = DmaTransfer::from_buffer(
                    &MemoryBuffer {
                        size: hw.capture_buf_size_mod,
                        ..shared
                    },
                    hw.capture_buf_size_mod / 2,
                    self.cfg.sample_bits(),
                );
                hw.capture_xfer = Some(xfer);
            }
            if let Some(xfer) = &hw.capture_xfer {
                let _ = self.dma.xfer_complete(self.cap_chn);
                let _ = self.dma.setup_xfer(self.cap_chn, xfer);
                if let Err(e) = self.dma.xfer_start(self.cap_chn) {
                    error!("capture dma re-arm failed: {}", e);
                }
            }
            hw.frag_index = 0;

            let pong = unsafe { &shared.as_slice()[half..half * 2] };
            if hw.cap_log_open {
                if let Some(log) = &self.pcm_log {
                    log.write(Direction::Capture, pong);
                }
            }
            self.fan_out(&mut hw, pong);

            if hw.capture_buf_size_mod != hw.capture_buf_size {
                hw.capture_buf_size = hw.capture_buf_size_mod;
            }
        } else {
            hw.frag_index = 1;
            let ping = unsafe { &shared.as_slice()[..half] };
            if hw.cap_log_open {
                if let Some(log) = &self.pcm_log {
                    log.write(Direction::Capture, ping);
                }
            }
            self.fan_out(&mut hw, ping);
        }
    }

    fn fan_out(&self, hw: &mut SsiHw, chunk: &[u8]) {
        for (idx, strm) in hw.cap.iter_mut().enumerate().take(self.cfg.cap_subchn) {
            strm.deliver_chunk(chunk, self.sink.as_ref(), idx);
        }
    }

    /// Rate-lock check shared by both directions: while the opposite
    /// direction is active the programmed rate is fixed; otherwise a
    /// differing request reprograms the shared prescaler.
    fn check_rate_switch(
        &self,
        hw: &mut SsiHw,
        rate: u32,
        other_active: bool,
    ) -> Result<(), SsiError> {
        if !self.cfg.clk_mode.is_master() || self.cfg.sample_rate_min == self.cfg.sample_rate_max {
            return Ok(());
        }
        if rate == hw.sample_rate {
            return Ok(());
        }
        if other_active {
            return Err(SsiError::RateConflict);
        }
        if !rate_supported(rate) {
            return Err(SsiError::InvalidParameter);
        }
        self.set_clock_rate(hw, rate);
        Ok(())
    }

    /// Reprogram the shared bit-clock prescaler. The SSI must be disabled
    /// while PM changes.
    fn set_clock_rate(&self, hw: &mut SsiHw, rate: u32) {
        self.regs
            .scr
            .modify(SCR::SSIEN::CLEAR + SCR::TE::CLEAR + SCR::RE::CLEAR);

        hw.sample_rate = rate;
        if self.cfg.clk_mode.is_master() {
            let f_bit_clk = if !self.cfg.clk_mode.is_normal() {
                // I2S master fixes the slot at 32 bits; WL only selects the
                // valid data bits.
                self.regs.scr.modify(SCR::I2S_MODE::Master);
                rate * self.cfg.voices * 32
            } else {
                // Normal mode frames are nslots words of the configured
                // word length.
                self.regs.scr.modify(SCR::I2S_MODE::Normal);
                rate * self.cfg.nslots * self.cfg.sample_bits()
            };
            let div = self.cfg.sys_clk / f_bit_clk / 2;
            if div == 0 {
                error!(
                    "sys_clk {} cannot source a {} Hz bit clock",
                    self.cfg.sys_clk, f_bit_clk
                );
            }
            self.regs.stccr.modify(CCR::PM.val(div.saturating_sub(1)));
            self.regs.stcr.modify(STCR::TFDIR::SET + STCR::TXDIR::SET);
        } else {
            if !self.cfg.clk_mode.is_normal() {
                self.regs.scr.modify(SCR::I2S_MODE::Slave);
            }
            self.regs.stcr.modify(STCR::TFDIR::CLEAR + STCR::TXDIR::CLEAR);
        }

        self.regs.scr.modify(SCR::SSIEN::SET);

        if self.cfg.variant.explicit_drain {
            // Kick the transmitter once so the new divider takes; drain it
            // back down before returning.
            self.regs.scr.modify(SCR::TE::SET);
            self.disable_tx_on_empty();
        }
        debug!("ssi clock programmed for {} Hz", rate);
    }

    /// Full register bring-up, run once at attach.
    fn ssi_init(&self, hw: &mut SsiHw) {
        let regs = &self.regs;
        let cfg = &self.cfg;

        regs.scr.set(0);

        regs.stmsk.set(SLOT_MASK_ALL);
        regs.srmsk.set(SLOT_MASK_ALL);

        regs.sier.set(0);

        regs.stcr.modify(STCR::TFEN0::CLEAR + STCR::TFEN1::CLEAR);
        regs.srcr.modify(SRCR::RFEN0::CLEAR + SRCR::RFEN1::CLEAR);

        // Clock idle state high, TX and RX share clocks.
        regs.scr.write(SCR::CLK_IST::SET + SCR::SYN::SET);
        if cfg.variant.explicit_drain {
            regs.scr.modify(SCR::SYNC_TX_FS::SET);
        }

        if cfg.xclk_pol {
            regs.stcr.modify(STCR::TSCKP::CLEAR);
        } else {
            regs.stcr.modify(STCR::TSCKP::SET);
        }
        if cfg.rclk_pol {
            regs.srcr.modify(SRCR::RSCKP::SET);
        } else {
            regs.srcr.modify(SRCR::RSCKP::CLEAR);
        }

        if cfg.xfsync_len == crate::config::FsyncLen::Bit {
            regs.stcr.modify(STCR::TFSL::SET);
            regs.srcr.modify(SRCR::RFSL::SET);
        } else {
            regs.stcr.modify(STCR::TFSL::CLEAR);
            regs.srcr.modify(SRCR::RFSL::CLEAR);
        }

        if cfg.xfsync_pol {
            regs.stcr.modify(STCR::TFSI::CLEAR);
            regs.srcr.modify(SRCR::RFSI::CLEAR);
        } else {
            regs.stcr.modify(STCR::TFSI::SET);
            regs.srcr.modify(SRCR::RFSI::SET);
        }

        if cfg.bit_delay {
            regs.stcr.modify(STCR::TEFS::SET);
            regs.srcr.modify(SRCR::REFS::SET);
        } else {
            regs.stcr.modify(STCR::TEFS::CLEAR);
            regs.srcr.modify(SRCR::REFS::CLEAR);
        }

        // Bypass the divide-by-2 and divide-by-8 prescalers.
        regs.stccr.modify(CCR::DIV2::CLEAR + CCR::PSR::CLEAR);
        regs.srccr.modify(CCR::DIV2::CLEAR + CCR::PSR::CLEAR);

        let wl = if cfg.sample_size == 2 {
            CCR::WL::Bits16
        } else {
            CCR::WL::Bits24
        };
        regs.stccr.modify(wl);
        regs.srccr.modify(wl);

        regs.stccr.modify(CCR::DC.val(cfg.nslots - 1));
        regs.srccr.modify(CCR::DC.val(cfg.nslots - 1));

        regs.sfcsr.modify(
            SFCSR::TFWM0.val(FIFO_WATERMARK)
                + SFCSR::TFWM1.val(FIFO_WATERMARK)
                + SFCSR::RFWM0.val(FIFO_WATERMARK)
                + SFCSR::RFWM1.val(FIFO_WATERMARK),
        );

        regs.sier.modify(SIER::TDMAE::SET + SIER::RDMAE::SET);

        if cfg.variant.dual_fifo {
            // Dual FIFO / two channel mode.
            regs.scr.modify(SCR::TCH_EN::SET);
            regs.stcr.modify(STCR::TFEN0::SET + STCR::TFEN1::SET);
            regs.srcr.modify(SRCR::RFEN0::SET + SRCR::RFEN1::SET);
        } else {
            regs.stcr.modify(STCR::TFEN0::SET);
            regs.srcr.modify(SRCR::RFEN0::SET);
        }

        // Unmask the first two time slots.
        regs.stmsk.set(regs.stmsk.get() & !SLOT_0_1);
        regs.srmsk.set(regs.srmsk.get() & !SLOT_0_1);

        // Programs the prescaler and enables the SSI.
        self.set_clock_rate(hw, cfg.sample_rate_max);
    }

    /// Wait for the TX FIFOs and shift register to run dry, then disable the
    /// transmitter. Bounded and non-fatal on timeout.
    fn disable_tx_on_empty(&self) {
        if bounded_poll(&self.osal, POLL_LIMIT, POLL_STEP_US, || {
            self.regs.tx_fifo0_count() == 0
        })
        .is_err()
        {
            error!("tx fifo0 failed to empty ({})", self.regs.tx_fifo0_count());
        }
        if bounded_poll(&self.osal, POLL_LIMIT, POLL_STEP_US, || {
            self.regs.sisr.is_set(SISR::TUE0)
        })
        .is_err()
        {
            error!("tx shift register 0 failed to empty, sisr = {:#x}", self.regs.sisr.get());
        }

        if self.cfg.variant.dual_fifo {
            if bounded_poll(&self.osal, POLL_LIMIT, POLL_STEP_US, || {
                self.regs.tx_fifo1_count() == 0
            })
            .is_err()
            {
                error!("tx fifo1 failed to empty ({})", self.regs.tx_fifo1_count());
            }
            if bounded_poll(&self.osal, POLL_LIMIT, POLL_STEP_US, || {
                self.regs.sisr.is_set(SISR::TUE1)
            })
            .is_err()
            {
                error!("tx shift register 1 failed to empty, sisr = {:#x}", self.regs.sisr.get());
            }
        }

        self.regs.scr.modify(SCR::TE::CLEAR);
        // The drain necessarily ends in an underrun; clear it.
        self.regs.sisr.write(SISR::TUE0::SET + SISR::TUE1::SET);
    }

    /// Empty the RX FIFOs by reading, logging any residue that will not
    /// clear.
    fn drain_rx_fifos(&self) {
        while self.regs.rx_fifo0_count() != 0 {
            let _ = self.regs.srx0.get();
        }
        let residue = self.regs.rx_fifo0_count();
        if residue != 0 {
            error!("rx fifo0 not empty after drain - {}", residue);
        }
        if self.cfg.variant.dual_fifo {
            while self.regs.rx_fifo1_count() != 0 {
                let _ = self.regs.srx1.get();
            }
            let residue = self.regs.rx_fifo1_count();
            if residue != 0 {
                error!("rx fifo1 not empty after drain - {}", residue);
            }
        }
    }
}

impl<O: Osal> Drop for MxSsi<O> {
    fn drop(&mut self) {
        let mut hw = self.hw.lock();
        if let Some(buf) = hw.play.buf.take() {
            self.osal.shm_free(buf);
        }
        for strm in hw.cap.iter_mut() {
            if let Some(buf) = strm.buf.take() {
                self.osal.shm_free(buf);
            }
        }
        if let Some(shared) = hw.capture_buf.take() {
            self.osal.shm_free(shared);
        }
        drop(hw);
        self.dma.channel_release(self.cap_chn);
        self.dma.channel_release(self.play_chn);
        self.dma.fini();
        info!("ssi at {:#x} detached", self.cfg.ssibase);
    }
}
