use core::ptr::NonNull;
use std::time::Duration;

use log::{debug, trace, warn};
use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::registers::{ReadOnly, ReadWrite};

use sdmmc_protocol::sdmmc::mmc_struct::{MmcBusWidth, MmcTiming};
use sdmmc_protocol::sdmmc::sdmmc_capability::*;
use sdmmc_protocol::sdmmc::{
    CmdStatus, HostInfo, MmcBusMode, MmcData, MmcDataFlag, MmcIos, MmcPowerMode,
    MmcSignalVoltage, SdmmcCmd, SdmmcError, MMC_RSP_R1,
};
use sdmmc_protocol::sdmmc_os::{poll_wait, Deadline, POLL_INTERVAL};
use sdmmc_protocol::sdmmc_traits::{
    HostEvent, HostEventOutcome, MmcPowerState, SdmmcHardware,
};

// Transfer mode register bits
const XFER_DMA_EN: u16 = 1 << 0;
const XFER_BLOCK_COUNT_EN: u16 = 1 << 1;
const XFER_AUTO_CMD12: u16 = 1 << 2;
const XFER_READ: u16 = 1 << 4;
const XFER_MULTI_BLOCK: u16 = 1 << 5;

// Command register bits
const CMD_RESP_NONE: u16 = 0b00;
const CMD_RESP_136: u16 = 0b01;
const CMD_RESP_48: u16 = 0b10;
const CMD_RESP_48_BUSY: u16 = 0b11;
const CMD_CRC_CHECK: u16 = 1 << 3;
const CMD_INDEX_CHECK: u16 = 1 << 4;
const CMD_DATA_PRESENT: u16 = 1 << 5;

// Present state register bits
const PSTATE_CMD_INHIBIT: u32 = 1 << 0;
const PSTATE_DAT_INHIBIT: u32 = 1 << 1;
const PSTATE_BUF_READ_EN: u32 = 1 << 11;
const PSTATE_CARD_INSERTED: u32 = 1 << 16;

// Host control 1 bits
const HCTL1_4BIT: u8 = 1 << 1;
const HCTL1_HIGH_SPEED: u8 = 1 << 2;
const HCTL1_DMA_SDMA: u8 = 0 << 3;
const HCTL1_8BIT: u8 = 1 << 5;

// Power control bits
const POWER_ON: u8 = 1 << 0;
const POWER_330: u8 = 0b111 << 1;
const POWER_180: u8 = 0b101 << 1;

// Clock control bits
const CLK_INTERNAL_EN: u16 = 1 << 0;
const CLK_INTERNAL_STABLE: u16 = 1 << 1;
const CLK_CARD_EN: u16 = 1 << 2;

// Software reset bits
const RESET_ALL: u8 = 1 << 0;
const RESET_CMD: u8 = 1 << 1;
const RESET_DAT: u8 = 1 << 2;

// Normal interrupt status bits
const INT_CMD_COMPLETE: u16 = 1 << 0;
const INT_TRANSFER_COMPLETE: u16 = 1 << 1;
const INT_DMA: u16 = 1 << 3;
const INT_BUF_READ_READY: u16 = 1 << 5;
const INT_CARD_INSERTION: u16 = 1 << 6;
const INT_CARD_REMOVAL: u16 = 1 << 7;
const INT_ERROR: u16 = 1 << 15;

// Error interrupt status bits, named after the terminal states they map to
const ERR_CMD_TIMEOUT: u16 = 1 << 0;
const ERR_CMD_CRC: u16 = 1 << 1;
const ERR_CMD_END_BIT: u16 = 1 << 2;
const ERR_CMD_INDEX: u16 = 1 << 3;
const ERR_DATA_TIMEOUT: u16 = 1 << 4;
const ERR_DATA_CRC: u16 = 1 << 5;
const ERR_DATA_END_BIT: u16 = 1 << 6;

// Host control 2 bits
const HCTL2_UHS_MODE_MASK: u16 = 0b111;
const HCTL2_UHS_SDR50: u16 = 2;
const HCTL2_UHS_SDR104: u16 = 3;
const HCTL2_UHS_DDR50: u16 = 4;
const HCTL2_V18_EN: u16 = 1 << 3;
const HCTL2_PRESET_EN: u16 = 1 << 15;

// Capability register 0 bits
const CAPS0_BASE_CLOCK_SHIFT: u32 = 8;
const CAPS0_BASE_CLOCK_MASK: u32 = 0xFF;
const CAPS0_8BIT: u32 = 1 << 18;
const CAPS0_SDMA: u32 = 1 << 22;
const CAPS0_HIGH_SPEED: u32 = 1 << 21;
const CAPS0_V18: u32 = 1 << 26;

// Capability register 1 bits
const CAPS1_SDR50: u32 = 1 << 0;
const CAPS1_SDR104: u32 = 1 << 1;
const CAPS1_DDR50: u32 = 1 << 2;

// Vendor tap-delay control bits
const TAP_ITAP_MASK: u32 = 0x3F;
const TAP_ITAP_EN: u32 = 1 << 8;

/// SDMA boundary: 512 KiB between address reloads.
const BLKSZ_BOUNDARY_512K: u16 = 0b111 << 12;

/// Sampling-clock tap positions scanned during tuning.
pub const TUNING_TAP_COUNT: usize = 40;
/// Shortest passing-tap run considered trustworthy.
pub const TUNING_MIN_WINDOW: usize = 4;
/// Tuning-block reads attempted per tap.
const TUNING_READS_PER_TAP: usize = 3;

const MMC_CMD_SEND_TUNING_BLOCK: u32 = 19;
const MMC_CMD_SEND_TUNING_BLOCK_HS200: u32 = 21;

tock_registers::register_structs! {
    pub SdhciRegisters {
        (0x000 => sdma_address: ReadWrite<u32>),
        (0x004 => block_size: ReadWrite<u16>),
        (0x006 => block_count: ReadWrite<u16>),
        (0x008 => argument: ReadWrite<u32>),
        (0x00C => transfer_mode: ReadWrite<u16>),
        (0x00E => command: ReadWrite<u16>),
        (0x010 => response: [ReadOnly<u32>; 4]),
        (0x020 => buffer_data_port: ReadOnly<u32>),
        (0x024 => present_state: ReadOnly<u32>),
        (0x028 => host_control_1: ReadWrite<u8>),
        (0x029 => power_control: ReadWrite<u8>),
        (0x02A => block_gap_control: ReadWrite<u8>),
        (0x02B => wakeup_control: ReadWrite<u8>),
        (0x02C => clock_control: ReadWrite<u16>),
        (0x02E => timeout_control: ReadWrite<u8>),
        (0x02F => software_reset: ReadWrite<u8>),
        (0x030 => normal_int_status: ReadWrite<u16>),
        (0x032 => error_int_status: ReadWrite<u16>),
        (0x034 => normal_int_status_enable: ReadWrite<u16>),
        (0x036 => error_int_status_enable: ReadWrite<u16>),
        (0x038 => normal_int_signal_enable: ReadWrite<u16>),
        (0x03A => error_int_signal_enable: ReadWrite<u16>),
        (0x03C => auto_cmd_error_status: ReadOnly<u16>),
        (0x03E => host_control_2: ReadWrite<u16>),
        (0x040 => capabilities_0: ReadOnly<u32>),
        (0x044 => capabilities_1: ReadOnly<u32>),
        (0x048 => max_current: ReadOnly<u32>),
        (0x04C => _reserved0),
        (0x060 => preset_value: [ReadOnly<u16>; 8]),
        (0x070 => _reserved1),
        (0x0F0 => vendor_tap_control: ReadWrite<u32>),
        (0x0F4 => _reserved2),
        (0x0FC => slot_int_status: ReadOnly<u16>),
        (0x0FE => host_version: ReadOnly<u16>),
        (0x100 => @END),
    }
}

/// Context of the transfer currently programmed into the controller.
struct TransferCtx {
    resp_type: u32,
    /// Remaining SDMA chunks, reloaded on each DMA boundary interrupt.
    chunks: Vec<(u64, u32)>,
    next_chunk: usize,
    has_data: bool,
}

/// Reference back-end for SDHCI-compatible controllers.
///
/// The register window at `base` must already be mapped by the platform
/// layer; construction does not touch the hardware.
pub struct SdhciHost {
    regs: NonNull<SdhciRegisters>,
    base_clock: u64,
    /// Set when the slot has no working card-detect interrupt and the
    /// shared poller must sample the line instead.
    poll_card_detect: bool,
    current: Option<TransferCtx>,
    bus_master: bool,
}

// All register access is serialized behind the controller's hardware
// lock; the raw window pointer itself is safe to move across threads.
unsafe impl Send for SdhciHost {}

impl SdhciHost {
    /// # Safety contract
    /// `base` must point at a mapped, uncached SDHCI register window that
    /// stays valid for the lifetime of the returned host.
    pub fn new(base: u64, poll_card_detect: bool) -> SdhciHost {
        SdhciHost {
            regs: NonNull::new(base as *mut SdhciRegisters)
                .expect("register window at address zero"),
            base_clock: 0,
            poll_card_detect,
            current: None,
            bus_master: true,
        }
    }

    fn regs(&self) -> &SdhciRegisters {
        unsafe { self.regs.as_ref() }
    }

    /// Poll the command/data inhibit pair and the internal clock until the
    /// bus is idle and the divider is ready, bounded by wall clock. Width
    /// and clock changes go through this so an in-flight transaction is
    /// never corrupted.
    fn wait_bus_idle(&self) -> Result<(), SdmmcError> {
        let deadline = Deadline::after(Duration::from_millis(100));
        loop {
            let state = self.regs().present_state.get();
            let clock = self.regs().clock_control.get();
            let divider_ready =
                clock & CLK_INTERNAL_EN == 0 || clock & CLK_INTERNAL_STABLE != 0;
            if state & (PSTATE_CMD_INHIBIT | PSTATE_DAT_INHIBIT) == 0 && divider_ready {
                return Ok(());
            }
            if deadline.expired() {
                return Err(SdmmcError::ETIMEDOUT);
            }
            poll_wait(POLL_INTERVAL);
        }
    }

    fn soft_reset(&self, bits: u8) -> Result<(), SdmmcError> {
        self.regs().software_reset.set(bits);
        let deadline = Deadline::after(Duration::from_millis(100));
        while self.regs().software_reset.get() & bits != 0 {
            if deadline.expired() {
                return Err(SdmmcError::ETIMEDOUT);
            }
            poll_wait(POLL_INTERVAL);
        }
        Ok(())
    }

    fn read_response(&self, resp_type: u32) -> [u32; 4] {
        let r: [u32; 4] = [
            self.regs().response[0].get(),
            self.regs().response[1].get(),
            self.regs().response[2].get(),
            self.regs().response[3].get(),
        ];
        // 136-bit responses arrive shifted down by eight bits across the
        // four response registers; rebuild them most-significant first.
        if resp_type & (1 << 1) != 0 {
            [
                (r[3] << 8) | (r[2] >> 24),
                (r[2] << 8) | (r[1] >> 24),
                (r[1] << 8) | (r[0] >> 24),
                r[0] << 8,
            ]
        } else {
            [r[0], 0, 0, 0]
        }
    }

    fn command_word(cmd: &SdmmcCmd, has_data: bool) -> u16 {
        let mut word = (cmd.cmdidx as u16 & 0x3F) << 8;
        // Response select, CRC and index checks from the response flags.
        const RSP_PRESENT: u32 = 1 << 0;
        const RSP_136: u32 = 1 << 1;
        const RSP_CRC: u32 = 1 << 2;
        const RSP_BUSY: u32 = 1 << 3;
        const RSP_OPCODE: u32 = 1 << 4;

        if cmd.resp_type & RSP_PRESENT != 0 {
            if cmd.resp_type & RSP_136 != 0 {
                word |= CMD_RESP_136;
            } else if cmd.resp_type & RSP_BUSY != 0 {
                word |= CMD_RESP_48_BUSY;
            } else {
                word |= CMD_RESP_48;
            }
            if cmd.resp_type & RSP_CRC != 0 {
                word |= CMD_CRC_CHECK;
            }
            if cmd.resp_type & RSP_OPCODE != 0 {
                word |= CMD_INDEX_CHECK;
            }
        } else {
            word |= CMD_RESP_NONE;
        }
        if has_data {
            word |= CMD_DATA_PRESENT;
        }
        word
    }

    fn clear_interrupts(&self) {
        self.regs().normal_int_status.set(0xFFFF);
        self.regs().error_int_status.set(0xFFFF);
    }

    fn set_tap(&self, tap: usize) {
        self.regs()
            .vendor_tap_control
            .set(TAP_ITAP_EN | (tap as u32 & TAP_ITAP_MASK));
    }

    /// Drop the tuned sampling point and fall back to the default capture
    /// position.
    fn reset_sampling(&self) -> Result<(), SdmmcError> {
        self.regs().vendor_tap_control.set(0);
        self.soft_reset(RESET_DAT)
    }

    /// One synchronous tuning-block read through the PIO buffer.
    fn tuning_block_read(&self, opcode: u32, block_len: u32) -> Result<(), SdmmcError> {
        self.wait_bus_idle()?;
        self.clear_interrupts();

        self.regs().block_size.set(block_len as u16);
        self.regs().block_count.set(1);
        self.regs().transfer_mode.set(XFER_READ);
        self.regs().argument.set(0);

        let cmd = SdmmcCmd::new(opcode, MMC_RSP_R1, 0);
        self.regs().command.set(Self::command_word(&cmd, true));

        let deadline = Deadline::after(Duration::from_millis(150));
        loop {
            let status = self.regs().normal_int_status.get();
            if status & INT_ERROR != 0 {
                self.clear_interrupts();
                self.soft_reset(RESET_CMD | RESET_DAT)?;
                return Err(SdmmcError::EIO);
            }
            if status & INT_BUF_READ_READY != 0
                || self.regs().present_state.get() & PSTATE_BUF_READ_EN != 0
            {
                break;
            }
            if deadline.expired() {
                self.soft_reset(RESET_CMD | RESET_DAT)?;
                return Err(SdmmcError::ETIMEDOUT);
            }
            poll_wait(POLL_INTERVAL);
        }

        for _ in 0..(block_len / 4) {
            let _ = self.regs().buffer_data_port.get();
        }

        let deadline = Deadline::after(Duration::from_millis(150));
        loop {
            let status = self.regs().normal_int_status.get();
            if status & INT_ERROR != 0 {
                self.clear_interrupts();
                self.soft_reset(RESET_CMD | RESET_DAT)?;
                return Err(SdmmcError::EIO);
            }
            if status & INT_TRANSFER_COMPLETE != 0 {
                self.clear_interrupts();
                return Ok(());
            }
            if deadline.expired() {
                self.soft_reset(RESET_CMD | RESET_DAT)?;
                return Err(SdmmcError::ETIMEDOUT);
            }
            poll_wait(POLL_INTERVAL);
        }
    }
}

/// Classify simultaneously set error bits into one terminal state using a
/// fixed priority order; the first match wins.
pub fn classify_error(err: u16) -> CmdStatus {
    const PRIORITY: &[(u16, CmdStatus)] = &[
        (ERR_CMD_TIMEOUT, CmdStatus::CmdTimeout),
        (ERR_CMD_CRC, CmdStatus::CmdCrcError),
        (ERR_CMD_END_BIT, CmdStatus::CmdEndBitError),
        (ERR_CMD_INDEX, CmdStatus::IndexError),
        (ERR_DATA_TIMEOUT, CmdStatus::DataTimeout),
        (ERR_DATA_CRC, CmdStatus::DataCrcError),
        (ERR_DATA_END_BIT, CmdStatus::DataEndBitError),
    ];
    for (bit, status) in PRIORITY {
        if err & bit != 0 {
            return *status;
        }
    }
    CmdStatus::Failed
}

/// Pick the sampling tap at the center of the longest contiguous run of
/// passing taps; `None` when no run reaches the minimum trusted length.
pub fn select_tuning_tap(passes: &[bool]) -> Option<usize> {
    let mut best_start = 0usize;
    let mut best_len = 0usize;
    let mut run_start = 0usize;
    let mut run_len = 0usize;

    for (i, pass) in passes.iter().enumerate() {
        if *pass {
            if run_len == 0 {
                run_start = i;
            }
            run_len += 1;
            if run_len > best_len {
                best_len = run_len;
                best_start = run_start;
            }
        } else {
            run_len = 0;
        }
    }

    if best_len >= TUNING_MIN_WINDOW {
        Some(best_start + best_len / 2)
    } else {
        None
    }
}

/// 10-bit SDHCI divider for `target` from `base`; returns the divider and
/// the rate it actually produces.
pub fn divider_for(base: u64, target: u64) -> (u16, u64) {
    if target >= base {
        return (0, base);
    }
    let div = base.div_ceil(2 * target).min(1023);
    (div as u16, base / (2 * div))
}

impl SdmmcHardware for SdhciHost {
    fn sdmmc_init(&mut self) -> Result<(MmcIos, HostInfo, u128), SdmmcError> {
        self.soft_reset(RESET_ALL)?;

        let caps0 = self.regs().capabilities_0.get();
        let caps1 = self.regs().capabilities_1.get();

        let base_mhz = (caps0 >> CAPS0_BASE_CLOCK_SHIFT) & CAPS0_BASE_CLOCK_MASK;
        if base_mhz == 0 {
            return Err(SdmmcError::EUNSUPPORTEDCARD);
        }
        self.base_clock = base_mhz as u64 * 1_000_000;
        self.bus_master = caps0 & CAPS0_SDMA != 0;

        // Multi-block stops are issued by the auto-CMD12 engine.
        let mut cap: u128 =
            MMC_TIMING_LEGACY | MMC_CAP_4_BIT_DATA | MMC_CAP_CMD23 | MMC_CAP_AUTO_CMD12;
        if caps0 & CAPS0_HIGH_SPEED != 0 {
            cap |= MMC_TIMING_SD_HS | MMC_TIMING_MMC_HS;
        }
        if caps0 & CAPS0_8BIT != 0 {
            cap |= MMC_CAP_8_BIT_DATA;
        }
        if caps0 & CAPS0_V18 != 0 {
            cap |= MMC_CAP_VOLTAGE_180;
        }
        if self.bus_master {
            cap |= MMC_CAP_BUS_MASTER;
        }
        if caps1 & CAPS1_SDR50 != 0 {
            cap |= MMC_TIMING_UHS_SDR50;
        }
        if caps1 & CAPS1_SDR104 != 0 {
            // The same tuned 200 MHz path serves the eMMC tier.
            cap |= MMC_TIMING_UHS_SDR104 | MMC_TIMING_MMC_HS200;
        }
        if caps1 & CAPS1_DDR50 != 0 {
            cap |= MMC_TIMING_UHS_DDR50 | MMC_TIMING_MMC_DDR52;
        }
        if self.poll_card_detect {
            cap |= MMC_CAP_NEEDS_POLL;
        }

        // Unmask every status we classify; signal only what the platform
        // wired to the interrupt line.
        self.regs().normal_int_status_enable.set(0xFFFF);
        self.regs().error_int_status_enable.set(0xFFFF);
        self.regs().normal_int_signal_enable.set(
            INT_CMD_COMPLETE
                | INT_TRANSFER_COMPLETE
                | INT_DMA
                | INT_CARD_INSERTION
                | INT_CARD_REMOVAL,
        );
        self.regs().error_int_signal_enable.set(0xFFFF);

        let ios = MmcIos {
            clock: 0,
            vdd: 330,
            power_mode: MmcPowerMode::Off,
            bus_width: MmcBusWidth::Width1,
            timing: MmcTiming::CardSetup,
            signal_voltage: MmcSignalVoltage::Voltage330,
            bus_mode: MmcBusMode::OpenDrain,
        };

        let info = HostInfo {
            max_frequency: self.base_clock,
            min_frequency: self.base_clock / 2046,
            max_blocks_per_req: u16::MAX as u32,
            max_segments: 128,
        };

        debug!(
            target: "sdmmc::hal",
            "sdhci host: base clock {} Hz, caps {:#x}",
            self.base_clock,
            cap
        );
        Ok((ios, info, cap))
    }

    fn sdmmc_send_command(
        &mut self,
        cmd: &SdmmcCmd,
        data: Option<&MmcData>,
    ) -> Result<(), SdmmcError> {
        self.wait_bus_idle()?;
        self.clear_interrupts();

        let mut chunks = Vec::new();
        if let Some(data) = data {
            if data.blockcnt == 0 || data.blocksize == 0 {
                return Err(SdmmcError::EINVAL);
            }
            let mut cursor = data.sg.cursor(data.blocksize);
            while let Some(chunk) = cursor.next_chunk() {
                chunks.push(chunk);
            }
            if chunks.is_empty() {
                return Err(SdmmcError::EINVAL);
            }

            let (first_addr, _) = chunks[0];
            let first = u32::try_from(first_addr).map_err(|_| SdmmcError::EINVAL)?;

            let mut mode = XFER_BLOCK_COUNT_EN;
            if self.bus_master {
                mode |= XFER_DMA_EN;
            }
            if matches!(data.flags, MmcDataFlag::SdmmcDataRead) {
                mode |= XFER_READ;
            }
            if data.blockcnt > 1 {
                mode |= XFER_MULTI_BLOCK | XFER_AUTO_CMD12;
            }

            self.regs().sdma_address.set(first);
            self.regs()
                .block_size
                .set(BLKSZ_BOUNDARY_512K | (data.blocksize as u16 & 0xFFF));
            self.regs().block_count.set(data.blockcnt as u16);
            self.regs().transfer_mode.set(mode);
        } else {
            self.regs().transfer_mode.set(0);
        }

        self.current = Some(TransferCtx {
            resp_type: cmd.resp_type,
            next_chunk: 1,
            chunks,
            has_data: data.is_some(),
        });

        self.regs().argument.set(cmd.cmdarg);
        self.regs()
            .command
            .set(Self::command_word(cmd, data.is_some()));
        trace!(target: "sdmmc::hal", "programmed CMD{}", cmd.cmdidx);
        Ok(())
    }

    fn sdmmc_abort_command(&mut self) -> Result<(), SdmmcError> {
        self.current = None;
        self.soft_reset(RESET_CMD | RESET_DAT)?;
        self.clear_interrupts();
        Ok(())
    }

    fn sdmmc_handle_event(&mut self, event: HostEvent) -> Result<HostEventOutcome, SdmmcError> {
        if event == HostEvent::CardDetect {
            let present = self.regs().present_state.get() & PSTATE_CARD_INSERTED != 0;
            return Ok(HostEventOutcome::CardChange { present });
        }

        let status = self.regs().normal_int_status.get();
        let errors = self.regs().error_int_status.get();

        if status & (INT_CARD_INSERTION | INT_CARD_REMOVAL) != 0 {
            self.regs()
                .normal_int_status
                .set(INT_CARD_INSERTION | INT_CARD_REMOVAL);
            let present = self.regs().present_state.get() & PSTATE_CARD_INSERTED != 0;
            return Ok(HostEventOutcome::CardChange { present });
        }

        if status & INT_ERROR != 0 || errors != 0 {
            let terminal = classify_error(errors);
            let ctx = self.current.take();
            let response = ctx
                .map(|c| self.read_response(c.resp_type))
                .unwrap_or([0; 4]);
            self.clear_interrupts();
            self.soft_reset(RESET_CMD | RESET_DAT)?;
            warn!(target: "sdmmc::hal", "transfer failed: {:?}", terminal);
            return Ok(HostEventOutcome::CmdComplete {
                status: terminal,
                response,
            });
        }

        // SDMA boundary: reload the address register with the next chunk.
        // The hardware raised the data-ready edge; the engine never starts
        // DMA legs eagerly.
        if status & INT_DMA != 0 {
            self.regs().normal_int_status.set(INT_DMA);
            if let Some(ctx) = self.current.as_mut() {
                if let Some(&(addr, _len)) = ctx.chunks.get(ctx.next_chunk) {
                    ctx.next_chunk += 1;
                    let addr = u32::try_from(addr).map_err(|_| SdmmcError::EINVAL)?;
                    self.regs().sdma_address.set(addr);
                    return Ok(HostEventOutcome::DmaProgress);
                }
            }
            return Ok(HostEventOutcome::DmaProgress);
        }

        if status & INT_CMD_COMPLETE != 0 {
            self.regs().normal_int_status.set(INT_CMD_COMPLETE);
            let Some(ctx) = self.current.as_mut() else {
                return Ok(HostEventOutcome::None);
            };
            if !ctx.has_data {
                let resp_type = ctx.resp_type;
                self.current = None;
                return Ok(HostEventOutcome::CmdComplete {
                    status: CmdStatus::Success,
                    response: self.read_response(resp_type),
                });
            }
            return Ok(HostEventOutcome::None);
        }

        if status & INT_TRANSFER_COMPLETE != 0 {
            self.regs().normal_int_status.set(INT_TRANSFER_COMPLETE);
            let Some(ctx) = self.current.take() else {
                return Ok(HostEventOutcome::None);
            };
            return Ok(HostEventOutcome::CmdComplete {
                status: CmdStatus::Success,
                response: self.read_response(ctx.resp_type),
            });
        }

        Ok(HostEventOutcome::None)
    }

    fn sdmmc_card_detect(&mut self) -> Result<bool, SdmmcError> {
        Ok(self.regs().present_state.get() & PSTATE_CARD_INSERTED != 0)
    }

    fn sdmmc_set_power(&mut self, mode: MmcPowerMode) -> Result<MmcPowerMode, SdmmcError> {
        match mode {
            MmcPowerMode::Off => self.regs().power_control.set(0),
            MmcPowerMode::Up | MmcPowerMode::On => {
                self.regs().power_control.set(POWER_330 | POWER_ON)
            }
        }
        Ok(mode)
    }

    fn sdmmc_config_clock(&mut self, freq: u64) -> Result<u64, SdmmcError> {
        self.wait_bus_idle()?;

        // Gate the card clock before touching the divider.
        self.regs().clock_control.set(0);
        if freq == 0 {
            return Ok(0);
        }

        let (div, actual) = divider_for(self.base_clock, freq);
        let div_lo = (div & 0xFF) as u16;
        let div_hi = ((div >> 8) & 0x3) as u16;
        self.regs()
            .clock_control
            .set((div_lo << 8) | (div_hi << 6) | CLK_INTERNAL_EN);

        let deadline = Deadline::after(Duration::from_millis(150));
        while self.regs().clock_control.get() & CLK_INTERNAL_STABLE == 0 {
            if deadline.expired() {
                return Err(SdmmcError::ETIMEDOUT);
            }
            poll_wait(POLL_INTERVAL);
        }

        let value = self.regs().clock_control.get();
        self.regs().clock_control.set(value | CLK_CARD_EN);
        trace!(target: "sdmmc::hal", "clock {} Hz (asked {})", actual, freq);
        Ok(actual)
    }

    fn sdmmc_config_bus_mode(&mut self, _mode: MmcBusMode) -> Result<(), SdmmcError> {
        // SDHCI drives the command line push-pull in hardware; open-drain
        // during identification needs no programming here.
        Ok(())
    }

    fn sdmmc_config_bus_width(&mut self, width: MmcBusWidth) -> Result<(), SdmmcError> {
        self.wait_bus_idle()?;
        let mut ctl = self.regs().host_control_1.get();
        ctl &= !(HCTL1_4BIT | HCTL1_8BIT);
        match width {
            MmcBusWidth::Width1 => {}
            MmcBusWidth::Width4 => ctl |= HCTL1_4BIT,
            MmcBusWidth::Width8 => ctl |= HCTL1_8BIT,
        }
        self.regs().host_control_1.set(ctl | HCTL1_DMA_SDMA);
        Ok(())
    }

    fn sdmmc_config_timing(&mut self, timing: MmcTiming) -> Result<(), SdmmcError> {
        self.wait_bus_idle()?;

        let mut ctl = self.regs().host_control_1.get();
        let mut ctl2 = self.regs().host_control_2.get() & !HCTL2_UHS_MODE_MASK;

        match timing {
            MmcTiming::Legacy | MmcTiming::CardSetup => ctl &= !HCTL1_HIGH_SPEED,
            MmcTiming::SdHs | MmcTiming::MmcHs => ctl |= HCTL1_HIGH_SPEED,
            MmcTiming::UhsSdr50 => {
                ctl |= HCTL1_HIGH_SPEED;
                ctl2 |= HCTL2_UHS_SDR50;
            }
            MmcTiming::UhsSdr104 | MmcTiming::MmcHs200 | MmcTiming::MmcHs400 => {
                ctl |= HCTL1_HIGH_SPEED;
                ctl2 |= HCTL2_UHS_SDR104;
            }
            MmcTiming::UhsDdr50 | MmcTiming::MmcDdr52 => {
                ctl |= HCTL1_HIGH_SPEED;
                ctl2 |= HCTL2_UHS_DDR50;
            }
        }

        self.regs().host_control_1.set(ctl);
        self.regs().host_control_2.set(ctl2);
        Ok(())
    }

    fn sdmmc_config_signal_voltage(
        &mut self,
        voltage: MmcSignalVoltage,
    ) -> Result<(), SdmmcError> {
        let ctl2 = self.regs().host_control_2.get();
        match voltage {
            MmcSignalVoltage::Voltage330 => {
                self.regs().host_control_2.set(ctl2 & !HCTL2_V18_EN);
                self.regs().power_control.set(POWER_330 | POWER_ON);
            }
            MmcSignalVoltage::Voltage180 => {
                self.regs().host_control_2.set(ctl2 | HCTL2_V18_EN);
                self.regs().power_control.set(POWER_180 | POWER_ON);
            }
            // This family has no 1.2 V rail.
            MmcSignalVoltage::Voltage120 => return Err(SdmmcError::ENOTIMPLEMENTED),
        }
        // Regulator settle time before the switch is trusted.
        poll_wait(Duration::from_millis(5));
        Ok(())
    }

    fn sdmmc_execute_tuning(&mut self, timing: MmcTiming) -> Result<(), SdmmcError> {
        let (opcode, block_len) = match timing {
            MmcTiming::MmcHs200 | MmcTiming::MmcHs400 => {
                let wide = self.regs().host_control_1.get() & HCTL1_8BIT != 0;
                (
                    MMC_CMD_SEND_TUNING_BLOCK_HS200,
                    if wide { 128 } else { 64 },
                )
            }
            _ => (MMC_CMD_SEND_TUNING_BLOCK, 64),
        };

        let mut passes = [false; TUNING_TAP_COUNT];
        for (tap, slot) in passes.iter_mut().enumerate() {
            self.set_tap(tap);
            *slot = (0..TUNING_READS_PER_TAP)
                .all(|_| self.tuning_block_read(opcode, block_len).is_ok());
        }

        match select_tuning_tap(&passes) {
            Some(tap) => {
                self.set_tap(tap);
                debug!(target: "sdmmc::hal", "tuning selected tap {}", tap);
                Ok(())
            }
            None => {
                // No trustworthy window: drop back to the untuned sampling
                // point instead of guessing a tap.
                warn!(target: "sdmmc::hal", "tuning found no usable window");
                self.reset_sampling()?;
                Err(SdmmcError::EIO)
            }
        }
    }

    fn sdmmc_config_preset(&mut self, enable: bool) -> Result<(), SdmmcError> {
        let ctl2 = self.regs().host_control_2.get();
        if enable {
            self.regs().host_control_2.set(ctl2 | HCTL2_PRESET_EN);
        } else {
            self.regs().host_control_2.set(ctl2 & !HCTL2_PRESET_EN);
        }
        Ok(())
    }

    fn sdmmc_set_power_state(&mut self, state: MmcPowerState) -> Result<(), SdmmcError> {
        match state {
            MmcPowerState::Active => {
                let value = self.regs().clock_control.get();
                self.regs().clock_control.set(value | CLK_CARD_EN);
            }
            MmcPowerState::Idle => {
                // Gate the card clock, keep the divider running for a fast
                // wakeup.
                let value = self.regs().clock_control.get();
                self.regs().clock_control.set(value & !CLK_CARD_EN);
            }
            MmcPowerState::Sleep => {
                self.regs().clock_control.set(0);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_priority_first_match_wins() {
        // Command timeout outranks everything even with all bits set.
        assert_eq!(classify_error(0x7F), CmdStatus::CmdTimeout);
        assert_eq!(
            classify_error(ERR_CMD_CRC | ERR_DATA_CRC),
            CmdStatus::CmdCrcError
        );
        assert_eq!(
            classify_error(ERR_DATA_TIMEOUT | ERR_DATA_END_BIT),
            CmdStatus::DataTimeout
        );
        assert_eq!(classify_error(ERR_DATA_END_BIT), CmdStatus::DataEndBitError);
        assert_eq!(classify_error(0x8000), CmdStatus::Failed);
    }

    #[test]
    fn tuning_picks_center_of_longest_run() {
        let mut passes = [false; TUNING_TAP_COUNT];
        // Runs: [5..8) len 3, [12..22) len 10.
        for tap in 5..8 {
            passes[tap] = true;
        }
        for tap in 12..22 {
            passes[tap] = true;
        }
        assert_eq!(select_tuning_tap(&passes), Some(17));
    }

    #[test]
    fn tuning_short_window_fails() {
        let mut passes = [false; TUNING_TAP_COUNT];
        for tap in 9..9 + TUNING_MIN_WINDOW - 1 {
            passes[tap] = true;
        }
        assert_eq!(select_tuning_tap(&passes), None);
        assert_eq!(select_tuning_tap(&[false; TUNING_TAP_COUNT]), None);
    }

    #[test]
    fn tuning_exact_minimum_window_passes() {
        let mut passes = [false; TUNING_TAP_COUNT];
        for tap in 20..20 + TUNING_MIN_WINDOW {
            passes[tap] = true;
        }
        assert_eq!(select_tuning_tap(&passes), Some(20 + TUNING_MIN_WINDOW / 2));
    }

    #[test]
    fn divider_rounds_up_to_stay_under_target() {
        let (div, actual) = divider_for(200_000_000, 400_000);
        assert_eq!(div, 250);
        assert_eq!(actual, 400_000);
        assert!(actual <= 400_000);

        let (div, actual) = divider_for(200_000_000, 52_000_000);
        assert_eq!(div, 2);
        assert_eq!(actual, 50_000_000);

        let (div, actual) = divider_for(100_000_000, 100_000_000);
        assert_eq!(div, 0);
        assert_eq!(actual, 100_000_000);

        // Below the reachable range the divider saturates.
        let (div, _) = divider_for(200_000_000, 10);
        assert_eq!(div, 1023);
    }

    #[test]
    fn command_word_encoding() {
        let cmd = SdmmcCmd::new(17, MMC_RSP_R1, 0);
        let word = SdhciHost::command_word(&cmd, true);
        assert_eq!(word >> 8, 17);
        assert_ne!(word & CMD_DATA_PRESENT, 0);
        assert_ne!(word & CMD_CRC_CHECK, 0);
        assert_ne!(word & CMD_INDEX_CHECK, 0);
        assert_eq!(word & 0b11, CMD_RESP_48);

        let none = SdmmcCmd::new(0, 0, 0);
        assert_eq!(SdhciHost::command_word(&none, false) & 0b11, CMD_RESP_NONE);
    }
}
