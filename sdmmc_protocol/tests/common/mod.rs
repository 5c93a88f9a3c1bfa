//! Scripted hardware back-end used by the engine tests: a mock host
//! implementing the capability trait plus a virtual card that answers the
//! identification and negotiation sequences.

#![allow(dead_code)]

use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use sdmmc_protocol::sdmmc::mmc_struct::{MmcBusWidth, MmcTiming};
use sdmmc_protocol::sdmmc::sdmmc_capability::*;
use sdmmc_protocol::sdmmc::sdmmc_constant::*;
use sdmmc_protocol::sdmmc::{
    CmdStatus, HostInfo, MmcBusMode, MmcData, MmcIos, MmcPowerMode, MmcSignalVoltage,
    SdmmcCmd, SdmmcConfig, SdmmcController, SdmmcError,
};
use sdmmc_protocol::sdmmc_traits::{
    HostEvent, HostEventOutcome, MmcPowerState, SdmmcHardware,
};

/// Everything the tests observe or script, shared with the mock.
#[derive(Default)]
pub struct MockState {
    pub notifier: Option<Sender<HostEvent>>,
    pub card: Option<VirtualCard>,
    pub present: bool,

    /// Never deliver a completion; the engine must hit its deadline.
    pub withhold_completion: bool,
    /// Delay before the completion interrupt fires.
    pub complete_delay: Option<Duration>,
    /// Timing switches the host rejects.
    pub fail_timings: Vec<MmcTiming>,
    /// Tuning outcome; a failed tuning records a sampling reset.
    pub tuning_passes: bool,

    pub send_calls: u32,
    pub abort_calls: u32,
    pub tuning_calls: u32,
    pub sampling_resets: u32,
    pub in_flight: i32,
    pub max_in_flight: i32,

    pub last_timing: Option<MmcTiming>,
    pub last_width: Option<MmcBusWidth>,
    pub last_voltage: Option<MmcSignalVoltage>,
    pub power_states: Vec<MmcPowerState>,

    pub pending: Option<(CmdStatus, [u32; 4])>,
}

pub struct MockHost {
    pub caps: u128,
    pub state: Arc<Mutex<MockState>>,
}

/// Host capability set most tests run with.
pub fn default_caps() -> u128 {
    MMC_TIMING_LEGACY
        | MMC_TIMING_MMC_HS
        | MMC_TIMING_SD_HS
        | MMC_CAP_4_BIT_DATA
        | MMC_CAP_8_BIT_DATA
        | MMC_CAP_BUSY_DETECT
        | MMC_CAP_NEEDS_POLL
        | MMC_CAP_BUS_MASTER
        | MMC_CAP_VOLTAGE_180
        | MMC_CAP_CMD23
}

/// Attach a controller over a fresh mock and wire the event queue.
pub fn attach_mock(
    caps: u128,
    config: SdmmcConfig,
    state: MockState,
) -> (Arc<SdmmcController>, Arc<Mutex<MockState>>) {
    let shared = Arc::new(Mutex::new(state));
    let host = MockHost {
        caps,
        state: shared.clone(),
    };
    let controller = SdmmcController::attach(config, Box::new(host)).unwrap();
    shared.lock().unwrap().notifier = Some(controller.notifier());
    (controller, shared)
}

impl SdmmcHardware for MockHost {
    fn sdmmc_init(&mut self) -> Result<(MmcIos, HostInfo, u128), SdmmcError> {
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
            max_frequency: 200_000_000,
            min_frequency: 400_000,
            max_blocks_per_req: 1024,
            max_segments: 8,
        };
        Ok((ios, info, self.caps))
    }

    fn sdmmc_send_command(
        &mut self,
        cmd: &SdmmcCmd,
        data: Option<&MmcData>,
    ) -> Result<(), SdmmcError> {
        let mut st = self.state.lock().unwrap();
        st.send_calls += 1;
        st.in_flight += 1;
        st.max_in_flight = st.max_in_flight.max(st.in_flight);

        if st.withhold_completion {
            return Ok(());
        }

        let outcome = match st.card.as_mut() {
            Some(card) => card.respond(cmd, data),
            None => (CmdStatus::Success, [0x900, 0, 0, 0]),
        };
        st.pending = Some(outcome);

        let notifier = st.notifier.clone();
        let delay = st.complete_delay;
        drop(st);

        if let Some(tx) = notifier {
            match delay {
                Some(delay) => {
                    thread::spawn(move || {
                        thread::sleep(delay);
                        let _ = tx.send(HostEvent::Interrupt);
                    });
                }
                None => {
                    let _ = tx.send(HostEvent::Interrupt);
                }
            }
        }
        Ok(())
    }

    fn sdmmc_abort_command(&mut self) -> Result<(), SdmmcError> {
        let mut st = self.state.lock().unwrap();
        st.abort_calls += 1;
        if st.in_flight > 0 {
            st.in_flight -= 1;
        }
        st.pending = None;
        Ok(())
    }

    fn sdmmc_handle_event(&mut self, event: HostEvent) -> Result<HostEventOutcome, SdmmcError> {
        let mut st = self.state.lock().unwrap();
        match event {
            HostEvent::Interrupt | HostEvent::Dma => match st.pending.take() {
                Some((status, response)) => {
                    if st.in_flight > 0 {
                        st.in_flight -= 1;
                    }
                    Ok(HostEventOutcome::CmdComplete { status, response })
                }
                None => Ok(HostEventOutcome::None),
            },
            HostEvent::CardDetect => Ok(HostEventOutcome::CardChange {
                present: st.present,
            }),
        }
    }

    fn sdmmc_card_detect(&mut self) -> Result<bool, SdmmcError> {
        Ok(self.state.lock().unwrap().present)
    }

    fn sdmmc_set_power(&mut self, mode: MmcPowerMode) -> Result<MmcPowerMode, SdmmcError> {
        Ok(mode)
    }

    fn sdmmc_config_clock(&mut self, freq: u64) -> Result<u64, SdmmcError> {
        Ok(freq.clamp(400_000, 200_000_000))
    }

    fn sdmmc_config_bus_mode(&mut self, _mode: MmcBusMode) -> Result<(), SdmmcError> {
        Ok(())
    }

    fn sdmmc_config_bus_width(&mut self, width: MmcBusWidth) -> Result<(), SdmmcError> {
        self.state.lock().unwrap().last_width = Some(width);
        Ok(())
    }

    fn sdmmc_config_timing(&mut self, timing: MmcTiming) -> Result<(), SdmmcError> {
        let mut st = self.state.lock().unwrap();
        if st.fail_timings.contains(&timing) {
            return Err(SdmmcError::EIO);
        }
        st.last_timing = Some(timing);
        Ok(())
    }

    fn sdmmc_config_signal_voltage(
        &mut self,
        voltage: MmcSignalVoltage,
    ) -> Result<(), SdmmcError> {
        self.state.lock().unwrap().last_voltage = Some(voltage);
        Ok(())
    }

    fn sdmmc_execute_tuning(&mut self, _timing: MmcTiming) -> Result<(), SdmmcError> {
        let mut st = self.state.lock().unwrap();
        st.tuning_calls += 1;
        if st.tuning_passes {
            Ok(())
        } else {
            // Contract: the sampling circuitry is reset before a tuning
            // failure is reported.
            st.sampling_resets += 1;
            Err(SdmmcError::EIO)
        }
    }

    fn sdmmc_config_preset(&mut self, _enable: bool) -> Result<(), SdmmcError> {
        Ok(())
    }

    fn sdmmc_set_power_state(&mut self, state: MmcPowerState) -> Result<(), SdmmcError> {
        self.state.lock().unwrap().power_states.push(state);
        Ok(())
    }
}

// -------------------------------------------------------------------
// Virtual cards
// -------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum CardFlavor {
    Sd,
    Emmc,
}

/// Answers the command sequences the engine drives during bring-up and
/// block I/O. State is the minimum needed to follow the protocol.
pub struct VirtualCard {
    pub flavor: CardFlavor,
    cid: [u32; 4],
    csd: [u32; 4],
    ext_csd: [u8; EXT_CSD_LEN],
    scr: u64,
    rca: u16,
    app_cmd: bool,
}

fn set_bits(raw: &mut u128, offset: u32, width: u32, value: u32) {
    let mask = ((1u128 << width) - 1) << offset;
    *raw = (*raw & !mask) | (((value as u128) << offset) & mask);
}

fn to_words(raw: u128) -> [u32; 4] {
    [
        (raw >> 96) as u32,
        (raw >> 64) as u32,
        (raw >> 32) as u32,
        raw as u32,
    ]
}

impl VirtualCard {
    pub fn sd() -> VirtualCard {
        let mut cid = 0u128;
        set_bits(&mut cid, 120, 8, 0x13);
        set_bits(&mut cid, 104, 16, 0x5344);
        for (i, b) in b"VCARD".iter().enumerate() {
            set_bits(&mut cid, 96 - (i as u32) * 8, 8, *b as u32);
        }
        set_bits(&mut cid, 56, 8, 0x10);
        set_bits(&mut cid, 24, 32, 0x0BADF00D);
        set_bits(&mut cid, 12, 8, 24);
        set_bits(&mut cid, 8, 4, 3);

        let mut csd = 0u128;
        set_bits(&mut csd, 126, 2, 1); // CSD structure 2.0
        set_bits(&mut csd, 96, 8, 0x32);
        set_bits(&mut csd, 80, 4, 9);
        set_bits(&mut csd, 48, 22, 0x3B37); // ~8 GB
        set_bits(&mut csd, 22, 4, 9);

        // SCR: spec 2.0, 4-bit + 1-bit widths, spec3, CMD23
        let scr = (2u64 << 56) | (0x5u64 << 48) | (1u64 << 47) | (1u64 << 33);

        VirtualCard {
            flavor: CardFlavor::Sd,
            cid: to_words(cid),
            csd: to_words(csd),
            ext_csd: [0; EXT_CSD_LEN],
            scr,
            rca: 0xAA55,
            app_cmd: false,
        }
    }

    pub fn emmc() -> VirtualCard {
        let mut cid = 0u128;
        set_bits(&mut cid, 120, 8, 0x13);
        set_bits(&mut cid, 104, 8, 0x2);
        for (i, b) in b"VMMC01".iter().enumerate() {
            set_bits(&mut cid, 96 - (i as u32) * 8, 8, *b as u32);
        }
        set_bits(&mut cid, 48, 8, 0x21);
        set_bits(&mut cid, 16, 32, 0xFEEDC0DE);
        set_bits(&mut cid, 12, 4, 6);
        set_bits(&mut cid, 8, 4, 20);

        let mut csd = 0u128;
        set_bits(&mut csd, 126, 2, 3); // version in EXT_CSD
        set_bits(&mut csd, 122, 4, 4); // SPEC_VERS 4
        set_bits(&mut csd, 96, 8, 0x32);
        set_bits(&mut csd, 80, 4, 9);
        set_bits(&mut csd, 62, 12, 0xFFF);
        set_bits(&mut csd, 47, 3, 7);
        set_bits(&mut csd, 42, 5, 1);
        set_bits(&mut csd, 37, 5, 31);
        set_bits(&mut csd, 22, 4, 9);

        let mut ext_csd = [0u8; EXT_CSD_LEN];
        ext_csd[EXT_CSD_REV] = 7;
        ext_csd[EXT_CSD_DEVICE_TYPE] = EXT_CSD_CARD_TYPE_HS_26
            | EXT_CSD_CARD_TYPE_HS_52
            | EXT_CSD_CARD_TYPE_DDR_1_8V
            | EXT_CSD_CARD_TYPE_HS200_1_8V
            | EXT_CSD_CARD_TYPE_HS400_1_8V;
        ext_csd[EXT_CSD_SEC_COUNT..EXT_CSD_SEC_COUNT + 4]
            .copy_from_slice(&0x0E90_000u32.to_le_bytes());
        ext_csd[EXT_CSD_HC_ERASE_GRP_SIZE] = 1;
        ext_csd[EXT_CSD_ERASE_TIMEOUT_MULT] = 2;
        ext_csd[EXT_CSD_SEC_FEATURE_SUPPORT] = EXT_CSD_SEC_ER_EN | EXT_CSD_SEC_GB_CL_EN;
        ext_csd[EXT_CSD_TRIM_MULT] = 1;
        ext_csd[EXT_CSD_CACHE_SIZE..EXT_CSD_CACHE_SIZE + 4]
            .copy_from_slice(&512u32.to_le_bytes());
        ext_csd[EXT_CSD_GENERIC_CMD6_TIME] = 10;

        VirtualCard {
            flavor: CardFlavor::Emmc,
            cid: to_words(cid),
            csd: to_words(csd),
            ext_csd,
            scr: 0,
            rca: 1,
            app_cmd: false,
        }
    }

    /// Strip one tier from what the card advertises.
    pub fn without_device_type(mut self, bits: u8) -> VirtualCard {
        self.ext_csd[EXT_CSD_DEVICE_TYPE] &= !bits;
        self
    }

    fn write_data(data: Option<&MmcData>, bytes: &[u8]) {
        let Some(data) = data else { return };
        let mut offset = 0usize;
        for seg in &data.sg.segments {
            if offset >= bytes.len() {
                break;
            }
            let run = (seg.len as usize).min(bytes.len() - offset);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    bytes[offset..].as_ptr(),
                    seg.addr as *mut u8,
                    run,
                );
            }
            offset += run;
        }
    }

    fn fill_data(data: Option<&MmcData>, value: u8) {
        let Some(data) = data else { return };
        for seg in &data.sg.segments {
            unsafe {
                std::ptr::write_bytes(seg.addr as *mut u8, value, seg.len as usize);
            }
        }
    }

    const R1_READY: u32 = 0x900; // ready-for-data, tran state

    pub fn respond(
        &mut self,
        cmd: &SdmmcCmd,
        data: Option<&MmcData>,
    ) -> (CmdStatus, [u32; 4]) {
        let app = std::mem::replace(&mut self.app_cmd, false);
        let ok = |resp: u32| (CmdStatus::Success, [resp, 0, 0, 0]);

        if app {
            return match cmd.cmdidx {
                SD_CMD_APP_SEND_OP_COND => {
                    ok(OCR_BUSY | OCR_CCS | (MMC_VDD_32_33 | MMC_VDD_33_34))
                }
                SD_CMD_APP_SET_BUS_WIDTH => ok(Self::R1_READY),
                SD_CMD_APP_SEND_SCR => {
                    Self::write_data(data, &self.scr.to_be_bytes());
                    ok(Self::R1_READY)
                }
                _ => (CmdStatus::CmdTimeout, [0; 4]),
            };
        }

        match (self.flavor, cmd.cmdidx) {
            (_, MMC_CMD_GO_IDLE_STATE) => (CmdStatus::Success, [0; 4]),
            (_, MMC_CMD_APP_CMD) => {
                self.app_cmd = true;
                ok(Self::R1_READY | R1_APP_CMD)
            }

            // CMD8 is SEND_IF_COND for SD (no data) and SEND_EXT_CSD for
            // eMMC (data phase).
            (CardFlavor::Sd, SD_CMD_SEND_IF_COND) if data.is_none() => ok(cmd.cmdarg),
            (CardFlavor::Emmc, MMC_CMD_SEND_EXT_CSD) if data.is_some() => {
                Self::write_data(data, &self.ext_csd);
                ok(Self::R1_READY)
            }
            (CardFlavor::Emmc, SD_CMD_SEND_IF_COND) => (CmdStatus::CmdTimeout, [0; 4]),

            (CardFlavor::Emmc, MMC_CMD_SEND_OP_COND) => {
                ok(OCR_BUSY | OCR_ACCESS_MODE_SECTOR | (MMC_VDD_32_33 | MMC_VDD_33_34))
            }

            (_, MMC_CMD_ALL_SEND_CID) => (CmdStatus::Success, self.cid),
            (CardFlavor::Sd, SD_CMD_SEND_RELATIVE_ADDR) => {
                ok((self.rca as u32) << 16 | 0x500)
            }
            (CardFlavor::Emmc, MMC_CMD_SET_RELATIVE_ADDR) => {
                self.rca = (cmd.cmdarg >> 16) as u16;
                ok(Self::R1_READY)
            }
            (_, MMC_CMD_SEND_CSD) => (CmdStatus::Success, self.csd),
            (_, MMC_CMD_SELECT_CARD) => ok(Self::R1_READY),
            (_, MMC_CMD_SEND_STATUS) => ok(Self::R1_READY),

            // SD switch function: report everything supported, echo the
            // selected bus-speed function in the status block.
            (CardFlavor::Sd, SD_CMD_SWITCH_FUNC) => {
                let mut status = [0u8; SD_SWITCH_STATUS_LEN as usize];
                status[SD_SWITCH_GRP1_SUPPORT_BYTE] = 0x1F;
                status[SD_SWITCH_GRP1_RESULT_BYTE] = (cmd.cmdarg & 0xF) as u8;
                Self::write_data(data, &status);
                ok(Self::R1_READY)
            }
            (CardFlavor::Sd, SD_CMD_SWITCH_UHS18V) => ok(Self::R1_READY),

            // eMMC CMD6 write-byte switch.
            (CardFlavor::Emmc, MMC_CMD_SWITCH) => {
                let index = ((cmd.cmdarg >> 16) & 0xFF) as usize;
                let value = ((cmd.cmdarg >> 8) & 0xFF) as u8;
                if index < EXT_CSD_LEN {
                    self.ext_csd[index] = value;
                }
                ok(Self::R1_READY)
            }

            (_, MMC_CMD_SET_BLOCKLEN) => ok(Self::R1_READY),
            (_, MMC_CMD_SET_BLOCK_COUNT) => ok(Self::R1_READY),
            (_, MMC_CMD_STOP_TRANSMISSION) => ok(Self::R1_READY),

            (_, MMC_CMD_READ_SINGLE_BLOCK) | (_, MMC_CMD_READ_MULTIPLE_BLOCK) => {
                Self::fill_data(data, 0xA5);
                ok(Self::R1_READY)
            }
            (_, MMC_CMD_WRITE_SINGLE_BLOCK) | (_, MMC_CMD_WRITE_MULTIPLE_BLOCK) => {
                ok(Self::R1_READY)
            }

            (CardFlavor::Emmc, MMC_CMD_ERASE_GROUP_START)
            | (CardFlavor::Emmc, MMC_CMD_ERASE_GROUP_END)
            | (CardFlavor::Sd, SD_CMD_ERASE_WR_BLK_START)
            | (CardFlavor::Sd, SD_CMD_ERASE_WR_BLK_END)
            | (_, MMC_CMD_ERASE) => ok(Self::R1_READY),

            // Anything else: the card stays silent.
            _ => (CmdStatus::CmdTimeout, [0; 4]),
        }
    }
}
