use crate::sdmmc::mmc_struct::{MmcBusWidth, MmcTiming};
use crate::sdmmc::{
    CmdStatus, HostInfo, MmcBusMode, MmcData, MmcIos, MmcPowerMode, MmcSignalVoltage, SdmmcCmd,
    SdmmcError,
};

/// Hardware-originated notification delivered to a controller worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    /// Command/transfer interrupt.
    Interrupt,
    /// DMA engine event (descriptor done, boundary crossed).
    Dma,
    /// Card-detect line changed.
    CardDetect,
}

/// What an event amounted to after the hardware layer classified it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEventOutcome {
    /// Nothing to report (spurious or already handled).
    None,
    /// The in-flight command reached a terminal state.
    CmdComplete {
        status: CmdStatus,
        response: [u32; 4],
    },
    /// More DMA work was programmed; the transfer is still running.
    DmaProgress,
    /// Card-detect state, as read after the event.
    CardChange { present: bool },
}

/// Power states a host can be asked to enter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmcPowerState {
    Active,
    Idle,
    Sleep,
}

/// The fixed contract every physical host family implements.
///
/// The dispatch engine and the bus sequencer are written purely against
/// this trait; nothing in the protocol layer assumes a particular
/// controller's registers. Operations a family cannot provide keep the
/// default body and report `ENOTIMPLEMENTED`.
///
/// `sdmmc_send_command` must only program the hardware and return; the
/// completion is reported later through `sdmmc_handle_event` from the
/// controller worker. A host that is told to send while a previous command
/// is still running may return `EBUSY`, but the protocol layer already
/// guarantees a single command in flight per controller.
pub trait SdmmcHardware {
    /// Bring the host to a known state and report its I/O defaults, fixed
    /// limits and capability bits.
    fn sdmmc_init(&mut self) -> Result<(MmcIos, HostInfo, u128), SdmmcError> {
        Err(SdmmcError::ENOTIMPLEMENTED)
    }

    fn sdmmc_send_command(
        &mut self,
        _cmd: &SdmmcCmd,
        _data: Option<&MmcData>,
    ) -> Result<(), SdmmcError> {
        Err(SdmmcError::ENOTIMPLEMENTED)
    }

    /// Stop whatever the host is doing with the current command and
    /// release the command and data lines. Called exactly once per
    /// deadline expiry.
    fn sdmmc_abort_command(&mut self) -> Result<(), SdmmcError> {
        Err(SdmmcError::ENOTIMPLEMENTED)
    }

    /// Classify a hardware event. Runs on the controller worker, never on
    /// a caller thread; must not block.
    fn sdmmc_handle_event(&mut self, _event: HostEvent) -> Result<HostEventOutcome, SdmmcError> {
        Err(SdmmcError::ENOTIMPLEMENTED)
    }

    /// Whether a card is in the slot right now.
    fn sdmmc_card_detect(&mut self) -> Result<bool, SdmmcError> {
        Err(SdmmcError::ENOTIMPLEMENTED)
    }

    fn sdmmc_set_power(&mut self, _mode: MmcPowerMode) -> Result<MmcPowerMode, SdmmcError> {
        Err(SdmmcError::ENOTIMPLEMENTED)
    }

    /// Change the bus clock; the returned value is the rate the divider
    /// actually produced. A requested rate of zero gates the clock off.
    fn sdmmc_config_clock(&mut self, _freq: u64) -> Result<u64, SdmmcError> {
        Err(SdmmcError::ENOTIMPLEMENTED)
    }

    /// Open-drain is only meaningful while cards share the command line
    /// during identification; push-pull everywhere else.
    fn sdmmc_config_bus_mode(&mut self, _mode: MmcBusMode) -> Result<(), SdmmcError> {
        Err(SdmmcError::ENOTIMPLEMENTED)
    }

    fn sdmmc_config_bus_width(&mut self, _width: MmcBusWidth) -> Result<(), SdmmcError> {
        Err(SdmmcError::ENOTIMPLEMENTED)
    }

    fn sdmmc_config_timing(&mut self, _timing: MmcTiming) -> Result<(), SdmmcError> {
        Err(SdmmcError::ENOTIMPLEMENTED)
    }

    fn sdmmc_config_signal_voltage(
        &mut self,
        _voltage: MmcSignalVoltage,
    ) -> Result<(), SdmmcError> {
        Err(SdmmcError::ENOTIMPLEMENTED)
    }

    /// Calibrate the data sampling point for `timing`. On failure the host
    /// must have reset its sampling circuitry before returning.
    fn sdmmc_execute_tuning(&mut self, _timing: MmcTiming) -> Result<(), SdmmcError> {
        Err(SdmmcError::ENOTIMPLEMENTED)
    }

    /// Use the host's preset divider/driver values for the current timing.
    fn sdmmc_config_preset(&mut self, _enable: bool) -> Result<(), SdmmcError> {
        Err(SdmmcError::ENOTIMPLEMENTED)
    }

    fn sdmmc_set_power_state(&mut self, _state: MmcPowerState) -> Result<(), SdmmcError> {
        Err(SdmmcError::ENOTIMPLEMENTED)
    }
}
