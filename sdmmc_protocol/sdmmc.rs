use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use cmd_pool::CmdPool;
use emmc::{EMmc, ExtCsd, MmcCid, MmcCsd};
use mmc_struct::{CardKind, MmcBusWidth, MmcDevice, MmcState, MmcTiming};
use sdcard::{Cid, Csd, Scr, SdVersion, Sdcard};
use sdmmc_capability::*;
use sdmmc_constant::*;
use sg::SgList;

use crate::sdmmc_os::{poll_wait, Deadline};
use crate::sdmmc_traits::{HostEvent, HostEventOutcome, MmcPowerState, SdmmcHardware};

pub mod bit_field;
pub mod cmd_pool;
pub mod config;
pub mod emmc;
pub mod event;
pub mod mmc_struct;
pub mod quirks;
pub mod registry;
pub mod sdcard;
pub mod sdmmc_capability;
pub mod sdmmc_constant;
pub mod sg;

pub use config::SdmmcConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdmmcError {
    // Result not ready yet
    EBUSY,
    ETIMEDOUT,
    EINVAL,
    EIO,
    EUNSUPPORTEDCARD,
    ENOTIMPLEMENTED,
    // Should not trigger unless there is a bug in this stack
    EUNDEFINED,
    // The transfer succeeded but the stop command failed
    ESTOPCMD,
    ENOCARD,
    // Command or descriptor allocation failed
    ENOMEM,
    // The card flagged the command as illegal; never retried
    EILLEGAL,
    // Re-identification found a different card in the slot
    ECARDCHANGED,
    // The device is write protected
    EROFS,
}

// MMC response flags
const MMC_RSP_PRESENT: u32 = 1 << 0;
const MMC_RSP_136: u32 = 1 << 1;
const MMC_RSP_CRC: u32 = 1 << 2;
const MMC_RSP_BUSY: u32 = 1 << 3;
const MMC_RSP_OPCODE: u32 = 1 << 4;

// MMC response types
pub const MMC_RSP_NONE: u32 = 0;
pub const MMC_RSP_R1: u32 = MMC_RSP_PRESENT | MMC_RSP_CRC | MMC_RSP_OPCODE;
pub const MMC_RSP_R1B: u32 = MMC_RSP_PRESENT | MMC_RSP_CRC | MMC_RSP_OPCODE | MMC_RSP_BUSY;
pub const MMC_RSP_R2: u32 = MMC_RSP_PRESENT | MMC_RSP_136 | MMC_RSP_CRC;
pub const MMC_RSP_R3: u32 = MMC_RSP_PRESENT;
pub const MMC_RSP_R6: u32 = MMC_RSP_PRESENT | MMC_RSP_CRC | MMC_RSP_OPCODE;
pub const MMC_RSP_R7: u32 = MMC_RSP_PRESENT | MMC_RSP_CRC | MMC_RSP_OPCODE;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MmcPowerMode {
    Off = 0,
    Up = 1,
    On = 2,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MmcSignalVoltage {
    Voltage330 = 0,
    Voltage180 = 1,
    Voltage120 = 2,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MmcBusMode {
    OpenDrain = 1,
    PushPull = 2,
}

/// I/O settings the host is currently programmed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmcIos {
    /// Bus clock in Hz.
    pub clock: u64,
    /// Supply voltage in tenths of a volt (330 = 3.3 V).
    pub vdd: u16,
    pub power_mode: MmcPowerMode,
    pub bus_width: MmcBusWidth,
    pub timing: MmcTiming,
    pub signal_voltage: MmcSignalVoltage,
    pub bus_mode: MmcBusMode,
}

/// Fixed limits a host reports at init.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostInfo {
    pub max_frequency: u64,
    pub min_frequency: u64,
    pub max_blocks_per_req: u32,
    pub max_segments: u32,
}

/// Terminal and transient states of a command object.
///
/// A command moves from `Idle` to `InProgress` when issued and from
/// `InProgress` to exactly one terminal state, never backward and never
/// twice. `CardRemoved` is terminal and non-retryable; the other error
/// states observe the caller's retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdStatus {
    Idle,
    InProgress,
    Success,
    Aborted,
    Failed,
    IndexError,
    CmdTimeout,
    CmdCrcError,
    CmdEndBitError,
    DataTimeout,
    DataCrcError,
    DataEndBitError,
    CardRemoved,
}

impl CmdStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CmdStatus::Idle | CmdStatus::InProgress)
    }

    /// Whether the retry budget applies to this outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CmdStatus::Failed
                | CmdStatus::IndexError
                | CmdStatus::CmdTimeout
                | CmdStatus::CmdCrcError
                | CmdStatus::CmdEndBitError
                | CmdStatus::DataTimeout
                | CmdStatus::DataCrcError
                | CmdStatus::DataEndBitError
        )
    }

    /// Bus-level errors that feed the escalation counter.
    pub fn is_bus_error(&self) -> bool {
        matches!(
            self,
            CmdStatus::CmdTimeout
                | CmdStatus::CmdCrcError
                | CmdStatus::CmdEndBitError
                | CmdStatus::DataTimeout
                | CmdStatus::DataCrcError
                | CmdStatus::DataEndBitError
        )
    }
}

pub enum MmcDataFlag {
    SdmmcDataRead,
    SdmmcDataWrite,
}

/// Data descriptor attached to a command.
pub struct MmcData {
    /// Block (sector) size; 512 for everything this stack drives.
    pub blocksize: u32,
    /// Number of blocks to transfer.
    pub blockcnt: u32,
    pub flags: MmcDataFlag,
    pub sg: SgList,
}

/// A command drawn from the pool. Allocated by the caller and always freed
/// by that same caller, timeout or abort included.
pub struct SdmmcCmd {
    pub cmdidx: u32,
    pub resp_type: u32,
    pub cmdarg: u32,
    /// Application command; the dispatch engine sends the CMD55 prefix.
    pub app_cmd: bool,
    pub data: Option<MmcData>,
    pub response: [u32; 4],
    status: CmdStatus,
}

impl SdmmcCmd {
    pub fn new(cmdidx: u32, resp_type: u32, cmdarg: u32) -> SdmmcCmd {
        SdmmcCmd {
            cmdidx,
            resp_type,
            cmdarg,
            app_cmd: false,
            data: None,
            response: [0; 4],
            status: CmdStatus::Idle,
        }
    }

    pub fn app(cmdidx: u32, resp_type: u32, cmdarg: u32) -> SdmmcCmd {
        SdmmcCmd {
            app_cmd: true,
            ..SdmmcCmd::new(cmdidx, resp_type, cmdarg)
        }
    }

    pub fn with_data(cmdidx: u32, resp_type: u32, cmdarg: u32, data: MmcData) -> SdmmcCmd {
        SdmmcCmd {
            data: Some(data),
            ..SdmmcCmd::new(cmdidx, resp_type, cmdarg)
        }
    }

    pub(crate) fn idle() -> SdmmcCmd {
        SdmmcCmd::new(0, MMC_RSP_NONE, 0)
    }

    pub fn status(&self) -> CmdStatus {
        self.status
    }

    pub(crate) fn reset(&mut self) {
        self.cmdidx = 0;
        self.resp_type = MMC_RSP_NONE;
        self.cmdarg = 0;
        self.app_cmd = false;
        self.data = None;
        self.response = [0; 4];
        self.status = CmdStatus::Idle;
    }
}

/// Card slot notifications delivered to the consumer of this engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardEvent {
    Inserted,
    Removed,
}

pub type CardEventHook = Box<dyn Fn(CardEvent) + Send + Sync>;

struct ControllerInner {
    ios: MmcIos,
    /// Effective capability mask: host ∩ configuration ∩ card. Narrows
    /// only; a fresh identification pass is the only way bits return.
    caps: SdmmcCapability,
    device: Option<MmcDevice>,
    /// Address assigned during the current identification pass, before the
    /// device instance is installed.
    pending_rca: u16,
    card_present: bool,
    /// The single-owner token: true while a command occupies the slot.
    active: bool,
    /// Terminal outcome parked by the completion path for the waiter.
    finished: Option<(CmdStatus, [u32; 4])>,
    consecutive_bus_errors: u32,
    in_escalation: bool,
    users: u32,
    removal_pending: bool,
    last_activity: Instant,
    power_state: MmcPowerState,
}

/// One controller instance: one slot, one worker, one command in flight.
pub struct SdmmcController {
    hardware: Mutex<Box<dyn SdmmcHardware + Send>>,
    host_info: HostInfo,
    host_caps: u128,
    config: SdmmcConfig,
    inner: Mutex<ControllerInner>,
    /// Wakes the issue() waiter when its command completes.
    completion: Condvar,
    /// Wakes callers queued on the active-command token.
    slot_free: Condvar,
    /// Wakes teardown once the last user releases the device.
    gate: Condvar,
    /// Serializes identification, negotiation and escalation.
    setup_lock: Mutex<()>,
    events: mpsc::Sender<HostEvent>,
    hook: Mutex<Option<CardEventHook>>,
    pool: CmdPool,
    self_weak: Weak<SdmmcController>,
}

/// Default deadline for a single command rendezvous.
pub const CMD_TIMEOUT: Duration = Duration::from_secs(2);
/// Deadline for data transfers.
pub const DATA_TIMEOUT: Duration = Duration::from_secs(5);
/// Bound on the operating-condition negotiation loop.
const OCR_DEADLINE_MS: u64 = 1000;
/// Commands available per controller.
const CMD_POOL_SIZE: usize = 8;

impl SdmmcController {
    /// Bring up the host and start its worker. The returned controller is
    /// ready for card detection; no card command has been sent yet.
    pub fn attach(
        config: SdmmcConfig,
        mut hardware: Box<dyn SdmmcHardware + Send>,
    ) -> Result<Arc<SdmmcController>, SdmmcError> {
        let (ios, host_info, declared) = hardware.sdmmc_init()?;
        let host_caps = declared & !config.capability_mask();

        let (tx, rx) = mpsc::channel::<HostEvent>();

        let controller = Arc::new_cyclic(|weak| SdmmcController {
            hardware: Mutex::new(hardware),
            host_info,
            host_caps,
            config,
            inner: Mutex::new(ControllerInner {
                ios,
                caps: SdmmcCapability(host_caps),
                device: None,
                pending_rca: 0,
                card_present: false,
                active: false,
                finished: None,
                consecutive_bus_errors: 0,
                in_escalation: false,
                users: 0,
                removal_pending: false,
                last_activity: Instant::now(),
                power_state: MmcPowerState::Active,
            }),
            completion: Condvar::new(),
            slot_free: Condvar::new(),
            gate: Condvar::new(),
            setup_lock: Mutex::new(()),
            events: tx,
            hook: Mutex::new(None),
            pool: CmdPool::new(CMD_POOL_SIZE),
            self_weak: weak.clone(),
        });

        let weak = Arc::downgrade(&controller);
        thread::Builder::new()
            .name("sdmmc-worker".into())
            .spawn(move || {
                // Exits when the controller is dropped: the channel closes
                // and the upgrade fails.
                while let Ok(event) = rx.recv() {
                    let Some(ctrl) = weak.upgrade() else { break };
                    ctrl.process_event(event);
                }
            })
            .map_err(|_| SdmmcError::ENOMEM)?;

        info!(target: "sdmmc", "controller attached, caps {:#x}", host_caps);
        Ok(controller)
    }

    /// Queue handle for interrupt glue: the registered interrupt handler
    /// forwards hardware notifications through this sender.
    pub fn notifier(&self) -> mpsc::Sender<HostEvent> {
        self.events.clone()
    }

    /// Install the insertion/removal notification hook.
    pub fn set_card_hook(&self, hook: CardEventHook) {
        *self.hook.lock().unwrap() = Some(hook);
    }

    pub fn host_info(&self) -> HostInfo {
        self.host_info
    }

    pub fn config(&self) -> &SdmmcConfig {
        &self.config
    }

    pub fn capabilities(&self) -> u128 {
        self.inner.lock().unwrap().caps.0
    }

    /// Snapshot of the I/O settings currently programmed into the host.
    pub fn ios(&self) -> MmcIos {
        self.inner.lock().unwrap().ios.clone()
    }

    pub fn card_present(&self) -> bool {
        self.inner.lock().unwrap().card_present
    }

    pub fn card_state(&self) -> Option<MmcState> {
        self.inner.lock().unwrap().device.as_ref().map(|d| d.state())
    }

    pub fn card_sectors(&self) -> Option<u64> {
        self.inner.lock().unwrap().device.as_ref().map(|d| d.sectors())
    }

    pub fn needs_poll(&self) -> bool {
        self.host_caps & MMC_CAP_NEEDS_POLL != 0
    }

    /// Sample the card-detect line; used by the shared poller for hosts
    /// without a detect interrupt.
    pub fn poll_card_detect(&self) -> Result<bool, SdmmcError> {
        let mut hw = self.hardware.lock().unwrap();
        hw.sdmmc_card_detect()
    }

    // ---------------------------------------------------------------
    // Event path
    // ---------------------------------------------------------------

    fn process_event(&self, event: HostEvent) {
        let outcome = {
            let mut hw = self.hardware.lock().unwrap();
            hw.sdmmc_handle_event(event)
        };

        match outcome {
            Ok(HostEventOutcome::CmdComplete { status, response }) => {
                self.complete_command(status, response);
            }
            Ok(HostEventOutcome::CardChange { present }) => {
                self.card_event(present);
            }
            Ok(HostEventOutcome::DmaProgress) | Ok(HostEventOutcome::None) => {}
            Err(e) => warn!(target: "sdmmc", "event handler error: {:?}", e),
        }
    }

    /// The single completion rendezvous. Runs in host-event context: it
    /// records the terminal status, wakes the one waiter, and never
    /// blocks. A completion arriving after the slot was resolved (late
    /// interrupt after a timeout) is dropped.
    pub fn complete_command(&self, status: CmdStatus, response: [u32; 4]) {
        debug_assert!(status.is_terminal());
        let mut inner = self.inner.lock().unwrap();
        if inner.active && inner.finished.is_none() {
            inner.finished = Some((status, response));
            self.completion.notify_one();
        } else {
            trace!(target: "sdmmc", "dropping stale completion {:?}", status);
        }
    }

    // ---------------------------------------------------------------
    // Dispatch engine
    // ---------------------------------------------------------------

    /// Program one command and rendezvous with its completion.
    ///
    /// The active-command slot serializes concurrent callers. On deadline
    /// expiry the host's abort operation is invoked exactly once and the
    /// command ends as `CmdTimeout` unless the completion won the race.
    /// The command is never freed here, whatever the outcome.
    pub fn issue(&self, cmd: &mut SdmmcCmd, timeout: Duration) -> Result<(), SdmmcError> {
        // Take the single-owner token.
        {
            let mut inner = self.inner.lock().unwrap();
            while inner.active {
                inner = self.slot_free.wait(inner).unwrap();
            }
            if inner.removal_pending && cmd.cmdidx != MMC_CMD_GO_IDLE_STATE {
                cmd.status = CmdStatus::CardRemoved;
                return Err(SdmmcError::ENOCARD);
            }
            inner.active = true;
            inner.finished = None;
            inner.last_activity = Instant::now();
        }

        cmd.status = CmdStatus::InProgress;
        trace!(
            target: "sdmmc",
            "issue CMD{} arg {:#010x}",
            cmd.cmdidx,
            cmd.cmdarg
        );

        let sent = {
            let mut hw = self.hardware.lock().unwrap();
            hw.sdmmc_send_command(cmd, cmd.data.as_ref())
        };
        if let Err(e) = sent {
            cmd.status = CmdStatus::Failed;
            self.release_slot();
            return Err(e);
        }

        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        while inner.finished.is_none() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .completion
                .wait_timeout(inner, deadline - now)
                .unwrap();
            inner = guard;
        }

        match inner.finished.take() {
            Some((status, response)) => {
                cmd.status = status;
                cmd.response = response;
            }
            None => {
                // Deadline expired with the command still in flight.
                drop(inner);
                {
                    let mut hw = self.hardware.lock().unwrap();
                    if let Err(e) = hw.sdmmc_abort_command() {
                        warn!(target: "sdmmc", "abort failed: {:?}", e);
                    }
                }
                let mut reinner = self.inner.lock().unwrap();
                match reinner.finished.take() {
                    // Completion slipped in between expiry and abort; its
                    // terminal state stands.
                    Some((status, response)) => {
                        cmd.status = status;
                        cmd.response = response;
                    }
                    None => cmd.status = CmdStatus::CmdTimeout,
                }
                drop(reinner);
                self.release_slot();
                return self.map_status(cmd.status);
            }
        }
        drop(inner);
        self.release_slot();
        self.map_status(cmd.status)
    }

    fn release_slot(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.active = false;
        inner.finished = None;
        drop(inner);
        self.slot_free.notify_one();
    }

    fn map_status(&self, status: CmdStatus) -> Result<(), SdmmcError> {
        match status {
            CmdStatus::Success => Ok(()),
            CmdStatus::CardRemoved => Err(SdmmcError::ENOCARD),
            CmdStatus::CmdTimeout | CmdStatus::DataTimeout => Err(SdmmcError::ETIMEDOUT),
            _ => Err(SdmmcError::EIO),
        }
    }

    /// Protocol-level wrapper around [`issue`]: application-command
    /// prefix, block-count pre-programming, ready-for-data polling and a
    /// bounded retry loop. Illegal-command responses and removed cards are
    /// never retried.
    pub fn send(
        &self,
        cmd: &mut SdmmcCmd,
        timeout: Duration,
        retries: u32,
    ) -> Result<(), SdmmcError> {
        self.ensure_awake();

        let mut attempt = 0u32;
        loop {
            if self.removed() {
                cmd.status = CmdStatus::CardRemoved;
                return Err(SdmmcError::ENOCARD);
            }

            if cmd.app_cmd {
                let rca = self.current_rca();
                let mut prefix =
                    SdmmcCmd::new(MMC_CMD_APP_CMD, MMC_RSP_R1, (rca as u32) << 16);
                if let Err(e) = self.issue(&mut prefix, timeout) {
                    if !self.retry_failed(&prefix, &mut attempt, retries)? {
                        cmd.status = prefix.status;
                        return Err(e);
                    }
                    continue;
                }
            }

            // Hosts without automatic block-count addressing get CMD23
            // ahead of multi-block transfers, when the card understands it.
            if let Some(data) = &cmd.data {
                if data.blockcnt > 1
                    && self.host_caps & MMC_CAP_AUTO_CMD23 == 0
                    && self.card_supports_cmd23()
                {
                    let mut setcnt =
                        SdmmcCmd::new(MMC_CMD_SET_BLOCK_COUNT, MMC_RSP_R1, data.blockcnt);
                    if let Err(e) = self.issue(&mut setcnt, timeout) {
                        if !self.retry_failed(&setcnt, &mut attempt, retries)? {
                            cmd.status = setcnt.status;
                            return Err(e);
                        }
                        continue;
                    }
                }
            }

            let res = self.issue(cmd, timeout);
            match res {
                Ok(()) => {
                    // Busy-signalled commands on hosts without hardware
                    // busy detection: poll until the card is out of the
                    // programming state.
                    if cmd.resp_type == MMC_RSP_R1B
                        && self.host_caps & MMC_CAP_BUSY_DETECT == 0
                    {
                        self.wait_ready(timeout)?;
                    }
                    self.inner.lock().unwrap().consecutive_bus_errors = 0;
                    return Ok(());
                }
                Err(e) => {
                    if !self.retry_failed(cmd, &mut attempt, retries)? {
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Shared failure policy for send(). `Ok(true)` means try again.
    fn retry_failed(
        &self,
        cmd: &SdmmcCmd,
        attempt: &mut u32,
        retries: u32,
    ) -> Result<bool, SdmmcError> {
        let status = cmd.status;

        if status == CmdStatus::CardRemoved {
            return Err(SdmmcError::ENOCARD);
        }
        if cmd.response[0] & R1_ILLEGAL_COMMAND != 0 {
            debug!(target: "sdmmc", "CMD{} rejected as illegal", cmd.cmdidx);
            return Err(SdmmcError::EILLEGAL);
        }

        if status.is_bus_error() {
            self.inner.lock().unwrap().consecutive_bus_errors += 1;
        }

        if !status.is_retryable() || *attempt >= retries {
            return Ok(false);
        }
        *attempt += 1;
        debug!(
            target: "sdmmc",
            "retrying CMD{} after {:?} ({}/{})",
            cmd.cmdidx,
            status,
            attempt,
            retries
        );
        Ok(true)
    }

    /// Poll CMD13 until the card reports ready-for-data and has left the
    /// programming state.
    fn wait_ready(&self, timeout: Duration) -> Result<(), SdmmcError> {
        let rca = self.current_rca();
        let deadline = Deadline::after(timeout);
        loop {
            let mut cmd =
                SdmmcCmd::new(MMC_CMD_SEND_STATUS, MMC_RSP_R1, (rca as u32) << 16);
            self.issue(&mut cmd, CMD_TIMEOUT)?;
            let status = cmd.response[0];
            let state = (status & R1_CURRENT_STATE_MASK) >> R1_CURRENT_STATE_SHIFT;
            if status & R1_READY_FOR_DATA != 0 && state != R1_STATE_PRG {
                return Ok(());
            }
            if deadline.expired() {
                return Err(SdmmcError::ETIMEDOUT);
            }
            poll_wait(Duration::from_millis(1));
        }
    }

    fn removed(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.removal_pending || (!inner.card_present && inner.device.is_some())
    }

    fn current_rca(&self) -> u16 {
        let inner = self.inner.lock().unwrap();
        inner
            .device
            .as_ref()
            .map(|d| d.rca())
            .unwrap_or(inner.pending_rca)
    }

    fn card_supports_cmd23(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.device.as_ref() {
            Some(MmcDevice::Sdcard(sd)) => sd
                .card_config
                .as_ref()
                .map(|scr| scr.supports_cmd23)
                .unwrap_or(false),
            Some(MmcDevice::EMmc(mmc)) => mmc.card_specific_data.spec_vers >= 4,
            None => false,
        }
    }

    fn ensure_awake(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_activity = Instant::now();
        if inner.power_state == MmcPowerState::Active {
            return;
        }
        inner.power_state = MmcPowerState::Active;
        drop(inner);
        let mut hw = self.hardware.lock().unwrap();
        if let Err(e) = hw.sdmmc_set_power_state(MmcPowerState::Active) {
            warn!(target: "sdmmc", "wakeup failed: {:?}", e);
        }
    }

    /// Idle/sleep power management driven by the shared poller. Moves the
    /// host down one state at a time once the configured delays elapse
    /// without bus activity.
    pub fn pm_tick(&self) {
        let (Some(idle_ms), Some(sleep_ms)) = (self.config.pm_idle_ms, self.config.pm_sleep_ms)
        else {
            return;
        };

        let mut inner = self.inner.lock().unwrap();
        if inner.active {
            return;
        }
        let idle_for = inner.last_activity.elapsed();
        let next = match inner.power_state {
            MmcPowerState::Active if idle_for >= Duration::from_millis(idle_ms as u64) => {
                MmcPowerState::Idle
            }
            MmcPowerState::Idle if idle_for >= Duration::from_millis(sleep_ms as u64) => {
                MmcPowerState::Sleep
            }
            _ => return,
        };
        inner.power_state = next;
        drop(inner);

        debug!(target: "sdmmc", "power state -> {:?}", next);
        let mut hw = self.hardware.lock().unwrap();
        if let Err(e) = hw.sdmmc_set_power_state(next) {
            warn!(target: "sdmmc", "power transition failed: {:?}", e);
        }
    }

    // ---------------------------------------------------------------
    // Card detect, usage gating and teardown
    // ---------------------------------------------------------------

    /// Edge-triggered card-detect input, fed by the worker (interrupt
    /// hosts) or the shared poller. Repeated reports of an unchanged state
    /// are ignored, so a poller sampling faster than the card moves still
    /// produces exactly one notification per transition.
    pub fn card_event(&self, present: bool) {
        let mut inner = self.inner.lock().unwrap();
        if present == inner.card_present {
            return;
        }

        if present {
            inner.card_present = true;
            drop(inner);
            info!(target: "sdmmc", "card inserted");
            self.run_hook(CardEvent::Inserted);
            // Bring-up must not run on the worker that delivers command
            // completions, so it gets its own short-lived thread.
            if let Some(ctrl) = self.self_weak.upgrade() {
                let _ = thread::Builder::new()
                    .name("sdmmc-bringup".into())
                    .spawn(move || {
                        if let Err(e) = ctrl.setup_card() {
                            warn!(target: "sdmmc", "card setup failed: {:?}", e);
                            return;
                        }
                        if let Err(e) = ctrl.tune_performance() {
                            warn!(target: "sdmmc", "bus negotiation failed: {:?}", e);
                        }
                    });
            }
        } else {
            inner.card_present = false;
            if inner.device.is_none() {
                return;
            }
            inner.removal_pending = true;
            // Escalate an in-flight command to its removed terminal state.
            if inner.active && inner.finished.is_none() {
                inner.finished = Some((CmdStatus::CardRemoved, [0; 4]));
                self.completion.notify_one();
            }
            let idle = inner.users == 0;
            if idle {
                Self::finish_teardown(&mut inner);
            }
            drop(inner);
            info!(target: "sdmmc", "card removed");
            self.run_hook(CardEvent::Removed);
            if idle {
                self.gate.notify_all();
            }
        }
    }

    fn run_hook(&self, event: CardEvent) {
        if let Some(hook) = self.hook.lock().unwrap().as_ref() {
            hook(event);
        }
    }

    /// Take a usage reference on the device. Refused once removal is
    /// pending, so teardown cannot be delayed indefinitely by new users.
    pub fn acquire_device(&self) -> Result<(), SdmmcError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.removal_pending || inner.device.is_none() {
            return Err(SdmmcError::ENOCARD);
        }
        inner.users += 1;
        Ok(())
    }

    pub fn release_device(&self) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(inner.users > 0);
        inner.users -= 1;
        if inner.users == 0 && inner.removal_pending {
            Self::finish_teardown(&mut inner);
            drop(inner);
            self.gate.notify_all();
        }
    }

    fn finish_teardown(inner: &mut ControllerInner) {
        // The device instance is rebuilt from zero on the next insertion.
        inner.device = None;
        inner.removal_pending = false;
        inner.consecutive_bus_errors = 0;
        inner.caps = SdmmcCapability(0);
    }

    /// Block until a pending removal has fully torn down. Explicit
    /// wait/notify, not a spin.
    pub fn wait_teardown(&self) {
        let mut inner = self.inner.lock().unwrap();
        while inner.removal_pending {
            inner = self.gate.wait(inner).unwrap();
        }
    }

    // ---------------------------------------------------------------
    // Identification
    // ---------------------------------------------------------------

    /// Full identification pass: reset addressing, negotiate operating
    /// conditions, read identity and metadata, select the card, reconcile
    /// errata and derive the capability set. Leaves the bus in legacy
    /// timing; call [`tune_performance`] afterwards.
    pub fn setup_card(&self) -> Result<(), SdmmcError> {
        let _setup = self.setup_lock.lock().unwrap();
        self.identify(false)
    }

    /// Re-identification after a bus-error reset: the fresh CID must match
    /// the cached one, cached metadata is not re-parsed, and the narrowed
    /// capability mask is kept.
    fn reidentify(&self) -> Result<(), SdmmcError> {
        self.identify(true)
    }

    fn identify(&self, reident: bool) -> Result<(), SdmmcError> {
        {
            let mut hw = self.hardware.lock().unwrap();
            hw.sdmmc_set_power(MmcPowerMode::On)?;
            let clock = hw.sdmmc_config_clock(self.config.clock.unwrap_or(INIT_CLOCK_RATE))?;
            hw.sdmmc_config_bus_width(MmcBusWidth::Width1)?;
            hw.sdmmc_config_bus_mode(MmcBusMode::OpenDrain)?;
            hw.sdmmc_config_timing(MmcTiming::CardSetup)?;

            let mut inner = self.inner.lock().unwrap();
            inner.ios.clock = clock;
            inner.ios.bus_width = MmcBusWidth::Width1;
            inner.ios.bus_mode = MmcBusMode::OpenDrain;
            inner.ios.timing = MmcTiming::CardSetup;
            inner.pending_rca = 0;
            if !reident {
                inner.caps = SdmmcCapability(self.host_caps);
                inner.device = None;
            }
        }

        let mut cmd = SdmmcCmd::new(MMC_CMD_GO_IDLE_STATE, MMC_RSP_NONE, 0);
        self.issue(&mut cmd, CMD_TIMEOUT)?;

        // SD cards answer CMD8 by echoing the check pattern; anything else
        // is either eMMC or an unsupported legacy part.
        let mut ifcond = SdmmcCmd::new(SD_CMD_SEND_IF_COND, MMC_RSP_R7, SD_IF_COND_ARG);
        let is_sd = !self.config.emmc
            && self.issue(&mut ifcond, CMD_TIMEOUT).is_ok()
            && ifcond.response[0] & 0xFFF == SD_IF_COND_ARG & 0xFFF;

        let device = if is_sd {
            self.identify_sdcard(reident)?
        } else {
            self.identify_emmc(reident)?
        };

        {
            let mut hw = self.hardware.lock().unwrap();
            hw.sdmmc_config_bus_mode(MmcBusMode::PushPull)?;
            hw.sdmmc_config_timing(MmcTiming::Legacy)?;
            let clock = hw.sdmmc_config_clock(MmcTiming::Legacy.frequency())?;
            let mut inner = self.inner.lock().unwrap();
            inner.ios.bus_mode = MmcBusMode::PushPull;
            inner.ios.timing = MmcTiming::Legacy;
            inner.ios.clock = clock;
            inner.card_present = true;
            inner.device = Some(device);
            inner.consecutive_bus_errors = 0;
        }

        info!(target: "sdmmc", "identification complete");
        Ok(())
    }

    fn identify_sdcard(&self, reident: bool) -> Result<MmcDevice, SdmmcError> {
        // ACMD41 negotiation, bounded by wall clock and watching the
        // power-up-complete bit.
        let deadline = Deadline::after_ms(OCR_DEADLINE_MS);
        let mut ocr;
        loop {
            let mut arg = OCR_HCS | ((MMC_VDD_32_33 | MMC_VDD_33_34) & OCR_VOLTAGE_MASK);
            if self.host_caps & MMC_CAP_VOLTAGE_180 != 0 {
                arg |= OCR_S18R | MMC_VDD_165_195;
            }
            let mut cmd = SdmmcCmd::app(SD_CMD_APP_SEND_OP_COND, MMC_RSP_R3, arg);
            self.send(&mut cmd, CMD_TIMEOUT, 0)?;
            ocr = cmd.response[0];
            if ocr & OCR_BUSY != 0 {
                break;
            }
            if deadline.expired() {
                return Err(SdmmcError::EUNSUPPORTEDCARD);
            }
            poll_wait(Duration::from_millis(10));
        }
        let high_capacity = ocr & OCR_CCS != 0;

        let (card_id, cid_resp) = self.broadcast_cid(reident)?;

        let mut rca_cmd = SdmmcCmd::new(SD_CMD_SEND_RELATIVE_ADDR, MMC_RSP_R6, 0);
        self.issue(&mut rca_cmd, CMD_TIMEOUT)?;
        let rca = (rca_cmd.response[0] >> 16) as u16;
        self.inner.lock().unwrap().pending_rca = rca;

        if reident {
            return self.rebind_cached(rca);
        }

        let mut csd_cmd = SdmmcCmd::new(MMC_CMD_SEND_CSD, MMC_RSP_R2, (rca as u32) << 16);
        self.issue(&mut csd_cmd, CMD_TIMEOUT)?;
        let (csd, card_version) = Csd::new(csd_cmd.response)?;
        let cid = Cid::new(cid_resp);

        self.select_card(rca)?;
        let locked = self.read_locked(rca)?;

        // SCR informs 4-bit support and CMD23; skipped on locked cards.
        let card_config = if locked { None } else { self.read_scr().ok() };

        let write_protected = csd.perm_write_protect || csd.tmp_write_protect;
        let mut card = Sdcard {
            card_id,
            manufacture_info: cid,
            card_specific_data: csd,
            card_version,
            relative_card_addr: rca,
            card_state: MmcState {
                timing: MmcTiming::Legacy,
                bus_width: MmcBusWidth::Width1,
            },
            card_config,
            ocr,
            high_capacity,
            locked,
            write_protected,
            block_len: SDMMC_DEFAULT_BLOCK_LEN,
        };
        self.derive_caps_sd(&mut card);
        Ok(MmcDevice::Sdcard(card))
    }

    fn identify_emmc(&self, reident: bool) -> Result<MmcDevice, SdmmcError> {
        let deadline = Deadline::after_ms(OCR_DEADLINE_MS);
        let mut ocr;
        loop {
            let arg = OCR_ACCESS_MODE_SECTOR | ((MMC_VDD_32_33 | MMC_VDD_33_34) & OCR_VOLTAGE_MASK);
            let mut cmd = SdmmcCmd::new(MMC_CMD_SEND_OP_COND, MMC_RSP_R3, arg);
            self.issue(&mut cmd, CMD_TIMEOUT)?;
            ocr = cmd.response[0];
            if ocr & OCR_BUSY != 0 {
                break;
            }
            if deadline.expired() {
                return Err(SdmmcError::EUNSUPPORTEDCARD);
            }
            poll_wait(Duration::from_millis(10));
        }
        let high_capacity = ocr & OCR_ACCESS_MODE_SECTOR != 0;

        let (card_id, cid_resp) = self.broadcast_cid(reident)?;

        // eMMC gets its address assigned by the host.
        let rca: u16 = 1;
        let mut rca_cmd =
            SdmmcCmd::new(MMC_CMD_SET_RELATIVE_ADDR, MMC_RSP_R1, (rca as u32) << 16);
        self.issue(&mut rca_cmd, CMD_TIMEOUT)?;
        self.inner.lock().unwrap().pending_rca = rca;

        if reident {
            return self.rebind_cached(rca);
        }

        let mut csd_cmd = SdmmcCmd::new(MMC_CMD_SEND_CSD, MMC_RSP_R2, (rca as u32) << 16);
        self.issue(&mut csd_cmd, CMD_TIMEOUT)?;
        let csd = MmcCsd::new(csd_cmd.response)?;
        let cid = MmcCid::new(cid_resp);

        self.select_card(rca)?;
        let locked = self.read_locked(rca)?;

        // Extended CSD exists from spec version 4 on and is unreadable
        // while the card is locked.
        let ext_csd = if csd.spec_vers >= 4 && !locked {
            Some(self.read_ext_csd(rca)?)
        } else {
            None
        };

        let write_protected = csd.perm_write_protect || csd.tmp_write_protect;
        let mut card = EMmc {
            card_id,
            manufacture_info: cid,
            card_specific_data: csd,
            relative_card_addr: rca,
            card_state: MmcState {
                timing: MmcTiming::Legacy,
                bus_width: MmcBusWidth::Width1,
            },
            ext_csd,
            ocr,
            high_capacity,
            locked,
            write_protected,
            block_len: SDMMC_DEFAULT_BLOCK_LEN,
            erase_group_def: false,
        };

        // Prefer the high-capacity erase geometry when the part has one.
        if card
            .ext_csd
            .as_ref()
            .map(|e| e.hc_erase_grp_size > 0)
            .unwrap_or(false)
        {
            if self.mmc_switch(EXT_CSD_ERASE_GROUP_DEF, 1, &card).is_ok() {
                card.erase_group_def = true;
            }
        }

        self.derive_caps_mmc(&mut card);
        Ok(MmcDevice::EMmc(card))
    }

    /// CMD2, plus the swapped-card check in re-identify mode.
    fn broadcast_cid(&self, reident: bool) -> Result<(u128, [u32; 4]), SdmmcError> {
        let mut cmd = SdmmcCmd::new(MMC_CMD_ALL_SEND_CID, MMC_RSP_R2, 0);
        self.issue(&mut cmd, CMD_TIMEOUT)?;
        let card_id = bit_field::resp_to_u128(cmd.response);

        if reident {
            let cached = self
                .inner
                .lock()
                .unwrap()
                .device
                .as_ref()
                .map(|d| d.card_id());
            if cached != Some(card_id) {
                warn!(target: "sdmmc", "different card found during re-identification");
                return Err(SdmmcError::ECARDCHANGED);
            }
        }
        Ok((card_id, cmd.response))
    }

    /// Re-identify keeps the cached metadata; only the bus-facing state is
    /// refreshed.
    fn rebind_cached(&self, rca: u16) -> Result<MmcDevice, SdmmcError> {
        self.select_card(rca)?;
        let mut inner = self.inner.lock().unwrap();
        let mut device = inner.device.take().ok_or(SdmmcError::EUNDEFINED)?;
        device.set_state(MmcState {
            timing: MmcTiming::Legacy,
            bus_width: MmcBusWidth::Width1,
        });
        device.set_block_len(SDMMC_DEFAULT_BLOCK_LEN);
        Ok(device)
    }

    fn select_card(&self, rca: u16) -> Result<(), SdmmcError> {
        let mut cmd = SdmmcCmd::new(MMC_CMD_SELECT_CARD, MMC_RSP_R1, (rca as u32) << 16);
        self.issue(&mut cmd, CMD_TIMEOUT)
    }

    fn read_locked(&self, rca: u16) -> Result<bool, SdmmcError> {
        let mut cmd = SdmmcCmd::new(MMC_CMD_SEND_STATUS, MMC_RSP_R1, (rca as u32) << 16);
        self.issue(&mut cmd, CMD_TIMEOUT)?;
        Ok(cmd.response[0] & R1_CARD_IS_LOCKED != 0)
    }

    fn read_scr(&self) -> Result<Scr, SdmmcError> {
        let mut buf = [0u8; 8];
        let data = MmcData {
            blocksize: 8,
            blockcnt: 1,
            flags: MmcDataFlag::SdmmcDataRead,
            sg: SgList::single(buf.as_mut_ptr() as u64, 8),
        };
        // The CMD55 prefix carries the card address.
        let mut cmd = SdmmcCmd::with_data(SD_CMD_APP_SEND_SCR, MMC_RSP_R1, 0, data);
        cmd.app_cmd = true;
        self.send(&mut cmd, CMD_TIMEOUT, 1)?;

        // Register data arrives big-endian on the wire.
        let raw = u64::from_be_bytes(buf);
        Scr::new(raw)
    }

    fn read_ext_csd(&self, _rca: u16) -> Result<ExtCsd, SdmmcError> {
        let mut buf = vec![0u8; EXT_CSD_LEN];
        let data = MmcData {
            blocksize: EXT_CSD_LEN as u32,
            blockcnt: 1,
            flags: MmcDataFlag::SdmmcDataRead,
            sg: SgList::single(buf.as_mut_ptr() as u64, EXT_CSD_LEN as u32),
        };
        let mut cmd = SdmmcCmd::with_data(MMC_CMD_SEND_EXT_CSD, MMC_RSP_R1, 0, data);
        self.send(&mut cmd, DATA_TIMEOUT, 1)?;

        let raw: &[u8; EXT_CSD_LEN] = buf
            .as_slice()
            .try_into()
            .map_err(|_| SdmmcError::EUNDEFINED)?;
        Ok(ExtCsd::parse(raw))
    }

    /// CMD6 write-byte switch with status polling bounded by the card's
    /// declared CMD6 time.
    fn mmc_switch(&self, index: usize, value: u8, card: &EMmc) -> Result<(), SdmmcError> {
        let mut cmd = SdmmcCmd::new(MMC_CMD_SWITCH, MMC_RSP_R1B, mmc_switch_arg(index, value));
        let cmd6_ms = card
            .ext_csd
            .as_ref()
            .map(|e| e.generic_cmd6_time_ms.max(500))
            .unwrap_or(500) as u64;
        self.send(&mut cmd, Duration::from_millis(cmd6_ms), 0)?;
        if cmd.response[0] & R1_SWITCH_ERROR != 0 {
            return Err(SdmmcError::EIO);
        }
        Ok(())
    }

    /// Intersect the identified card's abilities into the capability mask
    /// and reconcile the errata table. Tier flags for the device are set
    /// here, once; only the escalation path clears them afterwards.
    fn derive_caps_sd(&self, card: &mut Sdcard) {
        let mut card_caps = MMC_TIMING_LEGACY;
        if card.card_version != SdVersion::V1_0 {
            card_caps |= MMC_TIMING_SD_HS;
        }
        if card
            .card_config
            .as_ref()
            .map(|scr| scr.sd_spec3)
            .unwrap_or(false)
        {
            card_caps |= MMC_TIMING_UHS_SDR50 | MMC_TIMING_UHS_SDR104 | MMC_TIMING_UHS_DDR50;
        }
        if card
            .card_config
            .as_ref()
            .map(|scr| scr.supports_4bit())
            // Without an SCR assume 4-bit; every SD 2.0 part has it.
            .unwrap_or(true)
        {
            card_caps |= MMC_CAP_4_BIT_DATA;
        }
        if card.high_capacity {
            card_caps |= MMC_CAP_HIGH_CAPACITY;
        }
        card_caps |= MMC_CAP_TRIM;

        let narrowed = quirks::reconcile(
            card.manufacture_info.manufacturer_id,
            card.manufacture_info.oem_id,
            &card.manufacture_info.product_name,
            card.manufacture_info.product_revision,
            card_caps,
        );

        let mut inner = self.inner.lock().unwrap();
        inner.caps = SdmmcCapability(inner.caps.0 & (narrowed | HOST_ONLY_MASK));
    }

    fn derive_caps_mmc(&self, card: &mut EMmc) {
        let mut card_caps = MMC_TIMING_LEGACY;
        if let Some(ext) = &card.ext_csd {
            if ext.supports_hs52() {
                card_caps |= MMC_TIMING_MMC_HS;
            }
            if ext.supports_ddr52() {
                card_caps |= MMC_TIMING_MMC_DDR52;
            }
            if ext.supports_hs200() {
                card_caps |= MMC_TIMING_MMC_HS200;
            }
            if ext.supports_hs400() {
                card_caps |= MMC_TIMING_MMC_HS400;
            }
            if ext.supports_trim() {
                card_caps |= MMC_CAP_TRIM;
            }
            if ext.supports_secure_erase() {
                card_caps |= MMC_CAP_SECURE_ERASE;
            }
            if ext.has_cache() {
                card_caps |= MMC_CAP_CACHE;
            }
        }
        card_caps |= MMC_CAP_4_BIT_DATA | MMC_CAP_8_BIT_DATA;
        if card.high_capacity {
            card_caps |= MMC_CAP_HIGH_CAPACITY;
        }

        let narrowed = quirks::reconcile(
            card.manufacture_info.manufacturer_id,
            card.manufacture_info.oem_id,
            &card.manufacture_info.product_name,
            card.manufacture_info.product_revision,
            card_caps,
        );

        let mut inner = self.inner.lock().unwrap();
        inner.caps = SdmmcCapability(inner.caps.0 & (narrowed | HOST_ONLY_MASK));
    }

    // ---------------------------------------------------------------
    // Bus negotiation
    // ---------------------------------------------------------------

    /// Climb the timing ladder, highest tier first. A tier that fails
    /// leaves its flag unset and the ladder proceeds; negotiation itself
    /// never fails identification.
    pub fn tune_performance(&self) -> Result<(), SdmmcError> {
        let _setup = self.setup_lock.lock().unwrap();

        let kind = {
            let inner = self.inner.lock().unwrap();
            inner.device.as_ref().ok_or(SdmmcError::ENOCARD)?.kind()
        };

        match kind {
            CardKind::Mmc => self.negotiate_emmc()?,
            CardKind::Sd => self.negotiate_sdcard()?,
        }
        self.finalize_block_length()
    }

    fn caps_snapshot(&self) -> u128 {
        self.inner.lock().unwrap().caps.0
    }

    fn drop_tier(&self, tier: u128) {
        self.inner.lock().unwrap().caps.0 &= !tier;
    }

    fn apply_state(&self, state: MmcState, clock: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.ios.bus_width = state.bus_width;
        inner.ios.timing = state.timing;
        inner.ios.clock = clock;
        if let Some(device) = inner.device.as_mut() {
            device.set_state(state);
        }
    }

    fn negotiate_emmc(&self) -> Result<(), SdmmcError> {
        let caps = self.caps_snapshot();
        let width = self.best_mmc_width(caps);

        // Tier 1: HS400 layered over a tuned HS200 bus.
        if caps & MMC_TIMING_MMC_HS400 != 0 && width == MmcBusWidth::Width8 {
            match self.try_mmc_hs400() {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(target: "sdmmc", "HS400 not reached: {:?}", e);
                    self.drop_tier(MMC_TIMING_MMC_HS400);
                    self.recover_legacy()?;
                }
            }
        }

        // Tier 2: HS200, tuned, no DDR layering.
        let caps = self.caps_snapshot();
        if caps & MMC_TIMING_MMC_HS200 != 0 && width >= MmcBusWidth::Width4 {
            match self.try_mmc_hs200(width) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(target: "sdmmc", "HS200 not reached: {:?}", e);
                    self.drop_tier(MMC_TIMING_MMC_HS200);
                    self.recover_legacy()?;
                }
            }
        }

        // Tier 3: plain high speed.
        let caps = self.caps_snapshot();
        if caps & MMC_TIMING_MMC_HS != 0 {
            match self.try_mmc_hs(width) {
                Ok(()) => {
                    // Optionally layer non-tuned DDR on a wide high-speed
                    // bus.
                    let caps = self.caps_snapshot();
                    if caps & MMC_TIMING_MMC_DDR52 != 0 && width >= MmcBusWidth::Width4 {
                        if let Err(e) = self.try_mmc_ddr52(width) {
                            debug!(target: "sdmmc", "DDR52 not reached: {:?}", e);
                            self.drop_tier(MMC_TIMING_MMC_DDR52);
                        }
                    }
                    return Ok(());
                }
                Err(e) => {
                    debug!(target: "sdmmc", "high speed not reached: {:?}", e);
                    self.drop_tier(MMC_TIMING_MMC_HS);
                    self.recover_legacy()?;
                }
            }
        }

        // Fallback: legacy timing at the CSD-derived rate, widened if the
        // bus allows it.
        self.legacy_fallback(width)
    }

    fn best_mmc_width(&self, caps: u128) -> MmcBusWidth {
        if caps & MMC_CAP_8_BIT_DATA != 0 {
            MmcBusWidth::Width8
        } else if caps & MMC_CAP_4_BIT_DATA != 0 {
            MmcBusWidth::Width4
        } else {
            MmcBusWidth::Width1
        }
    }

    /// Preferred-first list of signal voltages for the tuned eMMC tiers.
    fn switch_voltage_mmc(&self) -> Result<MmcSignalVoltage, SdmmcError> {
        let caps = self.caps_snapshot();
        let mut prefer = Vec::new();
        if caps & MMC_CAP_VOLTAGE_120 != 0 {
            prefer.push(MmcSignalVoltage::Voltage120);
        }
        if caps & MMC_CAP_VOLTAGE_180 != 0 {
            prefer.push(MmcSignalVoltage::Voltage180);
        }
        if prefer.is_empty() {
            return Err(SdmmcError::EUNSUPPORTEDCARD);
        }
        let mut hw = self.hardware.lock().unwrap();
        for voltage in prefer {
            if hw.sdmmc_config_signal_voltage(voltage).is_ok() {
                let mut inner = self.inner.lock().unwrap();
                inner.ios.signal_voltage = voltage;
                return Ok(voltage);
            }
        }
        Err(SdmmcError::EIO)
    }

    fn mmc_switch_current(&self, index: usize, value: u8) -> Result<(), SdmmcError> {
        let cmd6_ms = {
            let inner = self.inner.lock().unwrap();
            match inner.device.as_ref() {
                Some(MmcDevice::EMmc(card)) => card
                    .ext_csd
                    .as_ref()
                    .map(|e| e.generic_cmd6_time_ms.max(500))
                    .unwrap_or(500) as u64,
                _ => return Err(SdmmcError::EUNDEFINED),
            }
        };
        let mut cmd = SdmmcCmd::new(MMC_CMD_SWITCH, MMC_RSP_R1B, mmc_switch_arg(index, value));
        self.send(&mut cmd, Duration::from_millis(cmd6_ms), 0)?;
        if cmd.response[0] & R1_SWITCH_ERROR != 0 {
            return Err(SdmmcError::EIO);
        }
        Ok(())
    }

    fn set_host_width(&self, width: MmcBusWidth) -> Result<(), SdmmcError> {
        let mut hw = self.hardware.lock().unwrap();
        hw.sdmmc_config_bus_width(width)
    }

    fn set_host_timing(&self, timing: MmcTiming) -> Result<u64, SdmmcError> {
        let mut hw = self.hardware.lock().unwrap();
        if self.host_caps & MMC_CAP_PRESET != 0 {
            let _ = hw.sdmmc_config_preset(true);
        }
        hw.sdmmc_config_timing(timing)?;
        let clock = timing.frequency().min(self.host_info.max_frequency);
        hw.sdmmc_config_clock(clock)
    }

    fn run_tuning(&self, timing: MmcTiming) -> Result<(), SdmmcError> {
        let mut hw = self.hardware.lock().unwrap();
        hw.sdmmc_execute_tuning(timing)
    }

    fn mmc_width_byte(width: MmcBusWidth, ddr: bool) -> u8 {
        match (width, ddr) {
            (MmcBusWidth::Width8, true) => EXT_CSD_DDR_BUS_WIDTH_8,
            (MmcBusWidth::Width4, true) => EXT_CSD_DDR_BUS_WIDTH_4,
            (MmcBusWidth::Width8, false) => EXT_CSD_BUS_WIDTH_8,
            (MmcBusWidth::Width4, false) => EXT_CSD_BUS_WIDTH_4,
            (MmcBusWidth::Width1, _) => EXT_CSD_BUS_WIDTH_1,
        }
    }

    fn try_mmc_hs200(&self, width: MmcBusWidth) -> Result<(), SdmmcError> {
        self.switch_voltage_mmc()?;
        self.mmc_switch_current(EXT_CSD_BUS_WIDTH, Self::mmc_width_byte(width, false))?;
        self.set_host_width(width)?;
        self.mmc_switch_current(EXT_CSD_HS_TIMING, EXT_CSD_TIMING_HS200)?;
        let clock = self.set_host_timing(MmcTiming::MmcHs200)?;
        self.run_tuning(MmcTiming::MmcHs200)?;
        self.apply_state(
            MmcState {
                timing: MmcTiming::MmcHs200,
                bus_width: width,
            },
            clock,
        );
        info!(target: "sdmmc", "bus at HS200 x{}", width.lanes());
        Ok(())
    }

    fn try_mmc_hs400(&self) -> Result<(), SdmmcError> {
        // HS400 is entered through tuned HS200, then the DDR width/timing
        // pair is layered on top at high-speed clock.
        self.try_mmc_hs200(MmcBusWidth::Width8)?;

        self.mmc_switch_current(EXT_CSD_HS_TIMING, EXT_CSD_TIMING_HS)?;
        self.set_host_timing(MmcTiming::MmcHs)?;
        self.mmc_switch_current(EXT_CSD_BUS_WIDTH, EXT_CSD_DDR_BUS_WIDTH_8)?;
        self.mmc_switch_current(EXT_CSD_HS_TIMING, EXT_CSD_TIMING_HS400)?;
        let clock = self.set_host_timing(MmcTiming::MmcHs400)?;
        self.apply_state(
            MmcState {
                timing: MmcTiming::MmcHs400,
                bus_width: MmcBusWidth::Width8,
            },
            clock,
        );
        info!(target: "sdmmc", "bus at HS400 x8");
        Ok(())
    }

    fn try_mmc_hs(&self, width: MmcBusWidth) -> Result<(), SdmmcError> {
        self.mmc_switch_current(EXT_CSD_HS_TIMING, EXT_CSD_TIMING_HS)?;
        if width != MmcBusWidth::Width1 {
            self.mmc_switch_current(EXT_CSD_BUS_WIDTH, Self::mmc_width_byte(width, false))?;
            self.set_host_width(width)?;
        }
        let clock = self.set_host_timing(MmcTiming::MmcHs)?;
        self.apply_state(
            MmcState {
                timing: MmcTiming::MmcHs,
                bus_width: width,
            },
            clock,
        );
        info!(target: "sdmmc", "bus at high speed x{}", width.lanes());
        Ok(())
    }

    fn try_mmc_ddr52(&self, width: MmcBusWidth) -> Result<(), SdmmcError> {
        self.mmc_switch_current(EXT_CSD_BUS_WIDTH, Self::mmc_width_byte(width, true))?;
        let clock = self.set_host_timing(MmcTiming::MmcDdr52)?;
        self.apply_state(
            MmcState {
                timing: MmcTiming::MmcDdr52,
                bus_width: width,
            },
            clock,
        );
        info!(target: "sdmmc", "bus at DDR52 x{}", width.lanes());
        Ok(())
    }

    /// After a failed tier, put the bus back into a state the next tier
    /// can start from.
    fn recover_legacy(&self) -> Result<(), SdmmcError> {
        let mut hw = self.hardware.lock().unwrap();
        hw.sdmmc_config_timing(MmcTiming::Legacy)?;
        hw.sdmmc_config_bus_width(MmcBusWidth::Width1)?;
        let clock = hw.sdmmc_config_clock(INIT_CLOCK_RATE)?;
        drop(hw);
        self.apply_state(
            MmcState {
                timing: MmcTiming::Legacy,
                bus_width: MmcBusWidth::Width1,
            },
            clock,
        );
        Ok(())
    }

    fn legacy_fallback(&self, width: MmcBusWidth) -> Result<(), SdmmcError> {
        let kind = {
            let inner = self.inner.lock().unwrap();
            inner.device.as_ref().ok_or(SdmmcError::ENOCARD)?.kind()
        };
        let mut reached = MmcBusWidth::Width1;
        if width != MmcBusWidth::Width1 {
            let switched = match kind {
                CardKind::Mmc => self
                    .mmc_switch_current(EXT_CSD_BUS_WIDTH, Self::mmc_width_byte(width, false))
                    .and_then(|_| self.set_host_width(width)),
                CardKind::Sd => self.sd_set_bus_width(width),
            };
            match switched {
                Ok(()) => reached = width,
                Err(e) => debug!(target: "sdmmc", "wide bus not reached: {:?}", e),
            }
        }

        let rate = {
            let inner = self.inner.lock().unwrap();
            match inner.device.as_ref() {
                Some(MmcDevice::Sdcard(sd)) => sd.card_specific_data.tran_speed_hz,
                Some(MmcDevice::EMmc(mmc)) => mmc.card_specific_data.tran_speed_hz,
                None => return Err(SdmmcError::ENOCARD),
            }
        };
        let mut hw = self.hardware.lock().unwrap();
        hw.sdmmc_config_timing(MmcTiming::Legacy)?;
        let clock = hw.sdmmc_config_clock(rate.clamp(
            self.host_info.min_frequency,
            self.host_info.max_frequency,
        ))?;
        drop(hw);

        self.apply_state(
            MmcState {
                timing: MmcTiming::Legacy,
                bus_width: reached,
            },
            clock,
        );
        info!(target: "sdmmc", "bus at legacy rate {} Hz", clock);
        Ok(())
    }

    // -------------------------- SD ladder --------------------------

    fn negotiate_sdcard(&self) -> Result<(), SdmmcError> {
        let caps = self.caps_snapshot();
        let width = if caps & MMC_CAP_4_BIT_DATA != 0 {
            MmcBusWidth::Width4
        } else {
            MmcBusWidth::Width1
        };

        // Tier 1: SDR104, tuned, 1.8 V signalling.
        if caps & MMC_TIMING_UHS_SDR104 != 0 && width == MmcBusWidth::Width4 {
            match self.try_sd_uhs(MmcTiming::UhsSdr104, SD_SWITCH_BUS_SPEED_SDR104) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(target: "sdmmc", "SDR104 not reached: {:?}", e);
                    self.drop_tier(MMC_TIMING_UHS_SDR104);
                    self.recover_legacy()?;
                }
            }
        }

        // Tier 2: SDR50.
        let caps = self.caps_snapshot();
        if caps & MMC_TIMING_UHS_SDR50 != 0 && width == MmcBusWidth::Width4 {
            match self.try_sd_uhs(MmcTiming::UhsSdr50, SD_SWITCH_BUS_SPEED_SDR50) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(target: "sdmmc", "SDR50 not reached: {:?}", e);
                    self.drop_tier(MMC_TIMING_UHS_SDR50);
                    self.recover_legacy()?;
                }
            }
        }

        // Tier 3: high speed via the switch function.
        let caps = self.caps_snapshot();
        if caps & MMC_TIMING_SD_HS != 0 {
            match self.try_sd_hs(width) {
                Ok(()) => {
                    let caps = self.caps_snapshot();
                    if caps & MMC_TIMING_UHS_DDR50 != 0 && width == MmcBusWidth::Width4 {
                        if let Err(e) = self.try_sd_ddr50() {
                            debug!(target: "sdmmc", "DDR50 not reached: {:?}", e);
                            self.drop_tier(MMC_TIMING_UHS_DDR50);
                        }
                    }
                    return Ok(());
                }
                Err(e) => {
                    debug!(target: "sdmmc", "SD high speed not reached: {:?}", e);
                    self.drop_tier(MMC_TIMING_SD_HS);
                    self.recover_legacy()?;
                }
            }
        }

        self.legacy_fallback(width)
    }

    fn sd_set_bus_width(&self, width: MmcBusWidth) -> Result<(), SdmmcError> {
        let arg = match width {
            MmcBusWidth::Width4 => 2,
            MmcBusWidth::Width1 => 0,
            MmcBusWidth::Width8 => return Err(SdmmcError::EINVAL),
        };
        let mut cmd = SdmmcCmd::app(SD_CMD_APP_SET_BUS_WIDTH, MMC_RSP_R1, arg);
        self.send(&mut cmd, CMD_TIMEOUT, 1)?;
        self.set_host_width(width)
    }

    /// CMD6 set for the bus-speed group, verifying the result nibble from
    /// the 64-byte switch status.
    fn sd_switch_function(&self, value: u32) -> Result<(), SdmmcError> {
        let mut buf = [0u8; SD_SWITCH_STATUS_LEN as usize];
        let data = MmcData {
            blocksize: SD_SWITCH_STATUS_LEN,
            blockcnt: 1,
            flags: MmcDataFlag::SdmmcDataRead,
            sg: SgList::single(buf.as_mut_ptr() as u64, SD_SWITCH_STATUS_LEN),
        };
        let mut cmd = SdmmcCmd::with_data(
            SD_CMD_SWITCH_FUNC,
            MMC_RSP_R1,
            sd_switch_arg(SD_SWITCH_SET, SD_SWITCH_GRP_BUS_SPEED, value),
            data,
        );
        self.send(&mut cmd, DATA_TIMEOUT, 0)?;

        let selected = buf[SD_SWITCH_GRP1_RESULT_BYTE] & 0xF;
        if selected as u32 != value {
            return Err(SdmmcError::EUNSUPPORTEDCARD);
        }
        Ok(())
    }

    fn try_sd_uhs(&self, timing: MmcTiming, switch_value: u32) -> Result<(), SdmmcError> {
        // Lower signalling first: UHS runs at 1.8 V, reached through
        // CMD11 plus the host voltage switch.
        if self.caps_snapshot() & MMC_CAP_VOLTAGE_180 == 0 {
            return Err(SdmmcError::EUNSUPPORTEDCARD);
        }
        let mut volt = SdmmcCmd::new(SD_CMD_SWITCH_UHS18V, MMC_RSP_R1, 0);
        self.send(&mut volt, CMD_TIMEOUT, 0)?;
        {
            let mut hw = self.hardware.lock().unwrap();
            hw.sdmmc_config_signal_voltage(MmcSignalVoltage::Voltage180)?;
            let mut inner = self.inner.lock().unwrap();
            inner.ios.signal_voltage = MmcSignalVoltage::Voltage180;
        }

        self.sd_set_bus_width(MmcBusWidth::Width4)?;
        self.sd_switch_function(switch_value)?;
        let clock = self.set_host_timing(timing)?;
        self.run_tuning(timing)?;
        self.apply_state(
            MmcState {
                timing,
                bus_width: MmcBusWidth::Width4,
            },
            clock,
        );
        info!(target: "sdmmc", "bus at {:?} x4", timing);
        Ok(())
    }

    fn try_sd_hs(&self, width: MmcBusWidth) -> Result<(), SdmmcError> {
        if width == MmcBusWidth::Width4 {
            self.sd_set_bus_width(width)?;
        }
        self.sd_switch_function(SD_SWITCH_BUS_SPEED_HS)?;
        let clock = self.set_host_timing(MmcTiming::SdHs)?;
        self.apply_state(
            MmcState {
                timing: MmcTiming::SdHs,
                bus_width: width,
            },
            clock,
        );
        info!(target: "sdmmc", "bus at SD high speed x{}", width.lanes());
        Ok(())
    }

    fn try_sd_ddr50(&self) -> Result<(), SdmmcError> {
        self.sd_switch_function(SD_SWITCH_BUS_SPEED_DDR50)?;
        let clock = self.set_host_timing(MmcTiming::UhsDdr50)?;
        self.apply_state(
            MmcState {
                timing: MmcTiming::UhsDdr50,
                bus_width: MmcBusWidth::Width4,
            },
            clock,
        );
        info!(target: "sdmmc", "bus at DDR50 x4");
        Ok(())
    }

    /// Force the protocol-default block length, except where the exchange
    /// is protocol-omitted: double-data-rate or HS400 timing combined with
    /// high-capacity addressing fixes the length at 512 with CMD16
    /// forbidden.
    fn finalize_block_length(&self) -> Result<(), SdmmcError> {
        let (timing, high_capacity) = {
            let inner = self.inner.lock().unwrap();
            let device = inner.device.as_ref().ok_or(SdmmcError::ENOCARD)?;
            (device.state().timing, device.high_capacity())
        };

        let omitted = (timing.is_ddr() || timing == MmcTiming::MmcHs400) && high_capacity;
        if !omitted {
            let mut cmd = SdmmcCmd::new(
                MMC_CMD_SET_BLOCKLEN,
                MMC_RSP_R1,
                SDMMC_DEFAULT_BLOCK_LEN,
            );
            self.send(&mut cmd, CMD_TIMEOUT, 1)?;
        }

        let mut inner = self.inner.lock().unwrap();
        if let Some(device) = inner.device.as_mut() {
            device.set_block_len(SDMMC_DEFAULT_BLOCK_LEN);
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Bus-error escalation
    // ---------------------------------------------------------------

    /// Permanently narrow the capability mask one tier group and run a
    /// re-identification pass. Invoked after the configured number of
    /// consecutive bus errors.
    fn escalate_bus_error(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.in_escalation {
                return;
            }
            inner.in_escalation = true;
            inner.consecutive_bus_errors = 0;
            if !inner.caps.narrow_for_bus_error() {
                inner.in_escalation = false;
                return;
            }
            warn!(
                target: "sdmmc",
                "bus errors: capabilities narrowed to {:#x}",
                inner.caps.0
            );
        }

        let result = {
            let _setup = self.setup_lock.lock().unwrap();
            self.reidentify().and_then(|_| {
                let kind = {
                    let inner = self.inner.lock().unwrap();
                    inner.device.as_ref().map(|d| d.kind())
                };
                match kind {
                    Some(CardKind::Mmc) => self.negotiate_emmc(),
                    Some(CardKind::Sd) => self.negotiate_sdcard(),
                    None => Err(SdmmcError::ENOCARD),
                }
                .and_then(|_| self.finalize_block_length())
            })
        };
        if let Err(e) = result {
            warn!(target: "sdmmc", "re-identification failed: {:?}", e);
        }

        self.inner.lock().unwrap().in_escalation = false;
    }

    // ---------------------------------------------------------------
    // Block I/O
    // ---------------------------------------------------------------

    fn data_arg(&self, start_lba: u64) -> Result<u32, SdmmcError> {
        let inner = self.inner.lock().unwrap();
        let device = inner.device.as_ref().ok_or(SdmmcError::ENOCARD)?;
        // Byte addressing on standard-capacity parts.
        let arg = if device.high_capacity() {
            start_lba
        } else {
            start_lba * device.block_len() as u64
        };
        u32::try_from(arg).map_err(|_| SdmmcError::EINVAL)
    }

    fn validate_transfer(&self, blockcnt: u32, sg: &SgList) -> Result<u32, SdmmcError> {
        let block_len = self
            .inner
            .lock()
            .unwrap()
            .device
            .as_ref()
            .ok_or(SdmmcError::ENOCARD)?
            .block_len();
        if blockcnt == 0
            || blockcnt > self.host_info.max_blocks_per_req
            || sg.segments.len() as u32 > self.host_info.max_segments
            || sg.total_len() != blockcnt as u64 * block_len as u64
        {
            return Err(SdmmcError::EINVAL);
        }
        Ok(block_len)
    }

    pub fn read_blocks(
        &self,
        start_lba: u64,
        blockcnt: u32,
        sg: SgList,
    ) -> Result<(), SdmmcError> {
        self.transfer(start_lba, blockcnt, sg, MmcDataFlag::SdmmcDataRead)
    }

    pub fn write_blocks(
        &self,
        start_lba: u64,
        blockcnt: u32,
        sg: SgList,
    ) -> Result<(), SdmmcError> {
        {
            let inner = self.inner.lock().unwrap();
            if let Some(device) = inner.device.as_ref() {
                if device.write_protected() {
                    return Err(SdmmcError::EROFS);
                }
            }
        }
        self.transfer(start_lba, blockcnt, sg, MmcDataFlag::SdmmcDataWrite)
    }

    fn transfer(
        &self,
        start_lba: u64,
        blockcnt: u32,
        sg: SgList,
        flags: MmcDataFlag,
    ) -> Result<(), SdmmcError> {
        self.acquire_device()?;
        let result = self.transfer_locked(start_lba, blockcnt, sg, flags);
        self.release_device();
        self.maybe_escalate();
        result
    }

    fn transfer_locked(
        &self,
        start_lba: u64,
        blockcnt: u32,
        sg: SgList,
        flags: MmcDataFlag,
    ) -> Result<(), SdmmcError> {
        let block_len = self.validate_transfer(blockcnt, &sg)?;
        let arg = self.data_arg(start_lba)?;
        let write = matches!(flags, MmcDataFlag::SdmmcDataWrite);

        let cmdidx = match (write, blockcnt > 1) {
            (false, false) => MMC_CMD_READ_SINGLE_BLOCK,
            (false, true) => MMC_CMD_READ_MULTIPLE_BLOCK,
            (true, false) => MMC_CMD_WRITE_SINGLE_BLOCK,
            (true, true) => MMC_CMD_WRITE_MULTIPLE_BLOCK,
        };

        // Pool exhaustion surfaces before anything is programmed.
        let mut cmd = self.pool.alloc()?;
        cmd.cmdidx = cmdidx;
        cmd.resp_type = MMC_RSP_R1;
        cmd.cmdarg = arg;
        cmd.data = Some(MmcData {
            blocksize: block_len,
            blockcnt,
            flags,
            sg,
        });
        let res = self.send(&mut cmd, DATA_TIMEOUT, 2);

        // Open-ended multi-block transfers need the explicit stop unless
        // the host sends it on its own.
        let used_cmd23 = blockcnt > 1
            && (self.host_caps & MMC_CAP_AUTO_CMD23 != 0 || self.card_supports_cmd23());
        let needs_stop = blockcnt > 1
            && !used_cmd23
            && self.host_caps & MMC_CAP_AUTO_CMD12 == 0;
        let res = if res.is_ok() && needs_stop {
            let mut stop = SdmmcCmd::new(MMC_CMD_STOP_TRANSMISSION, MMC_RSP_R1B, 0);
            self.send(&mut stop, CMD_TIMEOUT, 1)
                .map_err(|_| SdmmcError::ESTOPCMD)
        } else {
            res
        };
        self.pool.free(cmd);
        res
    }

    /// Run the escalation path once the consecutive bus-error budget is
    /// spent. Only data-path callers reach this; bring-up failures degrade
    /// through the negotiation ladder instead.
    fn maybe_escalate(&self) {
        let errors = self.inner.lock().unwrap().consecutive_bus_errors;
        if errors >= self.config.bus_error_limit {
            self.escalate_bus_error();
        }
    }

    /// Erase a block range. Chooses trim when the card has it, otherwise
    /// whole erase groups.
    pub fn erase_blocks(&self, start_lba: u64, end_lba: u64) -> Result<(), SdmmcError> {
        self.acquire_device()?;
        let result = self.erase_locked(start_lba, end_lba);
        self.release_device();
        self.maybe_escalate();
        result
    }

    fn erase_locked(&self, start_lba: u64, end_lba: u64) -> Result<(), SdmmcError> {
        if end_lba < start_lba {
            return Err(SdmmcError::EINVAL);
        }

        let (kind, trim, timeout_ms, write_protected) = {
            let inner = self.inner.lock().unwrap();
            let device = inner.device.as_ref().ok_or(SdmmcError::ENOCARD)?;
            let trim = inner.caps.0 & MMC_CAP_TRIM != 0;
            let timeout_ms = match device {
                MmcDevice::EMmc(mmc) => {
                    let group = mmc.erase_group_sectors().max(1) as u64;
                    let groups = (end_lba - start_lba + group) / group;
                    mmc.erase_timeout_ms(groups as u32)
                }
                MmcDevice::Sdcard(_) => 1000 + (end_lba - start_lba) / 2,
            };
            (
                device.kind(),
                trim,
                timeout_ms,
                device.write_protected(),
            )
        };
        if write_protected {
            return Err(SdmmcError::EROFS);
        }

        let (start_idx, end_idx, erase_arg) = match kind {
            CardKind::Mmc => (
                MMC_CMD_ERASE_GROUP_START,
                MMC_CMD_ERASE_GROUP_END,
                if trim { MMC_TRIM_ARG } else { MMC_ERASE_ARG },
            ),
            CardKind::Sd => (
                SD_CMD_ERASE_WR_BLK_START,
                SD_CMD_ERASE_WR_BLK_END,
                if trim { SD_DISCARD_ARG } else { SD_ERASE_ARG },
            ),
        };

        let start_arg = self.data_arg(start_lba)?;
        let end_arg = self.data_arg(end_lba)?;

        let mut cmd = SdmmcCmd::new(start_idx, MMC_RSP_R1, start_arg);
        self.send(&mut cmd, CMD_TIMEOUT, 0)?;
        let mut cmd = SdmmcCmd::new(end_idx, MMC_RSP_R1, end_arg);
        self.send(&mut cmd, CMD_TIMEOUT, 0)?;
        let mut cmd = SdmmcCmd::new(MMC_CMD_ERASE, MMC_RSP_R1B, erase_arg);
        self.send(&mut cmd, Duration::from_millis(timeout_ms), 0)
    }
}

/// Host-only bits a card never declares; they survive the intersection
/// with the card capability set untouched.
const HOST_ONLY_MASK: u128 = MMC_CAP_AUTO_CMD12
    | MMC_CAP_AUTO_CMD23
    | MMC_CAP_BUSY_DETECT
    | MMC_CAP_NEEDS_POLL
    | MMC_CAP_BUS_MASTER
    | MMC_CAP_VOLTAGE_180
    | MMC_CAP_VOLTAGE_120
    | MMC_CAP_PRESET
    | MMC_CAP_CMD23
    | MMC_CAP_NONREMOVABLE;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(CmdStatus::Success.is_terminal());
        assert!(CmdStatus::CardRemoved.is_terminal());
        assert!(!CmdStatus::InProgress.is_terminal());
        assert!(!CmdStatus::Idle.is_terminal());

        assert!(!CmdStatus::CardRemoved.is_retryable());
        assert!(!CmdStatus::Success.is_retryable());
        assert!(CmdStatus::CmdCrcError.is_retryable());
        assert!(CmdStatus::DataTimeout.is_retryable());

        assert!(CmdStatus::CmdCrcError.is_bus_error());
        assert!(!CmdStatus::Failed.is_bus_error());
        assert!(!CmdStatus::CardRemoved.is_bus_error());
    }

    #[test]
    fn cmd_constructors() {
        let cmd = SdmmcCmd::new(MMC_CMD_GO_IDLE_STATE, MMC_RSP_NONE, 0);
        assert_eq!(cmd.status(), CmdStatus::Idle);
        assert!(!cmd.app_cmd);

        let acmd = SdmmcCmd::app(SD_CMD_APP_SEND_OP_COND, MMC_RSP_R3, 0);
        assert!(acmd.app_cmd);
    }

    #[test]
    fn response_type_flags() {
        assert_ne!(MMC_RSP_R1B & MMC_RSP_BUSY, 0);
        assert_eq!(MMC_RSP_R1 & MMC_RSP_BUSY, 0);
        assert_ne!(MMC_RSP_R2 & MMC_RSP_136, 0);
        assert_eq!(MMC_RSP_NONE, 0);
    }
}
