use super::emmc::{EMmc, ExtCsd};
use super::sdcard::Sdcard;

// Enums for bus_width
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum MmcBusWidth {
    Width1 = 0,
    // One is skipped because for SD_ACMD_SET_BUS_WIDTH, setting cmdargs to 2
    // selects the 4-bit lanes
    Width4 = 2,
    Width8 = 3,
}

impl MmcBusWidth {
    pub fn lanes(&self) -> u32 {
        match self {
            MmcBusWidth::Width1 => 1,
            MmcBusWidth::Width4 => 4,
            MmcBusWidth::Width8 => 8,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MmcTiming {
    Legacy = 0,
    MmcHs = 1,
    SdHs = 2,
    UhsSdr50 = 5,
    UhsSdr104 = 6,
    UhsDdr50 = 7,
    MmcDdr52 = 8,
    MmcHs200 = 9,
    MmcHs400 = 10,
    CardSetup = 13,
}

impl MmcTiming {
    pub fn frequency(&self) -> u64 {
        match self {
            MmcTiming::Legacy => 25_000_000,
            MmcTiming::MmcHs => 52_000_000,
            MmcTiming::SdHs => 50_000_000,
            MmcTiming::UhsSdr50 => 100_000_000,
            MmcTiming::UhsSdr104 => 208_000_000,
            MmcTiming::UhsDdr50 => 50_000_000,
            MmcTiming::MmcDdr52 => 52_000_000,
            MmcTiming::MmcHs200 => 200_000_000,
            MmcTiming::MmcHs400 => 200_000_000,
            MmcTiming::CardSetup => 400_000,
        }
    }

    /// Double-data-rate modes clock data on both clock edges.
    pub fn is_ddr(&self) -> bool {
        matches!(
            self,
            MmcTiming::UhsDdr50 | MmcTiming::MmcDdr52 | MmcTiming::MmcHs400
        )
    }

    /// Modes that only work after the sampling point has been tuned.
    pub fn needs_tuning(&self) -> bool {
        matches!(
            self,
            MmcTiming::UhsSdr104 | MmcTiming::MmcHs200 | MmcTiming::MmcHs400
        )
    }
}

/// Negotiated bus state, updated as the sequencer climbs the tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmcState {
    pub timing: MmcTiming,
    pub bus_width: MmcBusWidth,
}

/// The kind of device sitting in the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardKind {
    Sd,
    Mmc,
}

/// Per-insertion device instance. Rebuilt from scratch on every insertion
/// cycle; identification is the only writer of the capability-relevant
/// fields.
pub enum MmcDevice {
    Sdcard(Sdcard),
    EMmc(EMmc),
}

impl MmcDevice {
    pub fn kind(&self) -> CardKind {
        match self {
            MmcDevice::Sdcard(_) => CardKind::Sd,
            MmcDevice::EMmc(_) => CardKind::Mmc,
        }
    }

    pub fn rca(&self) -> u16 {
        match self {
            MmcDevice::Sdcard(sd) => sd.relative_card_addr,
            MmcDevice::EMmc(mmc) => mmc.relative_card_addr,
        }
    }

    /// Raw 128-bit CID as captured off the bus, used by the re-identify
    /// pass to detect a swapped card.
    pub fn card_id(&self) -> u128 {
        match self {
            MmcDevice::Sdcard(sd) => sd.card_id,
            MmcDevice::EMmc(mmc) => mmc.card_id,
        }
    }

    pub fn state(&self) -> MmcState {
        match self {
            MmcDevice::Sdcard(sd) => sd.card_state,
            MmcDevice::EMmc(mmc) => mmc.card_state,
        }
    }

    pub fn set_state(&mut self, state: MmcState) {
        match self {
            MmcDevice::Sdcard(sd) => sd.card_state = state,
            MmcDevice::EMmc(mmc) => mmc.card_state = state,
        }
    }

    pub fn high_capacity(&self) -> bool {
        match self {
            MmcDevice::Sdcard(sd) => sd.high_capacity,
            MmcDevice::EMmc(mmc) => mmc.high_capacity,
        }
    }

    pub fn locked(&self) -> bool {
        match self {
            MmcDevice::Sdcard(sd) => sd.locked,
            MmcDevice::EMmc(mmc) => mmc.locked,
        }
    }

    pub fn write_protected(&self) -> bool {
        match self {
            MmcDevice::Sdcard(sd) => sd.write_protected,
            MmcDevice::EMmc(mmc) => mmc.write_protected,
        }
    }

    pub fn block_len(&self) -> u32 {
        match self {
            MmcDevice::Sdcard(sd) => sd.block_len,
            MmcDevice::EMmc(mmc) => mmc.block_len,
        }
    }

    pub fn set_block_len(&mut self, len: u32) {
        match self {
            MmcDevice::Sdcard(sd) => sd.block_len = len,
            MmcDevice::EMmc(mmc) => mmc.block_len = len,
        }
    }

    /// Capacity in 512-byte sectors.
    pub fn sectors(&self) -> u64 {
        match self {
            MmcDevice::Sdcard(sd) => sd.card_specific_data.card_capacity / 512,
            MmcDevice::EMmc(mmc) => match &mmc.ext_csd {
                Some(ext) if ext.sector_count > 0 => ext.sector_count as u64,
                _ => mmc.card_specific_data.card_capacity / 512,
            },
        }
    }

    pub fn ext_csd(&self) -> Option<&ExtCsd> {
        match self {
            MmcDevice::EMmc(mmc) => mmc.ext_csd.as_ref(),
            MmcDevice::Sdcard(_) => None,
        }
    }
}
