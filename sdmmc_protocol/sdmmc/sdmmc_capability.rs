use bitflags::bitflags;

/// Capability mask shared by hosts, cards and attach configuration.
///
/// The effective mask of a controller is the intersection of what the host
/// declares at init, what the card declares during identification and what
/// the attach options allow. It only ever narrows after negotiation or
/// bus-error escalation; a fresh identification pass is the only way bits
/// come back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdmmcCapability(pub u128);

bitflags! {
    impl SdmmcCapability: u128 {
        // Timing tiers
        const MMC_TIMING_LEGACY     = MMC_TIMING_LEGACY;
        const MMC_TIMING_MMC_HS     = MMC_TIMING_MMC_HS;
        const MMC_TIMING_SD_HS      = MMC_TIMING_SD_HS;
        const MMC_TIMING_UHS_SDR50  = MMC_TIMING_UHS_SDR50;
        const MMC_TIMING_UHS_SDR104 = MMC_TIMING_UHS_SDR104;
        const MMC_TIMING_UHS_DDR50  = MMC_TIMING_UHS_DDR50;
        const MMC_TIMING_MMC_DDR52  = MMC_TIMING_MMC_DDR52;
        const MMC_TIMING_MMC_HS200  = MMC_TIMING_MMC_HS200;
        const MMC_TIMING_MMC_HS400  = MMC_TIMING_MMC_HS400;

        // Host-side capabilities
        const MMC_CAP_4_BIT_DATA    = MMC_CAP_4_BIT_DATA;
        const MMC_CAP_8_BIT_DATA    = MMC_CAP_8_BIT_DATA;
        const MMC_CAP_AUTO_CMD12    = MMC_CAP_AUTO_CMD12;
        const MMC_CAP_AUTO_CMD23    = MMC_CAP_AUTO_CMD23;
        const MMC_CAP_BUSY_DETECT   = MMC_CAP_BUSY_DETECT;
        const MMC_CAP_NEEDS_POLL    = MMC_CAP_NEEDS_POLL;
        const MMC_CAP_BUS_MASTER    = MMC_CAP_BUS_MASTER;
        const MMC_CAP_VOLTAGE_180   = MMC_CAP_VOLTAGE_180;
        const MMC_CAP_VOLTAGE_120   = MMC_CAP_VOLTAGE_120;
        const MMC_CAP_PRESET        = MMC_CAP_PRESET;
        const MMC_CAP_CMD23         = MMC_CAP_CMD23;
        const MMC_CAP_NONREMOVABLE  = MMC_CAP_NONREMOVABLE;

        // Card-side capabilities, derived during identification
        const MMC_CAP_HIGH_CAPACITY = MMC_CAP_HIGH_CAPACITY;
        const MMC_CAP_TRIM          = MMC_CAP_TRIM;
        const MMC_CAP_SECURE_ERASE  = MMC_CAP_SECURE_ERASE;
        const MMC_CAP_CACHE         = MMC_CAP_CACHE;
    }
}

// Timing tiers (from bit 0)
pub const MMC_TIMING_LEGACY: u128 = 1 << 0;
pub const MMC_TIMING_MMC_HS: u128 = 1 << 1;
pub const MMC_TIMING_SD_HS: u128 = 1 << 2;
pub const MMC_TIMING_UHS_SDR50: u128 = 1 << 5;
pub const MMC_TIMING_UHS_DDR50: u128 = 1 << 6;
pub const MMC_TIMING_UHS_SDR104: u128 = 1 << 7;
pub const MMC_TIMING_MMC_DDR52: u128 = 1 << 8;
pub const MMC_TIMING_MMC_HS200: u128 = 1 << 9;
pub const MMC_TIMING_MMC_HS400: u128 = 1 << 10;

// Host capabilities (from bit 16)
pub const MMC_CAP_4_BIT_DATA: u128 = 1 << 16;
pub const MMC_CAP_8_BIT_DATA: u128 = 1 << 17;
pub const MMC_CAP_AUTO_CMD12: u128 = 1 << 18;
pub const MMC_CAP_AUTO_CMD23: u128 = 1 << 19;
pub const MMC_CAP_BUSY_DETECT: u128 = 1 << 20;
pub const MMC_CAP_NEEDS_POLL: u128 = 1 << 21;
pub const MMC_CAP_BUS_MASTER: u128 = 1 << 22;
pub const MMC_CAP_VOLTAGE_180: u128 = 1 << 23;
pub const MMC_CAP_VOLTAGE_120: u128 = 1 << 24;
pub const MMC_CAP_PRESET: u128 = 1 << 25;
pub const MMC_CAP_CMD23: u128 = 1 << 30;
pub const MMC_CAP_NONREMOVABLE: u128 = 1 << 31;

// Card capabilities (from bit 40)
pub const MMC_CAP_HIGH_CAPACITY: u128 = 1 << 40;
pub const MMC_CAP_TRIM: u128 = 1 << 41;
pub const MMC_CAP_SECURE_ERASE: u128 = 1 << 42;
pub const MMC_CAP_CACHE: u128 = 1 << 43;

/// Union of every tier that requires the tuning procedure before use.
pub const MMC_TIMING_TUNED: u128 =
    MMC_TIMING_UHS_SDR104 | MMC_TIMING_MMC_HS200 | MMC_TIMING_MMC_HS400;

/// Escalation order for consecutive bus errors: double-data-rate modes go
/// first, then the tuned tiers from the top down, then plain high speed.
pub const BUS_ERROR_ESCALATION: &[u128] = &[
    MMC_TIMING_MMC_DDR52 | MMC_TIMING_UHS_DDR50,
    MMC_TIMING_MMC_HS400 | MMC_TIMING_UHS_SDR104,
    MMC_TIMING_MMC_HS200 | MMC_TIMING_UHS_SDR50,
    MMC_TIMING_MMC_HS | MMC_TIMING_SD_HS,
];

impl SdmmcCapability {
    /// Drop the next tier group that is still present, returning `true`
    /// when something was narrowed.
    pub fn narrow_for_bus_error(&mut self) -> bool {
        for group in BUS_ERROR_ESCALATION {
            if self.0 & group != 0 {
                self.0 &= !group;
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalation_narrows_in_order() {
        let mut cap = SdmmcCapability(
            MMC_TIMING_LEGACY
                | MMC_TIMING_MMC_HS
                | MMC_TIMING_MMC_DDR52
                | MMC_TIMING_MMC_HS200
                | MMC_TIMING_MMC_HS400,
        );
        assert!(cap.narrow_for_bus_error());
        assert_eq!(cap.0 & MMC_TIMING_MMC_DDR52, 0);
        assert_ne!(cap.0 & MMC_TIMING_MMC_HS400, 0);

        assert!(cap.narrow_for_bus_error());
        assert_eq!(cap.0 & MMC_TIMING_MMC_HS400, 0);

        assert!(cap.narrow_for_bus_error());
        assert_eq!(cap.0 & MMC_TIMING_MMC_HS200, 0);

        assert!(cap.narrow_for_bus_error());
        assert_eq!(cap.0 & MMC_TIMING_MMC_HS, 0);

        // Legacy is never dropped.
        assert!(!cap.narrow_for_bus_error());
        assert_ne!(cap.0 & MMC_TIMING_LEGACY, 0);
    }
}
