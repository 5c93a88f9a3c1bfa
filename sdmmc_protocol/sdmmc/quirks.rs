//! Static errata table. Devices are matched on manufacturer id, OEM id,
//! product-name prefix and revision range; a match strips the listed
//! capability bits before the final capability set is derived.

use super::sdmmc_capability::*;

pub struct SdmmcQuirk {
    pub manufacturer_id: u8,
    /// `None` matches any OEM id.
    pub oem_id: Option<u16>,
    /// Product-name prefix, empty to match any name.
    pub name_prefix: &'static [u8],
    pub rev_min: u8,
    pub rev_max: u8,
    /// Capability bits the device must not be trusted with.
    pub deny: u128,
}

/// Known-bad device list. Kept deliberately small; entries are data, not
/// logic, and the match rules are what the engine guarantees.
pub(crate) static QUIRK_TABLE: &[SdmmcQuirk] = &[
    // Early 4.41 parts that corrupt data in DDR mode.
    SdmmcQuirk {
        manufacturer_id: 0x15,
        oem_id: Some(0x0100),
        name_prefix: b"M8G",
        rev_min: 0x00,
        rev_max: 0x11,
        deny: MMC_TIMING_MMC_DDR52 | MMC_TIMING_MMC_HS400,
    },
    // Parts that hang on secure erase.
    SdmmcQuirk {
        manufacturer_id: 0x45,
        oem_id: None,
        name_prefix: b"",
        rev_min: 0x00,
        rev_max: 0x01,
        deny: MMC_CAP_SECURE_ERASE,
    },
    // Cards that drop CRC at HS200 despite advertising it.
    SdmmcQuirk {
        manufacturer_id: 0x90,
        oem_id: Some(0x014A),
        name_prefix: b"HAG",
        rev_min: 0x00,
        rev_max: 0xFF,
        deny: MMC_TIMING_MMC_HS200,
    },
];

fn matches(
    quirk: &SdmmcQuirk,
    manufacturer_id: u8,
    oem_id: u16,
    name: &[u8],
    revision: u8,
) -> bool {
    if quirk.manufacturer_id != manufacturer_id {
        return false;
    }
    if let Some(oem) = quirk.oem_id {
        if oem != oem_id {
            return false;
        }
    }
    if !quirk.name_prefix.is_empty() && !name.starts_with(quirk.name_prefix) {
        return false;
    }
    revision >= quirk.rev_min && revision <= quirk.rev_max
}

/// Narrow `caps` by every quirk entry matching the device identity.
pub fn reconcile(
    manufacturer_id: u8,
    oem_id: u16,
    name: &[u8],
    revision: u8,
    caps: u128,
) -> u128 {
    let mut out = caps;
    for quirk in QUIRK_TABLE {
        if matches(quirk, manufacturer_id, oem_id, name, revision) {
            log::info!(
                target: "sdmmc",
                "errata match mid={:#04x} name={} rev={:#04x}: masking {:#x}",
                manufacturer_id,
                String::from_utf8_lossy(name),
                revision,
                quirk.deny
            );
            out &= !quirk.deny;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: u128 = MMC_TIMING_LEGACY
        | MMC_TIMING_MMC_HS
        | MMC_TIMING_MMC_DDR52
        | MMC_TIMING_MMC_HS200
        | MMC_TIMING_MMC_HS400
        | MMC_CAP_SECURE_ERASE
        | MMC_CAP_TRIM;

    #[test]
    fn revision_range_is_inclusive() {
        let narrowed = reconcile(0x15, 0x0100, b"M8G4AB", 0x11, FULL);
        assert_eq!(narrowed & MMC_TIMING_MMC_DDR52, 0);
        assert_eq!(narrowed & MMC_TIMING_MMC_HS400, 0);
        assert_ne!(narrowed & MMC_TIMING_MMC_HS200, 0);

        // One revision past the range: untouched.
        let untouched = reconcile(0x15, 0x0100, b"M8G4AB", 0x12, FULL);
        assert_eq!(untouched, FULL);
    }

    #[test]
    fn name_prefix_must_match() {
        let untouched = reconcile(0x15, 0x0100, b"Q8G4AB", 0x10, FULL);
        assert_eq!(untouched, FULL);
    }

    #[test]
    fn wildcard_oem_matches_all() {
        let narrowed = reconcile(0x45, 0xBEEF, b"ANY", 0x00, FULL);
        assert_eq!(narrowed & MMC_CAP_SECURE_ERASE, 0);
        assert_ne!(narrowed & MMC_CAP_TRIM, 0);
    }

    #[test]
    fn unknown_device_is_untouched() {
        assert_eq!(reconcile(0x7F, 0, b"NONE", 0, FULL), FULL);
    }
}
