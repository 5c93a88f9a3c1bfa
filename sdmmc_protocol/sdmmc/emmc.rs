use super::bit_field::{bits, bytes, resp_to_u128};
use super::mmc_struct::MmcState;
use super::sdcard::decode_tran_speed;
use super::sdmmc_constant::*;
use crate::sdmmc::SdmmcError;

pub struct EMmc {
    pub card_id: u128,
    pub manufacture_info: MmcCid,
    pub card_specific_data: MmcCsd,
    pub relative_card_addr: u16,
    pub card_state: MmcState,
    pub ext_csd: Option<ExtCsd>,
    pub ocr: u32,
    pub high_capacity: bool,
    pub locked: bool,
    pub write_protected: bool,
    pub block_len: u32,
    /// Set once the ERASE_GROUP_DEF switch took, selecting the
    /// high-capacity erase geometry from the Extended CSD.
    pub erase_group_def: bool,
}

/// Card identification register, MMC layout (6-character product name,
/// 8-bit OEM field).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmcCid {
    pub manufacturer_id: u8,
    pub oem_id: u16,
    pub product_name: [u8; 6],
    pub product_revision: u8,
    pub serial_number: u32,
    pub manufacturing_date: (u32, u8), // (year, month)
}

impl MmcCid {
    pub fn new(resp: [u32; 4]) -> MmcCid {
        let raw = resp_to_u128(resp);

        let manufacturer_id = bits(raw, 120, 8) as u8;
        let oem_id = bits(raw, 104, 8) as u16;

        let mut product_name = [0u8; 6];
        bytes(raw, 103, 6, &mut product_name);

        let product_revision = bits(raw, 48, 8) as u8;
        let serial_number = bits(raw, 16, 32);

        let month = bits(raw, 12, 4) as u8;
        let year = bits(raw, 8, 4) + 1997;

        MmcCid {
            manufacturer_id,
            oem_id,
            product_name,
            product_revision,
            serial_number,
            manufacturing_date: (year, month),
        }
    }

    pub fn name(&self) -> &str {
        core::str::from_utf8(&self.product_name).unwrap_or("??????")
    }
}

/// Card-specific data, MMC layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmcCsd {
    pub csd_structure: u8,
    /// MMC specification version from SPEC_VERS; 4 and up have an
    /// Extended CSD.
    pub spec_vers: u8,
    /// Capacity in bytes as far as the CSD can express it; superseded by
    /// the Extended CSD sector count on high-capacity parts.
    pub card_capacity: u64,
    pub max_read_block_len: u16,
    pub max_write_block_len: u16,
    /// Erase group size in write blocks, from the CSD geometry pair.
    pub erase_group_blocks: u32,
    pub tran_speed_hz: u64,
    pub perm_write_protect: bool,
    pub tmp_write_protect: bool,
}

impl MmcCsd {
    pub fn new(resp: [u32; 4]) -> Result<MmcCsd, SdmmcError> {
        let raw = resp_to_u128(resp);

        let csd_structure = bits(raw, 126, 2) as u8;
        let spec_vers = bits(raw, 122, 4) as u8;

        let read_bl_len = bits(raw, 80, 4);
        let c_size = bits(raw, 62, 12) as u64;
        let c_size_mult = bits(raw, 47, 3) as u64;
        let card_capacity = (c_size + 1) * (1 << (c_size_mult + 2)) * (1u64 << read_bl_len);

        // The erase-group geometry pair moved between CSD structure
        // revisions: old structures put the group size in the upper field
        // and the multiplier in the lower one, later structures swap them.
        let (size_off, mult_off) = if csd_structure < 2 { (42, 37) } else { (37, 42) };
        let erase_grp_size = bits(raw, size_off, 5);
        let erase_grp_mult = bits(raw, mult_off, 5);
        let erase_group_blocks = (erase_grp_size + 1) * (erase_grp_mult + 1);

        let max_read_block_len = 1 << read_bl_len;
        let write_bl_len = bits(raw, 22, 4);
        let max_write_block_len = 1 << write_bl_len;
        let tran_speed_hz = decode_tran_speed(bits(raw, 96, 8));
        let perm_write_protect = bits(raw, 13, 1) != 0;
        let tmp_write_protect = bits(raw, 12, 1) != 0;

        Ok(MmcCsd {
            csd_structure,
            spec_vers,
            card_capacity,
            max_read_block_len,
            max_write_block_len,
            erase_group_blocks,
            tran_speed_hz,
            perm_write_protect,
            tmp_write_protect,
        })
    }
}

/// Parsed view of the 512-byte Extended CSD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtCsd {
    pub rev: u8,
    pub device_type: u8,
    pub sector_count: u32,
    /// High-capacity erase group size in 512 KiB units.
    pub hc_erase_grp_size: u8,
    pub erase_timeout_mult: u8,
    pub sec_feature_support: u8,
    pub trim_mult: u8,
    /// Cache size in KiB.
    pub cache_size: u32,
    /// Worst-case CMD6 completion time in milliseconds.
    pub generic_cmd6_time_ms: u32,
    pub erase_group_def: u8,
}

impl ExtCsd {
    pub fn parse(raw: &[u8; EXT_CSD_LEN]) -> ExtCsd {
        let le32 = |idx: usize| {
            u32::from_le_bytes([raw[idx], raw[idx + 1], raw[idx + 2], raw[idx + 3]])
        };

        ExtCsd {
            rev: raw[EXT_CSD_REV],
            device_type: raw[EXT_CSD_DEVICE_TYPE],
            sector_count: le32(EXT_CSD_SEC_COUNT),
            hc_erase_grp_size: raw[EXT_CSD_HC_ERASE_GRP_SIZE],
            erase_timeout_mult: raw[EXT_CSD_ERASE_TIMEOUT_MULT],
            sec_feature_support: raw[EXT_CSD_SEC_FEATURE_SUPPORT],
            trim_mult: raw[EXT_CSD_TRIM_MULT],
            cache_size: le32(EXT_CSD_CACHE_SIZE),
            generic_cmd6_time_ms: raw[EXT_CSD_GENERIC_CMD6_TIME] as u32 * 10,
            erase_group_def: raw[EXT_CSD_ERASE_GROUP_DEF],
        }
    }

    pub fn supports_hs200(&self) -> bool {
        self.device_type & (EXT_CSD_CARD_TYPE_HS200_1_8V | EXT_CSD_CARD_TYPE_HS200_1_2V) != 0
    }

    pub fn supports_hs400(&self) -> bool {
        self.device_type & (EXT_CSD_CARD_TYPE_HS400_1_8V | EXT_CSD_CARD_TYPE_HS400_1_2V) != 0
    }

    pub fn supports_ddr52(&self) -> bool {
        self.device_type & (EXT_CSD_CARD_TYPE_DDR_1_8V | EXT_CSD_CARD_TYPE_DDR_1_2V) != 0
    }

    pub fn supports_hs52(&self) -> bool {
        self.device_type & EXT_CSD_CARD_TYPE_HS_52 != 0
    }

    pub fn supports_trim(&self) -> bool {
        self.trim_mult > 0
    }

    pub fn supports_secure_erase(&self) -> bool {
        self.sec_feature_support & EXT_CSD_SEC_ER_EN != 0
    }

    pub fn has_cache(&self) -> bool {
        self.cache_size > 0
    }
}

impl EMmc {
    /// Erase group size in 512-byte sectors under the currently selected
    /// geometry.
    pub fn erase_group_sectors(&self) -> u32 {
        match &self.ext_csd {
            Some(ext) if self.erase_group_def && ext.hc_erase_grp_size > 0 => {
                ext.hc_erase_grp_size as u32 * 1024
            }
            _ => self.card_specific_data.erase_group_blocks,
        }
    }

    /// Host-side deadline for an erase covering `groups` erase groups.
    pub fn erase_timeout_ms(&self, groups: u32) -> u64 {
        let mult = self
            .ext_csd
            .as_ref()
            .map(|e| e.erase_timeout_mult.max(1) as u64)
            .unwrap_or(1);
        // The two extra groups are an empirically chosen margin, measured
        // on real parts rather than taken from any register field.
        300 * mult * (groups as u64 + 2)
    }
}
