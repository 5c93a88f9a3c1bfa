use super::bit_field::{bits, bytes, resp_to_u128};
use super::mmc_struct::MmcState;
use crate::sdmmc::SdmmcError;

pub struct Sdcard {
    pub card_id: u128,
    pub manufacture_info: Cid,
    pub card_specific_data: Csd,
    pub card_version: SdVersion,
    pub relative_card_addr: u16,
    pub card_state: MmcState,
    pub card_config: Option<Scr>,
    pub ocr: u32,
    pub high_capacity: bool,
    pub locked: bool,
    pub write_protected: bool,
    pub block_len: u32,
}

// Tracks the command set the card supports, not the literal spec revision:
// a card reporting V3_0 implements everything up to specification 3.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdVersion {
    V1_0 = 1,
    V2_0 = 2,
    V3_0 = 3,
    V4_0 = 4,
}

/// Card identification register, SD layout (5-character product name).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cid {
    pub manufacturer_id: u8,
    pub oem_id: u16,
    pub product_name: [u8; 5],
    pub product_revision: u8,
    pub serial_number: u32,
    pub manufacturing_date: (u32, u8), // (year, month)
}

impl Cid {
    pub fn new(resp: [u32; 4]) -> Cid {
        let raw = resp_to_u128(resp);

        let manufacturer_id = bits(raw, 120, 8) as u8;
        let oem_id = bits(raw, 104, 16) as u16;

        let mut product_name = [0u8; 5];
        bytes(raw, 103, 5, &mut product_name);

        let product_revision = bits(raw, 56, 8) as u8;
        let serial_number = bits(raw, 24, 32);

        let year = bits(raw, 12, 8) + 2000;
        let month = bits(raw, 8, 4) as u8;

        Cid {
            manufacturer_id,
            oem_id,
            product_name,
            product_revision,
            serial_number,
            manufacturing_date: (year, month),
        }
    }

    pub fn name(&self) -> &str {
        core::str::from_utf8(&self.product_name).unwrap_or("?????")
    }
}

/// Card-specific data, SD layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Csd {
    pub csd_structure: u8,
    /// Capacity in bytes.
    pub card_capacity: u64,
    pub max_read_block_len: u16,
    pub max_write_block_len: u16,
    pub erase_sector_size: u32,
    pub supports_partial_write: bool,
    /// Legacy-mode clock rate derived from TRAN_SPEED.
    pub tran_speed_hz: u64,
    pub perm_write_protect: bool,
    pub tmp_write_protect: bool,
}

impl Csd {
    pub fn new(resp: [u32; 4]) -> Result<(Csd, SdVersion), SdmmcError> {
        let raw = resp_to_u128(resp);

        let csd_structure = bits(raw, 126, 2) as u8;
        let sd_version = match csd_structure {
            0 => SdVersion::V1_0,
            1 => SdVersion::V2_0,
            _ => return Err(SdmmcError::EUNSUPPORTEDCARD),
        };

        let read_bl_len = bits(raw, 80, 4);
        let (card_capacity, erase_sector_size) = match sd_version {
            SdVersion::V1_0 => {
                let c_size = bits(raw, 62, 12) as u64;
                let c_size_mult = bits(raw, 47, 3) as u64;
                let capacity = (c_size + 1) * (1 << (c_size_mult + 2)) * (1u64 << read_bl_len);
                let sector_size = bits(raw, 39, 7) + 1;
                (capacity, sector_size)
            }
            _ => {
                let c_size = bits(raw, 48, 22) as u64;
                let capacity = (c_size + 1) * 512 * 1024;
                let sector_size = (bits(raw, 39, 7) + 1) * 512;
                (capacity, sector_size)
            }
        };

        let max_read_block_len = 1 << read_bl_len;
        let write_bl_len = bits(raw, 22, 4);
        let max_write_block_len = 1 << write_bl_len;
        let supports_partial_write = bits(raw, 21, 1) != 0;
        let tran_speed_hz = decode_tran_speed(bits(raw, 96, 8));
        let perm_write_protect = bits(raw, 13, 1) != 0;
        let tmp_write_protect = bits(raw, 12, 1) != 0;

        Ok((
            Csd {
                csd_structure,
                card_capacity,
                max_read_block_len,
                max_write_block_len,
                erase_sector_size,
                supports_partial_write,
                tran_speed_hz,
                perm_write_protect,
                tmp_write_protect,
            },
            sd_version,
        ))
    }
}

/// Decode the TRAN_SPEED byte: a frequency unit in the low three bits and a
/// multiplier index in bits 6:3.
pub(crate) fn decode_tran_speed(value: u32) -> u64 {
    const UNIT: [u64; 4] = [100_000, 1_000_000, 10_000_000, 100_000_000];
    const MULT: [u64; 16] = [0, 10, 12, 13, 15, 20, 25, 30, 35, 40, 45, 50, 55, 60, 70, 80];

    let unit = UNIT[(value & 0x7).min(3) as usize];
    let mult = MULT[((value >> 3) & 0xF) as usize];
    unit * mult / 10
}

/// SD configuration register, read through ACMD51.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scr {
    pub sd_spec: u8,
    pub data_stat_after_erase: bool,
    pub sd_security: u8,
    pub sd_bus_widths: u8,
    pub sd_spec3: bool,
    pub sd_spec4: bool,
    pub supports_cmd23: bool,
}

impl Scr {
    /// `raw` holds the 64-bit register with bit 63 first on the wire.
    pub fn new(raw: u64) -> Result<Scr, SdmmcError> {
        let structure = ((raw >> 60) & 0xF) as u8;
        if structure != 0 {
            return Err(SdmmcError::EUNSUPPORTEDCARD);
        }

        let sd_spec = ((raw >> 56) & 0xF) as u8;
        let data_stat_after_erase = (raw >> 55) & 0x1 != 0;
        let sd_security = ((raw >> 52) & 0x7) as u8;
        let sd_bus_widths = ((raw >> 48) & 0xF) as u8;
        let sd_spec3 = (raw >> 47) & 0x1 != 0;
        let sd_spec4 = (raw >> 42) & 0x1 != 0;
        let supports_cmd23 = (raw >> 33) & 0x1 != 0;

        Ok(Scr {
            sd_spec,
            data_stat_after_erase,
            sd_security,
            sd_bus_widths,
            sd_spec3,
            sd_spec4,
            supports_cmd23,
        })
    }

    pub fn supports_4bit(&self) -> bool {
        self.sd_bus_widths & 0x4 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(raw: &mut u128, offset: u32, width: u32, value: u32) {
        let mask = ((1u128 << width) - 1) << offset;
        *raw = (*raw & !mask) | (((value as u128) << offset) & mask);
    }

    fn to_resp(raw: u128) -> [u32; 4] {
        [
            (raw >> 96) as u32,
            (raw >> 64) as u32,
            (raw >> 32) as u32,
            raw as u32,
        ]
    }

    #[test]
    fn csd_v2_capacity() {
        let mut raw = 0u128;
        set(&mut raw, 126, 2, 1); // structure v2
        set(&mut raw, 96, 8, 0x32); // TRAN_SPEED 25 MHz
        set(&mut raw, 80, 4, 9); // READ_BL_LEN 512
        set(&mut raw, 48, 22, 0x3B37); // C_SIZE for ~8 GB
        set(&mut raw, 22, 4, 9);

        let (csd, version) = Csd::new(to_resp(raw)).unwrap();
        assert_eq!(version, SdVersion::V2_0);
        assert_eq!(csd.card_capacity, (0x3B37 + 1) * 512 * 1024);
        assert_eq!(csd.max_read_block_len, 512);
        assert_eq!(csd.tran_speed_hz, 25_000_000);
    }

    #[test]
    fn csd_v1_capacity() {
        let mut raw = 0u128;
        set(&mut raw, 126, 2, 0); // structure v1
        set(&mut raw, 96, 8, 0x32);
        set(&mut raw, 80, 4, 9); // READ_BL_LEN 512
        set(&mut raw, 62, 12, 0xFFF); // C_SIZE max
        set(&mut raw, 47, 3, 7); // C_SIZE_MULT max
        set(&mut raw, 22, 4, 9);

        let (csd, version) = Csd::new(to_resp(raw)).unwrap();
        assert_eq!(version, SdVersion::V1_0);
        // (4096) * 512 * 512 = 2 GB, the SDSC ceiling
        assert_eq!(csd.card_capacity, 4096 * 512 * 512);
    }

    #[test]
    fn csd_write_protect_bits() {
        let mut raw = 0u128;
        set(&mut raw, 126, 2, 1);
        set(&mut raw, 96, 8, 0x32);
        set(&mut raw, 80, 4, 9);
        set(&mut raw, 13, 1, 1);

        let (csd, _) = Csd::new(to_resp(raw)).unwrap();
        assert!(csd.perm_write_protect);
        assert!(!csd.tmp_write_protect);
    }

    #[test]
    fn unknown_structure_is_rejected() {
        let mut raw = 0u128;
        set(&mut raw, 126, 2, 3);
        assert!(Csd::new(to_resp(raw)).is_err());
    }

    #[test]
    fn cid_fields() {
        let mut raw = 0u128;
        set(&mut raw, 120, 8, 0x03); // manufacturer
        set(&mut raw, 104, 16, 0x5344); // OEM "SD"
        // Product name "SD08G"
        set(&mut raw, 96, 8, b'S' as u32);
        set(&mut raw, 88, 8, b'D' as u32);
        set(&mut raw, 80, 8, b'0' as u32);
        set(&mut raw, 72, 8, b'8' as u32);
        set(&mut raw, 64, 8, b'G' as u32);
        set(&mut raw, 56, 8, 0x80); // revision 8.0
        set(&mut raw, 24, 32, 0xDEADBEEF);
        set(&mut raw, 12, 8, 24); // year 2024
        set(&mut raw, 8, 4, 6); // June

        let cid = Cid::new(to_resp(raw));
        assert_eq!(cid.manufacturer_id, 0x03);
        assert_eq!(cid.oem_id, 0x5344);
        assert_eq!(cid.name(), "SD08G");
        assert_eq!(cid.serial_number, 0xDEADBEEF);
        assert_eq!(cid.manufacturing_date, (2024, 6));
    }

    #[test]
    fn tran_speed_table() {
        assert_eq!(decode_tran_speed(0x32), 25_000_000);
        assert_eq!(decode_tran_speed(0x5A), 50_000_000);
        assert_eq!(decode_tran_speed(0x0B), 100_000 * 12 / 10);
    }

    #[test]
    fn scr_bus_widths() {
        // SCR: structure 0, spec 2, 4-bit + 1-bit widths, spec3, CMD23
        let raw: u64 = (2u64 << 56) | (0x5u64 << 48) | (1u64 << 47) | (1u64 << 33);
        let scr = Scr::new(raw).unwrap();
        assert!(scr.supports_4bit());
        assert!(scr.sd_spec3);
        assert!(scr.supports_cmd23);
    }
}
