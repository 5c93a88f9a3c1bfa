//! Protocol-level constants: command indices, OCR bits, R1 status bits,
//! switch arguments and Extended CSD byte offsets.

// MMC commands
pub const MMC_CMD_GO_IDLE_STATE: u32 = 0;
pub const MMC_CMD_SEND_OP_COND: u32 = 1;
pub const MMC_CMD_ALL_SEND_CID: u32 = 2;
pub const MMC_CMD_SET_RELATIVE_ADDR: u32 = 3;
pub const MMC_CMD_SET_DSR: u32 = 4;
pub const MMC_CMD_SLEEP_AWAKE: u32 = 5;
pub const MMC_CMD_SWITCH: u32 = 6;
pub const MMC_CMD_SELECT_CARD: u32 = 7;
pub const MMC_CMD_SEND_EXT_CSD: u32 = 8;
pub const MMC_CMD_SEND_CSD: u32 = 9;
pub const MMC_CMD_SEND_CID: u32 = 10;
pub const MMC_CMD_STOP_TRANSMISSION: u32 = 12;
pub const MMC_CMD_SEND_STATUS: u32 = 13;
pub const MMC_CMD_SET_BLOCKLEN: u32 = 16;
pub const MMC_CMD_READ_SINGLE_BLOCK: u32 = 17;
pub const MMC_CMD_READ_MULTIPLE_BLOCK: u32 = 18;
pub const MMC_CMD_SEND_TUNING_BLOCK: u32 = 19;
pub const MMC_CMD_SEND_TUNING_BLOCK_HS200: u32 = 21;
pub const MMC_CMD_SET_BLOCK_COUNT: u32 = 23;
pub const MMC_CMD_WRITE_SINGLE_BLOCK: u32 = 24;
pub const MMC_CMD_WRITE_MULTIPLE_BLOCK: u32 = 25;
pub const MMC_CMD_ERASE_GROUP_START: u32 = 35;
pub const MMC_CMD_ERASE_GROUP_END: u32 = 36;
pub const MMC_CMD_ERASE: u32 = 38;
pub const MMC_CMD_APP_CMD: u32 = 55;

// SD commands
pub const SD_CMD_SEND_RELATIVE_ADDR: u32 = 3;
pub const SD_CMD_SWITCH_FUNC: u32 = 6;
pub const SD_CMD_SEND_IF_COND: u32 = 8;
pub const SD_CMD_SWITCH_UHS18V: u32 = 11;
pub const SD_CMD_ERASE_WR_BLK_START: u32 = 32;
pub const SD_CMD_ERASE_WR_BLK_END: u32 = 33;

// SD application commands (preceded by CMD55)
pub const SD_CMD_APP_SET_BUS_WIDTH: u32 = 6;
pub const SD_CMD_APP_SD_STATUS: u32 = 13;
pub const SD_CMD_APP_SEND_OP_COND: u32 = 41;
pub const SD_CMD_APP_SEND_SCR: u32 = 51;

// Erase argument values (CMD38)
pub const MMC_ERASE_ARG: u32 = 0x0000_0000;
pub const MMC_TRIM_ARG: u32 = 0x0000_0001;
pub const MMC_SECURE_ERASE_ARG: u32 = 0x8000_0000;
pub const SD_ERASE_ARG: u32 = 0x0000_0000;
pub const SD_DISCARD_ARG: u32 = 0x0000_0001;

// OCR bits
pub const OCR_BUSY: u32 = 0x8000_0000;
pub const OCR_HCS: u32 = 0x4000_0000;
pub const OCR_CCS: u32 = 0x4000_0000;
pub const OCR_XPC: u32 = 0x1000_0000;
pub const OCR_S18R: u32 = 0x0100_0000;
pub const OCR_VOLTAGE_MASK: u32 = 0x007F_FF80;
pub const OCR_ACCESS_MODE_SECTOR: u32 = 0x4000_0000;

pub const MMC_VDD_165_195: u32 = 0x0000_0080;
pub const MMC_VDD_32_33: u32 = 0x0010_0000;
pub const MMC_VDD_33_34: u32 = 0x0020_0000;

// CMD8 (SEND_IF_COND) argument: 2.7-3.6V supply plus check pattern
pub const SD_IF_COND_ARG: u32 = 0x0000_01AA;

// R1 card status bits
pub const R1_APP_CMD: u32 = 1 << 5;
pub const R1_SWITCH_ERROR: u32 = 1 << 7;
pub const R1_READY_FOR_DATA: u32 = 1 << 8;
pub const R1_ERASE_RESET: u32 = 1 << 13;
pub const R1_WP_VIOLATION: u32 = 1 << 26;
pub const R1_CARD_IS_LOCKED: u32 = 1 << 25;
pub const R1_ILLEGAL_COMMAND: u32 = 1 << 22;
pub const R1_CURRENT_STATE_MASK: u32 = 0xF << 9;
pub const R1_CURRENT_STATE_SHIFT: u32 = 9;
pub const R1_STATE_PRG: u32 = 7;

// SD switch function (CMD6): group 1 is the bus-speed group
pub const SD_SWITCH_CHECK: u32 = 0;
pub const SD_SWITCH_SET: u32 = 1;
pub const SD_SWITCH_GRP_BUS_SPEED: u32 = 0;
pub const SD_SWITCH_BUS_SPEED_HS: u32 = 1;
pub const SD_SWITCH_BUS_SPEED_SDR50: u32 = 2;
pub const SD_SWITCH_BUS_SPEED_SDR104: u32 = 3;
pub const SD_SWITCH_BUS_SPEED_DDR50: u32 = 4;
pub const SD_SWITCH_STATUS_LEN: u32 = 64;
// Function-group-1 result nibble lives in byte 16 of the 64-byte status,
// selected function in the low nibble; byte 13 carries the support bits.
pub const SD_SWITCH_GRP1_SUPPORT_BYTE: usize = 13;
pub const SD_SWITCH_GRP1_RESULT_BYTE: usize = 16;

// MMC SWITCH (CMD6) access modes
pub const MMC_SWITCH_MODE_WRITE_BYTE: u32 = 0x03;

// Extended CSD byte offsets
pub const EXT_CSD_CACHE_CTRL: usize = 33;
pub const EXT_CSD_ERASE_GROUP_DEF: usize = 175;
pub const EXT_CSD_PARTITION_CONFIG: usize = 179;
pub const EXT_CSD_ERASED_MEM_CONT: usize = 181;
pub const EXT_CSD_BUS_WIDTH: usize = 183;
pub const EXT_CSD_HS_TIMING: usize = 185;
pub const EXT_CSD_REV: usize = 192;
pub const EXT_CSD_STRUCTURE: usize = 194;
pub const EXT_CSD_DEVICE_TYPE: usize = 196;
pub const EXT_CSD_SEC_COUNT: usize = 212;
pub const EXT_CSD_ERASE_TIMEOUT_MULT: usize = 223;
pub const EXT_CSD_HC_ERASE_GRP_SIZE: usize = 224;
pub const EXT_CSD_SEC_FEATURE_SUPPORT: usize = 231;
pub const EXT_CSD_TRIM_MULT: usize = 232;
pub const EXT_CSD_GENERIC_CMD6_TIME: usize = 248;
pub const EXT_CSD_CACHE_SIZE: usize = 249;
pub const EXT_CSD_LEN: usize = 512;

// EXT_CSD_DEVICE_TYPE bits
pub const EXT_CSD_CARD_TYPE_HS_26: u8 = 1 << 0;
pub const EXT_CSD_CARD_TYPE_HS_52: u8 = 1 << 1;
pub const EXT_CSD_CARD_TYPE_DDR_1_8V: u8 = 1 << 2;
pub const EXT_CSD_CARD_TYPE_DDR_1_2V: u8 = 1 << 3;
pub const EXT_CSD_CARD_TYPE_HS200_1_8V: u8 = 1 << 4;
pub const EXT_CSD_CARD_TYPE_HS200_1_2V: u8 = 1 << 5;
pub const EXT_CSD_CARD_TYPE_HS400_1_8V: u8 = 1 << 6;
pub const EXT_CSD_CARD_TYPE_HS400_1_2V: u8 = 1 << 7;

// EXT_CSD_SEC_FEATURE_SUPPORT bits
pub const EXT_CSD_SEC_ER_EN: u8 = 1 << 0;
pub const EXT_CSD_SEC_GB_CL_EN: u8 = 1 << 4;
pub const EXT_CSD_SEC_SANITIZE: u8 = 1 << 6;

// EXT_CSD_BUS_WIDTH values
pub const EXT_CSD_BUS_WIDTH_1: u8 = 0;
pub const EXT_CSD_BUS_WIDTH_4: u8 = 1;
pub const EXT_CSD_BUS_WIDTH_8: u8 = 2;
pub const EXT_CSD_DDR_BUS_WIDTH_4: u8 = 5;
pub const EXT_CSD_DDR_BUS_WIDTH_8: u8 = 6;

// EXT_CSD_HS_TIMING values
pub const EXT_CSD_TIMING_LEGACY: u8 = 0;
pub const EXT_CSD_TIMING_HS: u8 = 1;
pub const EXT_CSD_TIMING_HS200: u8 = 2;
pub const EXT_CSD_TIMING_HS400: u8 = 3;

/// Default sector size for every card this stack drives.
pub const SDMMC_DEFAULT_BLOCK_LEN: u32 = 512;

/// Clock rate used from power-up until the card leaves the ident states.
pub const INIT_CLOCK_RATE: u64 = 400_000;

/// Build a CMD6 argument for the MMC write-byte access mode.
pub const fn mmc_switch_arg(index: usize, value: u8) -> u32 {
    (MMC_SWITCH_MODE_WRITE_BYTE << 24) | ((index as u32) << 16) | ((value as u32) << 8)
}

/// Build a CMD6 argument for the SD switch-function command. Every group
/// defaults to 0xF ("no change"); only `group` is narrowed to `value`.
pub const fn sd_switch_arg(mode: u32, group: u32, value: u32) -> u32 {
    let base = (mode << 31) | 0x00FF_FFFF;
    (base & !(0xF << (group * 4))) | (value << (group * 4))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switch_arg_targets_single_group() {
        let arg = sd_switch_arg(SD_SWITCH_SET, SD_SWITCH_GRP_BUS_SPEED, SD_SWITCH_BUS_SPEED_HS);
        assert_eq!(arg, 0x80FF_FFF1);
        // Check mode leaves all groups untouched except the queried one.
        let check = sd_switch_arg(SD_SWITCH_CHECK, SD_SWITCH_GRP_BUS_SPEED, 0xF);
        assert_eq!(check, 0x00FF_FFFF);
    }

    #[test]
    fn mmc_switch_arg_write_byte() {
        let arg = mmc_switch_arg(EXT_CSD_HS_TIMING, EXT_CSD_TIMING_HS200);
        assert_eq!(arg, 0x03B9_0200);
    }
}
