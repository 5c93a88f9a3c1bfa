//! Attach-time options, parsed from a comma-delimited key[=value] string.
//!
//! Recognized keys: `verbose`, `priority`, `hc`, `vid`, `did`, `idx`,
//! `addr`, `irq`, `dma`, `clk`, `bw`, `timing`, `~bmstr`, `~ac12`,
//! `~ac23`, `pm`, `bs`, `emmc`. A leading `~` disables the named hardware
//! feature for this controller.

use super::sdmmc_capability::*;
use crate::sdmmc::SdmmcError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdmmcConfig {
    /// Log verbosity, 0 (errors only) to 5 (trace).
    pub verbose: u8,
    /// Scheduling priority for the controller worker.
    pub priority: Option<u32>,
    /// Host-controller family to bind (`hc=sdhci`).
    pub host_family: Option<String>,
    pub vendor_id: Option<u16>,
    pub device_id: Option<u16>,
    /// Controller index when several identical hosts are present.
    pub index: Option<u32>,
    /// Register window physical address.
    pub base_addr: Option<u64>,
    pub irq: Option<u32>,
    /// DMA channel or engine base, family-specific meaning.
    pub dma: Option<u64>,
    /// Initial clock rate override in Hz.
    pub clock: Option<u64>,
    /// Widest data bus to use (1, 4 or 8).
    pub bus_width_limit: Option<u8>,
    /// Fastest timing tier to negotiate.
    pub timing_limit: Option<TimingLimit>,
    pub disable_bus_master: bool,
    pub disable_auto_cmd12: bool,
    pub disable_auto_cmd23: bool,
    /// Idle and sleep power-management delays in milliseconds.
    pub pm_idle_ms: Option<u32>,
    pub pm_sleep_ms: Option<u32>,
    /// Board-specific option string passed through to the hardware layer.
    pub board_spec: Option<String>,
    /// Hint that the slot carries a soldered-down eMMC part.
    pub emmc: bool,
    /// Consecutive bus errors tolerated before capability escalation.
    pub bus_error_limit: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingLimit {
    Legacy,
    Hs,
    Ddr,
    Hs200,
    Hs400,
}

impl Default for SdmmcConfig {
    fn default() -> Self {
        SdmmcConfig {
            verbose: 0,
            priority: None,
            host_family: None,
            vendor_id: None,
            device_id: None,
            index: None,
            base_addr: None,
            irq: None,
            dma: None,
            clock: None,
            bus_width_limit: None,
            timing_limit: None,
            disable_bus_master: false,
            disable_auto_cmd12: false,
            disable_auto_cmd23: false,
            pm_idle_ms: None,
            pm_sleep_ms: None,
            board_spec: None,
            emmc: false,
            bus_error_limit: 3,
        }
    }
}

fn parse_num<T: TryFrom<u64>>(value: &str) -> Result<T, SdmmcError> {
    let parsed = if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        value.parse::<u64>()
    };
    parsed
        .ok()
        .and_then(|v| T::try_from(v).ok())
        .ok_or(SdmmcError::EINVAL)
}

impl SdmmcConfig {
    pub fn parse(options: &str) -> Result<SdmmcConfig, SdmmcError> {
        let mut cfg = SdmmcConfig::default();

        for opt in options.split(',') {
            let opt = opt.trim();
            if opt.is_empty() {
                continue;
            }
            let (key, value) = match opt.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (opt, None),
            };

            match (key, value) {
                ("verbose", v) => cfg.verbose = v.map(parse_num).transpose()?.unwrap_or(1),
                ("priority", Some(v)) => cfg.priority = Some(parse_num(v)?),
                ("hc", Some(v)) => cfg.host_family = Some(v.to_string()),
                ("vid", Some(v)) => cfg.vendor_id = Some(parse_num(v)?),
                ("did", Some(v)) => cfg.device_id = Some(parse_num(v)?),
                ("idx", Some(v)) => cfg.index = Some(parse_num(v)?),
                ("addr", Some(v)) => cfg.base_addr = Some(parse_num(v)?),
                ("irq", Some(v)) => cfg.irq = Some(parse_num(v)?),
                ("dma", Some(v)) => cfg.dma = Some(parse_num(v)?),
                ("clk", Some(v)) => cfg.clock = Some(parse_num(v)?),
                ("bw", Some(v)) => {
                    let width: u8 = parse_num(v)?;
                    if !matches!(width, 1 | 4 | 8) {
                        return Err(SdmmcError::EINVAL);
                    }
                    cfg.bus_width_limit = Some(width);
                }
                ("timing", Some(v)) => {
                    cfg.timing_limit = Some(match v {
                        "legacy" => TimingLimit::Legacy,
                        "hs" => TimingLimit::Hs,
                        "ddr" => TimingLimit::Ddr,
                        "hs200" => TimingLimit::Hs200,
                        "hs400" => TimingLimit::Hs400,
                        _ => return Err(SdmmcError::EINVAL),
                    });
                }
                ("~bmstr", None) => cfg.disable_bus_master = true,
                ("~ac12", None) => cfg.disable_auto_cmd12 = true,
                ("~ac23", None) => cfg.disable_auto_cmd23 = true,
                ("pm", Some(v)) => {
                    let (idle, sleep) = v.split_once(':').ok_or(SdmmcError::EINVAL)?;
                    cfg.pm_idle_ms = Some(parse_num(idle)?);
                    cfg.pm_sleep_ms = Some(parse_num(sleep)?);
                }
                ("bs", Some(v)) => cfg.board_spec = Some(v.to_string()),
                ("emmc", None) => cfg.emmc = true,
                _ => return Err(SdmmcError::EINVAL),
            }
        }

        Ok(cfg)
    }

    /// Capability bits this configuration withholds from the host mask.
    pub fn capability_mask(&self) -> u128 {
        let mut deny = 0u128;

        if let Some(width) = self.bus_width_limit {
            if width < 8 {
                deny |= MMC_CAP_8_BIT_DATA;
            }
            if width < 4 {
                deny |= MMC_CAP_4_BIT_DATA;
            }
        }

        let tier_bits = |limit: TimingLimit| -> u128 {
            match limit {
                TimingLimit::Legacy => {
                    MMC_TIMING_MMC_HS
                        | MMC_TIMING_SD_HS
                        | MMC_TIMING_MMC_DDR52
                        | MMC_TIMING_UHS_DDR50
                        | MMC_TIMING_UHS_SDR50
                        | MMC_TIMING_UHS_SDR104
                        | MMC_TIMING_MMC_HS200
                        | MMC_TIMING_MMC_HS400
                }
                TimingLimit::Hs => {
                    MMC_TIMING_MMC_DDR52
                        | MMC_TIMING_UHS_DDR50
                        | MMC_TIMING_UHS_SDR50
                        | MMC_TIMING_UHS_SDR104
                        | MMC_TIMING_MMC_HS200
                        | MMC_TIMING_MMC_HS400
                }
                TimingLimit::Ddr => {
                    MMC_TIMING_UHS_SDR50
                        | MMC_TIMING_UHS_SDR104
                        | MMC_TIMING_MMC_HS200
                        | MMC_TIMING_MMC_HS400
                }
                TimingLimit::Hs200 => MMC_TIMING_MMC_HS400,
                TimingLimit::Hs400 => 0,
            }
        };
        if let Some(limit) = self.timing_limit {
            deny |= tier_bits(limit);
        }

        if self.disable_bus_master {
            deny |= MMC_CAP_BUS_MASTER;
        }
        if self.disable_auto_cmd12 {
            deny |= MMC_CAP_AUTO_CMD12;
        }
        if self.disable_auto_cmd23 {
            deny |= MMC_CAP_AUTO_CMD23;
        }

        deny
    }

    pub fn log_level(&self) -> log::LevelFilter {
        match self.verbose {
            0 => log::LevelFilter::Error,
            1 => log::LevelFilter::Warn,
            2 => log::LevelFilter::Info,
            3 | 4 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_option_string() {
        let cfg = SdmmcConfig::parse(
            "verbose=3,priority=21,hc=sdhci,vid=0x1106,did=0x95D0,idx=1,addr=0xFE340000,\
             irq=35,dma=0x100,clk=400000,bw=4,timing=hs200,~bmstr,~ac12,~ac23,\
             pm=100:10000,bs=odroid,emmc",
        )
        .unwrap();

        assert_eq!(cfg.verbose, 3);
        assert_eq!(cfg.priority, Some(21));
        assert_eq!(cfg.host_family.as_deref(), Some("sdhci"));
        assert_eq!(cfg.vendor_id, Some(0x1106));
        assert_eq!(cfg.device_id, Some(0x95D0));
        assert_eq!(cfg.index, Some(1));
        assert_eq!(cfg.base_addr, Some(0xFE34_0000));
        assert_eq!(cfg.irq, Some(35));
        assert_eq!(cfg.dma, Some(0x100));
        assert_eq!(cfg.clock, Some(400_000));
        assert_eq!(cfg.bus_width_limit, Some(4));
        assert_eq!(cfg.timing_limit, Some(TimingLimit::Hs200));
        assert!(cfg.disable_bus_master);
        assert!(cfg.disable_auto_cmd12);
        assert!(cfg.disable_auto_cmd23);
        assert_eq!(cfg.pm_idle_ms, Some(100));
        assert_eq!(cfg.pm_sleep_ms, Some(10_000));
        assert_eq!(cfg.board_spec.as_deref(), Some("odroid"));
        assert!(cfg.emmc);
    }

    #[test]
    fn unknown_key_is_rejected() {
        assert!(SdmmcConfig::parse("bogus=1").is_err());
        assert!(SdmmcConfig::parse("bw=3").is_err());
        assert!(SdmmcConfig::parse("timing=warp").is_err());
        assert!(SdmmcConfig::parse("pm=100").is_err());
    }

    #[test]
    fn empty_string_gives_defaults() {
        let cfg = SdmmcConfig::parse("").unwrap();
        assert_eq!(cfg, SdmmcConfig::default());
    }

    #[test]
    fn capability_mask_narrows() {
        let cfg = SdmmcConfig::parse("bw=4,timing=hs,~ac23").unwrap();
        let deny = cfg.capability_mask();
        assert_ne!(deny & MMC_CAP_8_BIT_DATA, 0);
        assert_eq!(deny & MMC_CAP_4_BIT_DATA, 0);
        assert_ne!(deny & MMC_TIMING_MMC_HS200, 0);
        assert_eq!(deny & MMC_TIMING_MMC_HS, 0);
        assert_ne!(deny & MMC_CAP_AUTO_CMD23, 0);
        assert_eq!(deny & MMC_CAP_AUTO_CMD12, 0);
    }
}
